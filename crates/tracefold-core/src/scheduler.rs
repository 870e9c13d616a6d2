//! Claim scheduler: one processing pass for one collection.
//!
//! A pass runs under a non-blocking per-collection lock. It hands stale
//! claims back, claims every dirty run, rebuilds each one independently, and
//! asks for another pass if work is left afterwards. Correctness does not
//! depend on the lock: `complete` only lands at the version that was claimed.

use crate::assemble::{RunAssembler, RunRebuilder};
use crate::config::ProcessingConfig;
use crate::error::{ReconstructionError, StoreError, StoreResult};
use crate::model::ProcessingStatus;
use crate::otel::{IndexedGenAi, TranscriptSemConv};
use crate::queue::PassRequester;
use crate::store::Store;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Held for the duration of a pass; releases the lock when dropped.
pub struct CollectionGuard {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl CollectionGuard {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }
}

impl Drop for CollectionGuard {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

/// Non-blocking per-collection mutual exclusion.
pub trait CollectionLock: Send + Sync {
    /// `Ok(None)` when another holder has it.
    fn try_acquire(&self, collection_id: &str) -> StoreResult<Option<CollectionGuard>>;
}

/// Lease row in the store. A crashed holder's lease simply expires.
pub struct LeaseLock {
    store: Store,
    ttl: Duration,
}

impl LeaseLock {
    pub fn new(store: Store, ttl: Duration) -> Self {
        Self { store, ttl }
    }
}

impl CollectionLock for LeaseLock {
    fn try_acquire(&self, collection_id: &str) -> StoreResult<Option<CollectionGuard>> {
        // Unique per acquisition, so two passes in one process never share a lease.
        let holder = uuid::Uuid::new_v4().to_string();
        let Some(grant) = self.store.try_acquire_lease(collection_id, &holder, self.ttl)? else {
            return Ok(None);
        };
        debug!(collection = %collection_id, holder = %grant.holder, expires_at = grant.expires_at, "lease acquired");

        let store = self.store.clone();
        let collection_id = grant.collection_id;
        Ok(Some(CollectionGuard::new(move || {
            if let Err(e) = store.release_lease(&collection_id, &holder) {
                warn!(collection = %collection_id, error = %e, "failed to release lease; it will expire");
            }
        })))
    }
}

/// Counts for one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassReport {
    pub claimed: usize,
    pub completed: usize,
    /// Rebuilt, but new fragments arrived meanwhile; left dirty.
    pub superseded: usize,
    /// Failed and queued for retry.
    pub failed: usize,
    /// Failed past the retry limit; now `ERROR`.
    pub escalated: usize,
    pub reclaimed: usize,
    pub rescheduled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    /// Another pass holds the collection.
    Skipped,
    Ran(PassReport),
}

pub struct ClaimScheduler {
    store: Store,
    rebuilder: Arc<dyn RunRebuilder>,
    lock: Arc<dyn CollectionLock>,
    requester: Arc<dyn PassRequester>,
    config: ProcessingConfig,
}

impl ClaimScheduler {
    pub fn new(
        store: Store,
        lock: Arc<dyn CollectionLock>,
        requester: Arc<dyn PassRequester>,
        config: ProcessingConfig,
    ) -> Self {
        Self::with_semconv(store, lock, requester, config, Arc::new(IndexedGenAi))
    }

    pub fn with_semconv(
        store: Store,
        lock: Arc<dyn CollectionLock>,
        requester: Arc<dyn PassRequester>,
        config: ProcessingConfig,
        conv: Arc<dyn TranscriptSemConv + Send + Sync>,
    ) -> Self {
        let rebuilder = Arc::new(RunAssembler::new(store.clone(), conv));
        Self::with_rebuilder(store, lock, requester, config, rebuilder)
    }

    pub fn with_rebuilder(
        store: Store,
        lock: Arc<dyn CollectionLock>,
        requester: Arc<dyn PassRequester>,
        config: ProcessingConfig,
        rebuilder: Arc<dyn RunRebuilder>,
    ) -> Self {
        Self {
            store,
            rebuilder,
            lock,
            requester,
            config,
        }
    }

    /// Lease-locked scheduler with the default conventions.
    pub fn with_lease(store: Store, requester: Arc<dyn PassRequester>, config: ProcessingConfig) -> Self {
        let lock = Arc::new(LeaseLock::new(store.clone(), config.lock_lease()));
        Self::new(store, lock, requester, config)
    }

    /// Run one pass. A store outage aborts the pass; runs claimed so far stay
    /// `PROCESSING` until a later pass reclaims them.
    pub fn run_pass(&self, collection_id: &str) -> StoreResult<PassOutcome> {
        let Some(guard) = self.lock.try_acquire(collection_id)? else {
            info!(collection = %collection_id, "pass already in flight; skipping");
            return Ok(PassOutcome::Skipped);
        };

        let mut report = PassReport::default();
        let reclaimed = self
            .store
            .reclaim_stale(collection_id, self.config.stale_claim_after())?;
        if !reclaimed.is_empty() {
            warn!(collection = %collection_id, runs = ?reclaimed, "reclaimed stale claims");
        }
        report.reclaimed = reclaimed.len();

        let claimed = self.store.claim_dirty(collection_id)?;
        report.claimed = claimed.len();
        info!(collection = %collection_id, claimed = claimed.len(), "pass started");

        for (run_id, version) in &claimed {
            match self.rebuilder.rebuild(collection_id, run_id) {
                Ok(_) => {
                    if self.store.complete(run_id, *version)? {
                        report.completed += 1;
                    } else {
                        debug!(run_id = %run_id, version, "run changed during pass; left dirty");
                        report.superseded += 1;
                    }
                }
                Err(ReconstructionError::Store(e)) if e.is_unavailable() => {
                    error!(collection = %collection_id, run_id = %run_id, error = %e, "store unavailable; aborting pass");
                    return Err(e);
                }
                Err(e) => self.record_failure(run_id, &e, &mut report)?,
            }
        }
        drop(guard);

        report.rescheduled = self.store.has_remaining_work(collection_id)?;
        if report.rescheduled {
            self.requester.request_processing_pass(collection_id);
        }
        info!(
            collection = %collection_id,
            completed = report.completed,
            superseded = report.superseded,
            failed = report.failed,
            escalated = report.escalated,
            rescheduled = report.rescheduled,
            "pass finished"
        );
        Ok(PassOutcome::Ran(report))
    }

    fn record_failure(
        &self,
        run_id: &str,
        err: &ReconstructionError,
        report: &mut PassReport,
    ) -> Result<(), StoreError> {
        let status = self.store.fail(
            run_id,
            &err.to_string(),
            self.config.max_retries,
            self.config.error_history_len,
        )?;
        if status.status == ProcessingStatus::Error {
            error!(run_id = %run_id, attempts = status.error_count, error = %err, "run failed permanently");
            report.escalated += 1;
        } else {
            warn!(run_id = %run_id, attempts = status.error_count, error = %err, "run failed; will retry");
            report.failed += 1;
        }
        Ok(())
    }

    /// Run passes back to back until nothing is left to do or `max_passes`
    /// is reached. For drivers without a queue.
    pub fn drain(&self, collection_id: &str) -> StoreResult<Vec<PassReport>> {
        let mut reports = Vec::new();
        for _ in 0..self.config.max_passes {
            match self.run_pass(collection_id)? {
                PassOutcome::Skipped => break,
                PassOutcome::Ran(report) => {
                    let again = report.rescheduled;
                    reports.push(report);
                    if !again {
                        break;
                    }
                }
            }
        }
        Ok(reports)
    }

    pub fn store(&self) -> &Store {
        &self.store
    }
}
