//! Processing-pass requests.
//!
//! Ingestion and the scheduler only ever say "collection X needs a pass";
//! whoever implements [`PassRequester`] decides when that pass runs. Requests
//! for a collection that already has one pending are dropped.

use crate::error::StoreResult;
use crate::scheduler::{ClaimScheduler, PassOutcome};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

/// Fire-and-forget scheduling of a processing pass.
pub trait PassRequester: Send + Sync {
    fn request_processing_pass(&self, collection_id: &str);
}

/// For drivers that poll `has_remaining_work` themselves.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRequester;

impl PassRequester for NoopRequester {
    fn request_processing_pass(&self, collection_id: &str) {
        debug!(collection = %collection_id, "pass request ignored");
    }
}

/// In-process request queue: a deduplicated pending set in front of an
/// unbounded tokio channel.
#[derive(Clone)]
pub struct ProcessingQueue {
    pending: Arc<Mutex<HashSet<String>>>,
    tx: mpsc::UnboundedSender<String>,
}

/// Receiving half of a [`ProcessingQueue`].
pub struct QueueReceiver {
    pending: Arc<Mutex<HashSet<String>>>,
    rx: mpsc::UnboundedReceiver<String>,
}

impl ProcessingQueue {
    pub fn new() -> (Self, QueueReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(Mutex::new(HashSet::new()));
        (
            Self {
                pending: pending.clone(),
                tx,
            },
            QueueReceiver { pending, rx },
        )
    }

    /// Collections with a request not yet picked up.
    pub fn pending(&self) -> Vec<String> {
        match self.pending.lock() {
            Ok(set) => {
                let mut out: Vec<_> = set.iter().cloned().collect();
                out.sort();
                out
            }
            Err(_) => Vec::new(),
        }
    }
}

impl PassRequester for ProcessingQueue {
    fn request_processing_pass(&self, collection_id: &str) {
        let newly_pending = match self.pending.lock() {
            Ok(mut set) => set.insert(collection_id.to_string()),
            // Poisoned set: deliver anyway, a duplicate pass is harmless.
            Err(_) => true,
        };
        if !newly_pending {
            debug!(collection = %collection_id, "pass already pending");
            return;
        }
        if self.tx.send(collection_id.to_string()).is_err() {
            warn!(collection = %collection_id, "processing worker has stopped; request dropped");
            if let Ok(mut set) = self.pending.lock() {
                set.remove(collection_id);
            }
        }
    }
}

impl QueueReceiver {
    /// Next requested collection, clearing its pending mark. `None` once
    /// every sender is gone.
    pub async fn next(&mut self) -> Option<String> {
        let collection_id = self.rx.recv().await?;
        if let Ok(mut set) = self.pending.lock() {
            set.remove(&collection_id);
        }
        Some(collection_id)
    }
}

/// Run passes as requests arrive until the queue closes and every running
/// pass has finished. Passes for different collections run side by side on
/// the blocking pool. A request for a collection whose pass is still running
/// is held and replayed once that pass ends.
pub async fn run_worker(mut receiver: QueueReceiver, scheduler: Arc<ClaimScheduler>) {
    info!("processing worker started");
    let mut running = JoinSet::new();
    let mut in_flight: HashSet<String> = HashSet::new();
    let mut replay: HashSet<String> = HashSet::new();
    let mut open = true;

    loop {
        tokio::select! {
            next = receiver.next(), if open => match next {
                Some(collection_id) if in_flight.contains(&collection_id) => {
                    debug!(collection = %collection_id, "pass running; request held");
                    replay.insert(collection_id);
                }
                Some(collection_id) => {
                    in_flight.insert(collection_id.clone());
                    spawn_pass(&mut running, &scheduler, collection_id);
                }
                None => open = false,
            },
            Some(joined) = running.join_next() => {
                let Ok((collection_id, result)) = joined else {
                    error!("pass task cancelled");
                    continue;
                };
                log_pass(&collection_id, result);
                if replay.remove(&collection_id) {
                    spawn_pass(&mut running, &scheduler, collection_id);
                } else {
                    in_flight.remove(&collection_id);
                }
            },
            else => break,
        }
    }
    info!("processing worker stopped");
}

type PassResult = Result<StoreResult<PassOutcome>, JoinError>;

fn spawn_pass(
    running: &mut JoinSet<(String, PassResult)>,
    scheduler: &Arc<ClaimScheduler>,
    collection_id: String,
) {
    let scheduler = scheduler.clone();
    running.spawn(async move {
        let id = collection_id.clone();
        let result = tokio::task::spawn_blocking(move || scheduler.run_pass(&id)).await;
        (collection_id, result)
    });
}

fn log_pass(collection_id: &str, result: PassResult) {
    match result {
        Ok(Ok(PassOutcome::Ran(report))) => {
            debug!(collection = %collection_id, ?report, "pass finished");
        }
        Ok(Ok(PassOutcome::Skipped)) => {
            debug!(collection = %collection_id, "pass skipped");
        }
        Ok(Err(e)) => {
            error!(collection = %collection_id, error = %e, "pass aborted");
        }
        Err(e) => {
            error!(collection = %collection_id, error = %e, "pass panicked");
        }
    }
}
