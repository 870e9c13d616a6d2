//! Store: SQLite-backed fragment log, run status tracker, and derived-object
//! persistence.
//!
//! The store is used as a durable keyed store plus a handful of atomic
//! conditional updates:
//! - `mark_dirty` is insert-or-increment, never read-modify-write
//! - `claim_dirty` is a single `UPDATE … RETURNING`
//! - `complete` only lands while the claim is still current

mod fragments;
mod lease;
mod run_status;
mod runs;
mod schema;

pub use lease::LeaseGrant;
pub use runs::default_collection_name;
pub use schema::TRACEFOLD_SCHEMA;

use crate::error::{StoreError, StoreResult};
use crate::model::{AgentRun, Collection, Fragment, FragmentCategory, FragmentKey, RunStatus};
use rusqlite::Connection;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite-backed store. Cheap to clone; clones share one connection.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open a file-backed store.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Create an in-memory store (for testing).
    pub fn memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    /// Create store from existing connection (for multi-connection tests).
    pub fn from_connection(conn: Connection) -> StoreResult<Self> {
        Self::init_connection(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_connection(conn: &Connection) -> StoreResult<()> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        // WAL mode for file-backed DBs (no-op for in-memory)
        let _ = conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()));
        conn.execute_batch(TRACEFOLD_SCHEMA)?;
        Ok(())
    }

    pub(crate) fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    // ---- collections -------------------------------------------------

    /// Create the collection with a derived default name if it does not exist.
    /// Returns true if it was created.
    pub fn ensure_collection(&self, collection_id: &str) -> StoreResult<bool> {
        let conn = self.lock()?;
        runs::ensure_collection_impl(&conn, collection_id)
    }

    pub fn collection(&self, collection_id: &str) -> StoreResult<Option<Collection>> {
        let conn = self.lock()?;
        runs::collection_impl(&conn, collection_id)
    }

    // ---- accumulation store ------------------------------------------

    /// Append one immutable fragment. Referenced runs, groups, and
    /// transcripts do not need to exist yet.
    pub fn append(
        &self,
        key: &FragmentKey,
        category: FragmentCategory,
        payload: &Value,
    ) -> StoreResult<i64> {
        let conn = self.lock()?;
        fragments::append_impl(&conn, key, category, payload)
    }

    /// Fragments under `key` (prefix match), in arrival order.
    pub fn query(
        &self,
        key: &FragmentKey,
        category: FragmentCategory,
    ) -> StoreResult<Vec<Fragment>> {
        let conn = self.lock()?;
        fragments::query_impl(&conn, key, category)
    }

    /// Ingestion write path: make sure the collection exists, append every
    /// fragment, and mark their runs dirty in one transaction. A fragment is
    /// never stored without the version bump that makes a pass pick it up.
    pub fn append_batch(
        &self,
        collection_id: &str,
        batch: &[(FragmentKey, FragmentCategory, Value)],
    ) -> StoreResult<Vec<i64>> {
        let conn = self.lock()?;
        with_immediate_txn(&conn, |conn| {
            runs::ensure_collection_impl(conn, collection_id)?;
            let mut ids = Vec::with_capacity(batch.len());
            let mut run_ids = BTreeSet::new();
            for (key, category, payload) in batch {
                ids.push(fragments::append_impl(conn, key, *category, payload)?);
                run_ids.extend(key.agent_run_id.clone());
            }
            run_status::mark_dirty_rows(conn, collection_id, &run_ids)?;
            Ok(ids)
        })
    }

    pub fn fragment_count(&self, collection_id: &str) -> StoreResult<i64> {
        let conn = self.lock()?;
        fragments::count_impl(&conn, collection_id)
    }

    // ---- run status tracker ------------------------------------------

    /// Mark runs dirty in one atomic batch: insert fresh rows, or bump the
    /// version of existing ones and reset them to `NEEDS_PROCESSING`.
    pub fn mark_dirty(&self, collection_id: &str, run_ids: &BTreeSet<String>) -> StoreResult<()> {
        let conn = self.lock()?;
        run_status::mark_dirty_impl(&conn, collection_id, run_ids)
    }

    /// Claim every run in the collection that needs work. Each run id is
    /// returned with the version visible at claim time.
    pub fn claim_dirty(&self, collection_id: &str) -> StoreResult<BTreeMap<String, i64>> {
        let conn = self.lock()?;
        run_status::claim_dirty_impl(&conn, collection_id)
    }

    /// Mark a claimed run completed at `version`. Returns false (and changes
    /// nothing) if the run was dirtied again since the claim.
    pub fn complete(&self, run_id: &str, version: i64) -> StoreResult<bool> {
        let conn = self.lock()?;
        run_status::complete_impl(&conn, run_id, version)
    }

    /// Record a failed attempt. Returns the resulting status row.
    pub fn fail(
        &self,
        run_id: &str,
        message: &str,
        max_retries: u32,
        history_len: usize,
    ) -> StoreResult<RunStatus> {
        let conn = self.lock()?;
        run_status::fail_impl(&conn, run_id, message, max_retries, history_len)
    }

    pub fn has_remaining_work(&self, collection_id: &str) -> StoreResult<bool> {
        let conn = self.lock()?;
        run_status::has_remaining_work_impl(&conn, collection_id)
    }

    /// Hand runs stuck in `PROCESSING` for longer than `older_than` back to
    /// `NEEDS_PROCESSING`. Returns the reclaimed run ids.
    pub fn reclaim_stale(
        &self,
        collection_id: &str,
        older_than: Duration,
    ) -> StoreResult<Vec<String>> {
        let conn = self.lock()?;
        run_status::reclaim_stale_impl(&conn, collection_id, older_than)
    }

    pub fn run_status(&self, run_id: &str) -> StoreResult<Option<RunStatus>> {
        let conn = self.lock()?;
        run_status::get_impl(&conn, run_id)
    }

    pub fn list_run_statuses(&self, collection_id: &str) -> StoreResult<Vec<RunStatus>> {
        let conn = self.lock()?;
        run_status::list_impl(&conn, collection_id)
    }

    // ---- collection leases -------------------------------------------

    /// Try to take the processing lease for a collection. Never waits.
    pub fn try_acquire_lease(
        &self,
        collection_id: &str,
        holder: &str,
        ttl: Duration,
    ) -> StoreResult<Option<LeaseGrant>> {
        let conn = self.lock()?;
        lease::try_acquire_impl(&conn, collection_id, holder, ttl)
    }

    pub fn release_lease(&self, collection_id: &str, holder: &str) -> StoreResult<bool> {
        let conn = self.lock()?;
        lease::release_impl(&conn, collection_id, holder)
    }

    // ---- derived objects ---------------------------------------------

    /// Ids among `group_ids` already stored for `run_id`.
    pub fn existing_group_ids(
        &self,
        run_id: &str,
        group_ids: &BTreeSet<String>,
    ) -> StoreResult<BTreeSet<String>> {
        let conn = self.lock()?;
        runs::existing_group_ids_impl(&conn, run_id, group_ids)
    }

    /// Persist a reconstructed run: upsert the run and its groups,
    /// replace its transcripts wholesale. Groups must already be in
    /// parent-before-child order.
    pub fn save_agent_run(&self, run: &AgentRun) -> StoreResult<()> {
        let conn = self.lock()?;
        with_immediate_txn(&conn, |conn| runs::save_agent_run_impl(conn, run))
    }

    pub fn load_agent_run(&self, run_id: &str) -> StoreResult<Option<AgentRun>> {
        let conn = self.lock()?;
        runs::load_agent_run_impl(&conn, run_id)
    }

    /// Bulk teardown of one run: fragments, status, and derived objects.
    pub fn delete_run(&self, run_id: &str) -> StoreResult<()> {
        let conn = self.lock()?;
        with_immediate_txn(&conn, |conn| runs::delete_run_impl(conn, run_id))
    }

    /// Bulk teardown of a collection and everything under it.
    pub fn delete_collection(&self, collection_id: &str) -> StoreResult<()> {
        let conn = self.lock()?;
        with_immediate_txn(&conn, |conn| {
            runs::delete_collection_impl(conn, collection_id)
        })
    }
}

/// Run `f` inside `BEGIN IMMEDIATE`, which takes the write lock up front so
/// concurrent writers queue on the busy timeout instead of failing mid-way.
pub(crate) fn with_immediate_txn<T>(
    conn: &Connection,
    f: impl FnOnce(&Connection) -> StoreResult<T>,
) -> StoreResult<T> {
    conn.execute_batch("BEGIN IMMEDIATE")?;
    let result = f(conn);
    match result {
        Ok(value) => match conn.execute_batch("COMMIT") {
            Ok(()) => Ok(value),
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                Err(e.into())
            }
        },
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

pub(crate) fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}
