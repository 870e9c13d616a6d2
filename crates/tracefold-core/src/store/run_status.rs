//! Dirty-bit version tracking.
//!
//! A run needs work iff `status = NEEDS_PROCESSING` or it completed at a
//! version older than `current_version`. `ERROR` is terminal until the next
//! fragment arrives for the run.

use super::{now_unix, with_immediate_txn};
use crate::error::{StoreError, StoreResult};
use crate::model::{ErrorEntry, ProcessingStatus, RunStatus};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

const NEEDS_WORK_PREDICATE: &str = "(status = 'NEEDS_PROCESSING' \
     OR (status = 'COMPLETED' AND current_version > processed_version))";

pub(crate) fn mark_dirty_impl(
    conn: &Connection,
    collection_id: &str,
    run_ids: &BTreeSet<String>,
) -> StoreResult<()> {
    if run_ids.is_empty() {
        return Ok(());
    }
    with_immediate_txn(conn, |conn| mark_dirty_rows(conn, collection_id, run_ids))
}

/// Expects to run inside a transaction.
pub(crate) fn mark_dirty_rows(
    conn: &Connection,
    collection_id: &str,
    run_ids: &BTreeSet<String>,
) -> StoreResult<()> {
    let now = Utc::now().to_rfc3339();
    let mut stmt = conn.prepare_cached(
        r#"
        INSERT INTO run_status (
            run_id, collection_id, status, current_version, processed_version,
            error_count, error_history_json, claimed_at, updated_at
        ) VALUES (?1, ?2, 'NEEDS_PROCESSING', 1, 0, 0, '[]', NULL, ?3)
        ON CONFLICT(run_id) DO UPDATE SET
            status = 'NEEDS_PROCESSING',
            current_version = run_status.current_version + 1,
            error_count = 0,
            error_history_json = '[]',
            updated_at = excluded.updated_at
        "#,
    )?;
    for run_id in run_ids {
        stmt.execute(params![run_id, collection_id, now])?;
    }
    Ok(())
}

pub(crate) fn claim_dirty_impl(
    conn: &Connection,
    collection_id: &str,
) -> StoreResult<BTreeMap<String, i64>> {
    let sql = format!(
        r#"
        UPDATE run_status
        SET status = 'PROCESSING', claimed_at = ?2, updated_at = ?3
        WHERE collection_id = ?1 AND {}
        RETURNING run_id, current_version
        "#,
        NEEDS_WORK_PREDICATE
    );
    let now = Utc::now();
    with_immediate_txn(conn, |conn| {
        let mut stmt = conn.prepare(&sql)?;
        let claimed = stmt
            .query_map(
                params![collection_id, now.timestamp(), now.to_rfc3339()],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
            )?
            .collect::<Result<BTreeMap<_, _>, _>>()?;
        Ok(claimed)
    })
}

pub(crate) fn complete_impl(conn: &Connection, run_id: &str, version: i64) -> StoreResult<bool> {
    let changed = conn.execute(
        r#"
        UPDATE run_status
        SET status = 'COMPLETED', processed_version = ?2, claimed_at = NULL, updated_at = ?3
        WHERE run_id = ?1 AND status = 'PROCESSING' AND current_version = ?2
        "#,
        params![run_id, version, Utc::now().to_rfc3339()],
    )?;
    Ok(changed > 0)
}

pub(crate) fn fail_impl(
    conn: &Connection,
    run_id: &str,
    message: &str,
    max_retries: u32,
    history_len: usize,
) -> StoreResult<RunStatus> {
    with_immediate_txn(conn, |conn| {
        let mut current = get_impl(conn, run_id)?.ok_or_else(|| StoreError::NotFound {
            what: format!("run status for {}", run_id),
        })?;

        let now = Utc::now();
        current.error_count = current.error_count.saturating_add(1);
        current.error_history.push(ErrorEntry {
            message: message.to_string(),
            at: now,
        });
        let overflow = current.error_history.len().saturating_sub(history_len);
        current.error_history.drain(..overflow);
        current.status = if current.error_count <= max_retries {
            ProcessingStatus::NeedsProcessing
        } else {
            ProcessingStatus::Error
        };
        current.claimed_at = None;
        current.updated_at = now;

        conn.execute(
            r#"
            UPDATE run_status
            SET status = ?2, error_count = ?3, error_history_json = ?4,
                claimed_at = NULL, updated_at = ?5
            WHERE run_id = ?1
            "#,
            params![
                run_id,
                current.status.as_str(),
                current.error_count,
                serde_json::to_string(&current.error_history)?,
                now.to_rfc3339(),
            ],
        )?;
        Ok(current)
    })
}

pub(crate) fn has_remaining_work_impl(conn: &Connection, collection_id: &str) -> StoreResult<bool> {
    let sql = format!(
        "SELECT EXISTS(SELECT 1 FROM run_status WHERE collection_id = ?1 AND {})",
        NEEDS_WORK_PREDICATE
    );
    Ok(conn.query_row(&sql, [collection_id], |row| row.get(0))?)
}

pub(crate) fn reclaim_stale_impl(
    conn: &Connection,
    collection_id: &str,
    older_than: Duration,
) -> StoreResult<Vec<String>> {
    let cutoff = now_unix() - older_than.as_secs() as i64;
    with_immediate_txn(conn, |conn| {
        let mut stmt = conn.prepare(
            r#"
            UPDATE run_status
            SET status = 'NEEDS_PROCESSING', claimed_at = NULL, updated_at = ?3
            WHERE collection_id = ?1 AND status = 'PROCESSING'
              AND claimed_at IS NOT NULL AND claimed_at <= ?2
            RETURNING run_id
            "#,
        )?;
        let reclaimed = stmt
            .query_map(
                params![collection_id, cutoff, Utc::now().to_rfc3339()],
                |row| row.get::<_, String>(0),
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(reclaimed)
    })
}

const SELECT_COLUMNS: &str = "run_id, collection_id, status, current_version, processed_version, \
     error_count, error_history_json, claimed_at, updated_at";

pub(crate) fn get_impl(conn: &Connection, run_id: &str) -> StoreResult<Option<RunStatus>> {
    let sql = format!("SELECT {} FROM run_status WHERE run_id = ?1", SELECT_COLUMNS);
    let raw = conn
        .query_row(&sql, [run_id], RawStatusRow::from_row)
        .optional()?;
    raw.map(RawStatusRow::into_status).transpose()
}

pub(crate) fn list_impl(conn: &Connection, collection_id: &str) -> StoreResult<Vec<RunStatus>> {
    let sql = format!(
        "SELECT {} FROM run_status WHERE collection_id = ?1 ORDER BY run_id ASC",
        SELECT_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([collection_id], RawStatusRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(RawStatusRow::into_status).collect()
}

struct RawStatusRow {
    run_id: String,
    collection_id: String,
    status: String,
    current_version: i64,
    processed_version: i64,
    error_count: u32,
    error_history_json: String,
    claimed_at: Option<i64>,
    updated_at: String,
}

impl RawStatusRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            run_id: row.get(0)?,
            collection_id: row.get(1)?,
            status: row.get(2)?,
            current_version: row.get(3)?,
            processed_version: row.get(4)?,
            error_count: row.get(5)?,
            error_history_json: row.get(6)?,
            claimed_at: row.get(7)?,
            updated_at: row.get(8)?,
        })
    }

    fn into_status(self) -> StoreResult<RunStatus> {
        let corrupt = |message: String| StoreError::CorruptRow {
            table: "run_status",
            message,
        };
        let status = ProcessingStatus::parse(&self.status)
            .ok_or_else(|| corrupt(format!("unknown status {:?}", self.status)))?;
        let error_history: Vec<ErrorEntry> = serde_json::from_str(&self.error_history_json)
            .map_err(|e| corrupt(format!("error history: {}", e)))?;
        let updated_at = DateTime::parse_from_rfc3339(&self.updated_at)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| corrupt(format!("updated_at: {}", e)))?;
        let claimed_at = self
            .claimed_at
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single());

        Ok(RunStatus {
            run_id: self.run_id,
            collection_id: self.collection_id,
            status,
            current_version: self.current_version,
            processed_version: self.processed_version,
            error_count: self.error_count,
            error_history,
            claimed_at,
            updated_at,
        })
    }
}
