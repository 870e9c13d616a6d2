//! Per-collection processing leases.
//!
//! A lease row is taken with one conditional upsert: it succeeds when no row
//! exists, when the row has expired, or when the caller already holds it.

use super::now_unix;
use crate::error::StoreResult;
use rusqlite::{params, Connection};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseGrant {
    pub collection_id: String,
    pub holder: String,
    pub expires_at: i64,
}

pub(crate) fn try_acquire_impl(
    conn: &Connection,
    collection_id: &str,
    holder: &str,
    ttl: Duration,
) -> StoreResult<Option<LeaseGrant>> {
    let now = now_unix();
    let expires_at = now + ttl.as_secs().max(1) as i64;
    let changed = conn.execute(
        r#"
        INSERT INTO collection_locks (collection_id, holder, expires_at)
        VALUES (?1, ?2, ?3)
        ON CONFLICT(collection_id) DO UPDATE SET
            holder = excluded.holder,
            expires_at = excluded.expires_at
        WHERE collection_locks.expires_at <= ?4
           OR collection_locks.holder = excluded.holder
        "#,
        params![collection_id, holder, expires_at, now],
    )?;

    if changed == 0 {
        return Ok(None);
    }
    Ok(Some(LeaseGrant {
        collection_id: collection_id.to_string(),
        holder: holder.to_string(),
        expires_at,
    }))
}

pub(crate) fn release_impl(conn: &Connection, collection_id: &str, holder: &str) -> StoreResult<bool> {
    let changed = conn.execute(
        "DELETE FROM collection_locks WHERE collection_id = ?1 AND holder = ?2",
        params![collection_id, holder],
    )?;
    Ok(changed > 0)
}
