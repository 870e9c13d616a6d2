//! Collections and derived run objects.
//!
//! Runs are upserted by id, groups by `(agent_run_id, id)`. Transcripts carry
//! no identity worth keeping across reconstructions and are replaced wholesale
//! per run. Group and transcript ids only need to be unique within a run.

use crate::error::{StoreError, StoreResult};
use crate::model::{AgentRun, ChatMessage, Collection, Transcript, TranscriptGroup};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

pub fn default_collection_name(collection_id: &str) -> String {
    let short: String = collection_id.chars().take(8).collect();
    format!("Collection {}", short)
}

pub(crate) fn ensure_collection_impl(conn: &Connection, collection_id: &str) -> StoreResult<bool> {
    let changed = conn.execute(
        r#"
        INSERT INTO collections (id, name, created_at) VALUES (?1, ?2, ?3)
        ON CONFLICT(id) DO NOTHING
        "#,
        params![
            collection_id,
            default_collection_name(collection_id),
            Utc::now().to_rfc3339()
        ],
    )?;
    Ok(changed > 0)
}

pub(crate) fn collection_impl(
    conn: &Connection,
    collection_id: &str,
) -> StoreResult<Option<Collection>> {
    let row: Option<(String, String, String)> = conn
        .query_row(
            "SELECT id, name, created_at FROM collections WHERE id = ?1",
            [collection_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;
    row.map(|(id, name, created_at)| {
        Ok(Collection {
            id,
            name,
            created_at: parse_ts("collections", &created_at)?,
        })
    })
    .transpose()
}

pub(crate) fn existing_group_ids_impl(
    conn: &Connection,
    run_id: &str,
    group_ids: &BTreeSet<String>,
) -> StoreResult<BTreeSet<String>> {
    let mut stmt = conn
        .prepare_cached("SELECT 1 FROM transcript_groups WHERE agent_run_id = ?1 AND id = ?2")?;
    let mut found = BTreeSet::new();
    for id in group_ids {
        if stmt.exists(params![run_id, id])? {
            found.insert(id.clone());
        }
    }
    Ok(found)
}

/// Expects to run inside a transaction.
pub(crate) fn save_agent_run_impl(conn: &Connection, run: &AgentRun) -> StoreResult<()> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        r#"
        INSERT INTO agent_runs (id, collection_id, metadata_json, scores_json, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
        ON CONFLICT(id) DO UPDATE SET
            collection_id = excluded.collection_id,
            metadata_json = excluded.metadata_json,
            scores_json = excluded.scores_json,
            updated_at = excluded.updated_at
        "#,
        params![
            run.id,
            run.collection_id,
            serde_json::to_string(&run.metadata)?,
            serde_json::to_string(&run.scores)?,
            now,
        ],
    )?;

    let mut upsert_group = conn.prepare_cached(
        r#"
        INSERT INTO transcript_groups (
            id, collection_id, agent_run_id, name, description,
            parent_transcript_group_id, metadata_json, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        ON CONFLICT(agent_run_id, id) DO UPDATE SET
            collection_id = excluded.collection_id,
            name = excluded.name,
            description = excluded.description,
            parent_transcript_group_id = excluded.parent_transcript_group_id,
            metadata_json = excluded.metadata_json,
            updated_at = excluded.updated_at
        "#,
    )?;
    for group in &run.transcript_groups {
        upsert_group.execute(params![
            group.id,
            run.collection_id,
            run.id,
            group.name,
            group.description,
            group.parent_transcript_group_id,
            serde_json::to_string(&group.metadata)?,
            now,
        ])?;
    }

    conn.execute("DELETE FROM transcripts WHERE agent_run_id = ?1", [&run.id])?;
    let mut insert_transcript = conn.prepare_cached(
        r#"
        INSERT INTO transcripts (
            id, collection_id, agent_run_id, transcript_group_id, position,
            name, description, messages_json, metadata_json
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        "#,
    )?;
    for (position, transcript) in run.transcripts.iter().enumerate() {
        insert_transcript.execute(params![
            transcript.id,
            run.collection_id,
            run.id,
            transcript.transcript_group_id,
            position as i64,
            transcript.name,
            transcript.description,
            serde_json::to_string(&transcript.messages)?,
            serde_json::to_string(&transcript.metadata)?,
        ])?;
    }
    Ok(())
}

pub(crate) fn load_agent_run_impl(conn: &Connection, run_id: &str) -> StoreResult<Option<AgentRun>> {
    let head: Option<(String, String, String)> = conn
        .query_row(
            "SELECT collection_id, metadata_json, scores_json FROM agent_runs WHERE id = ?1",
            [run_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;
    let Some((collection_id, metadata_json, scores_json)) = head else {
        return Ok(None);
    };

    let mut stmt_groups = conn.prepare(
        r#"
        SELECT id, name, description, parent_transcript_group_id, metadata_json
        FROM transcript_groups
        WHERE agent_run_id = ?1
        ORDER BY rowid ASC
        "#,
    )?;
    let groups = stmt_groups
        .query_map([run_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .map(|(id, name, description, parent, metadata_json)| {
            Ok(TranscriptGroup {
                id,
                agent_run_id: run_id.to_string(),
                name,
                description,
                parent_transcript_group_id: parent,
                metadata: parse_map("transcript_groups", &metadata_json)?,
            })
        })
        .collect::<StoreResult<Vec<_>>>()?;

    let mut stmt_transcripts = conn.prepare(
        r#"
        SELECT id, transcript_group_id, name, description, messages_json, metadata_json
        FROM transcripts
        WHERE agent_run_id = ?1
        ORDER BY position ASC
        "#,
    )?;
    let transcripts = stmt_transcripts
        .query_map([run_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .map(
            |(id, transcript_group_id, name, description, messages_json, metadata_json)| {
                let messages: Vec<ChatMessage> =
                    serde_json::from_str(&messages_json).map_err(|e| StoreError::CorruptRow {
                        table: "transcripts",
                        message: e.to_string(),
                    })?;
                Ok(Transcript {
                    id,
                    agent_run_id: run_id.to_string(),
                    transcript_group_id,
                    name,
                    description,
                    messages,
                    metadata: parse_map("transcripts", &metadata_json)?,
                })
            },
        )
        .collect::<StoreResult<Vec<_>>>()?;

    Ok(Some(AgentRun {
        id: run_id.to_string(),
        collection_id,
        metadata: parse_map("agent_runs", &metadata_json)?,
        scores: parse_map("agent_runs", &scores_json)?,
        transcript_groups: groups,
        transcripts,
    }))
}

/// Expects to run inside a transaction.
pub(crate) fn delete_run_impl(conn: &Connection, run_id: &str) -> StoreResult<()> {
    conn.execute("DELETE FROM transcripts WHERE agent_run_id = ?1", [run_id])?;
    conn.execute("DELETE FROM transcript_groups WHERE agent_run_id = ?1", [run_id])?;
    conn.execute("DELETE FROM agent_runs WHERE id = ?1", [run_id])?;
    conn.execute("DELETE FROM run_status WHERE run_id = ?1", [run_id])?;
    conn.execute("DELETE FROM fragments WHERE agent_run_id = ?1", [run_id])?;
    Ok(())
}

/// Expects to run inside a transaction.
pub(crate) fn delete_collection_impl(conn: &Connection, collection_id: &str) -> StoreResult<()> {
    for table in [
        "transcripts",
        "transcript_groups",
        "agent_runs",
        "run_status",
        "fragments",
        "collection_locks",
    ] {
        conn.execute(
            &format!("DELETE FROM {} WHERE collection_id = ?1", table),
            [collection_id],
        )?;
    }
    conn.execute("DELETE FROM collections WHERE id = ?1", [collection_id])?;
    Ok(())
}

fn parse_map(table: &'static str, raw: &str) -> StoreResult<Map<String, Value>> {
    serde_json::from_str(raw).map_err(|e| StoreError::CorruptRow {
        table,
        message: e.to_string(),
    })
}

fn parse_ts(table: &'static str, raw: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::CorruptRow {
            table,
            message: e.to_string(),
        })
}
