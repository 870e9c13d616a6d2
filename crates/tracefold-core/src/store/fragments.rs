//! Append-only fragment log.

use crate::error::{StoreError, StoreResult};
use crate::model::{Fragment, FragmentCategory, FragmentKey};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde_json::Value;

pub(crate) fn append_impl(
    conn: &Connection,
    key: &FragmentKey,
    category: FragmentCategory,
    payload: &Value,
) -> StoreResult<i64> {
    let payload_json = serde_json::to_string(payload)?;
    conn.execute(
        r#"
        INSERT INTO fragments (
            key, collection_id, agent_run_id, transcript_group_id, transcript_id,
            category, payload_json, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        "#,
        params![
            key.path(),
            key.collection_id,
            key.agent_run_id,
            key.transcript_group_id,
            key.transcript_id,
            category.as_str(),
            payload_json,
            chrono::Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Prefix match on the leading present key components, plus equality on any
/// component given after a gap.
pub(crate) fn query_impl(
    conn: &Connection,
    key: &FragmentKey,
    category: FragmentCategory,
) -> StoreResult<Vec<Fragment>> {
    let prefix = key.prefix();
    let mut stmt = conn.prepare(
        r#"
        SELECT id, collection_id, agent_run_id, transcript_group_id, transcript_id, payload_json, created_at
        FROM fragments
        WHERE collection_id = ?1
          AND category = ?2
          AND (key = ?3 OR substr(key, 1, length(?3) + 1) = ?3 || '/')
          AND (?4 IS NULL OR agent_run_id = ?4)
          AND (?5 IS NULL OR transcript_group_id = ?5)
          AND (?6 IS NULL OR transcript_id = ?6)
        ORDER BY id ASC
        "#,
    )?;
    let rows = stmt
        .query_map(
            params![
                key.collection_id,
                category.as_str(),
                prefix,
                key.agent_run_id,
                key.transcript_group_id,
                key.transcript_id,
            ],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    FragmentKey {
                        collection_id: row.get(1)?,
                        agent_run_id: row.get(2)?,
                        transcript_group_id: row.get(3)?,
                        transcript_id: row.get(4)?,
                    },
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                ))
            },
        )?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(id, key, payload_json, created_at)| {
            let corrupt = |message: String| StoreError::CorruptRow {
                table: "fragments",
                message: format!("fragment {}: {}", id, message),
            };
            let payload = serde_json::from_str(&payload_json).map_err(|e| corrupt(e.to_string()))?;
            let created_at = DateTime::parse_from_rfc3339(&created_at)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| corrupt(e.to_string()))?;
            Ok(Fragment {
                id,
                key,
                category,
                payload,
                created_at,
            })
        })
        .collect()
}

pub(crate) fn count_impl(conn: &Connection, collection_id: &str) -> StoreResult<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM fragments WHERE collection_id = ?1",
        [collection_id],
        |row| row.get(0),
    )?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::TRACEFOLD_SCHEMA;
    use serde_json::json;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(TRACEFOLD_SCHEMA).unwrap();
        conn
    }

    #[test]
    fn query_returns_payloads_in_arrival_order() {
        let conn = conn();
        let key = FragmentKey::collection("c").with_run("r");
        for i in 0..3 {
            append_impl(&conn, &key, FragmentCategory::Score, &json!({ "i": i })).unwrap();
        }
        let got = query_impl(&conn, &key, FragmentCategory::Score).unwrap();
        let order: Vec<i64> = got.iter().map(|p| p.payload["i"].as_i64().unwrap()).collect();
        assert_eq!(order, vec![0, 1, 2]);
        assert!(got.windows(2).all(|w| w[0].id < w[1].id));
    }

    #[test]
    fn run_prefix_includes_nested_keys_but_not_sibling_runs() {
        let conn = conn();
        let run = FragmentKey::collection("c").with_run("r1");
        append_impl(&conn, &run, FragmentCategory::Span, &json!(1)).unwrap();
        append_impl(
            &conn,
            &run.clone().with_group("g"),
            FragmentCategory::Span,
            &json!(2),
        )
        .unwrap();
        // "r10" shares a textual prefix with "r1" and must not match.
        append_impl(
            &conn,
            &FragmentKey::collection("c").with_run("r10"),
            FragmentCategory::Span,
            &json!(3),
        )
        .unwrap();

        let got = query_impl(&conn, &run, FragmentCategory::Span).unwrap();
        assert_eq!(got.len(), 2);
    }

    #[test]
    fn category_is_part_of_the_filter() {
        let conn = conn();
        let key = FragmentKey::collection("c").with_run("r");
        append_impl(&conn, &key, FragmentCategory::Metadata, &json!({})).unwrap();
        assert!(query_impl(&conn, &key, FragmentCategory::Score)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn component_after_gap_filters_by_column() {
        let conn = conn();
        let base = FragmentKey::collection("c").with_run("r");
        append_impl(&conn, &base.clone().with_transcript("t1"), FragmentCategory::TranscriptMetadata, &json!(1)).unwrap();
        append_impl(&conn, &base.clone().with_transcript("t2"), FragmentCategory::TranscriptMetadata, &json!(2)).unwrap();

        let got = query_impl(&conn, &base.with_transcript("t2"), FragmentCategory::TranscriptMetadata).unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].payload, json!(2));
    }
}
