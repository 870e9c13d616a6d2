//! SQLite schema for fragment accumulation and run reconstruction.
//!
//! Tables:
//! - `collections`: Collection registry
//! - `fragments`: Append-only telemetry log
//! - `run_status`: Per-run dirty-bit / version state
//! - `collection_locks`: Per-collection processing leases
//! - `agent_runs`, `transcript_groups`, `transcripts`: Derived objects

/// DDL for all tracefold tables.
///
/// Schema version: 2
pub const TRACEFOLD_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS collections (
    id               TEXT PRIMARY KEY,
    name             TEXT NOT NULL,
    created_at       TEXT NOT NULL
);

-- Fragments (append-only, never updated)
CREATE TABLE IF NOT EXISTS fragments (
    id                   INTEGER PRIMARY KEY AUTOINCREMENT,
    key                  TEXT NOT NULL,
    collection_id        TEXT NOT NULL,
    agent_run_id         TEXT,
    transcript_group_id  TEXT,
    transcript_id        TEXT,
    category             TEXT NOT NULL,
    payload_json         TEXT NOT NULL,
    created_at           TEXT NOT NULL
);

-- One row per run; versions only ever grow
CREATE TABLE IF NOT EXISTS run_status (
    run_id               TEXT PRIMARY KEY,
    collection_id        TEXT NOT NULL,
    status               TEXT NOT NULL,
    current_version      INTEGER NOT NULL DEFAULT 1,
    processed_version    INTEGER NOT NULL DEFAULT 0,
    error_count          INTEGER NOT NULL DEFAULT 0,
    error_history_json   TEXT NOT NULL DEFAULT '[]',
    claimed_at           INTEGER,
    updated_at           TEXT NOT NULL,
    CHECK (processed_version <= current_version)
);

CREATE TABLE IF NOT EXISTS collection_locks (
    collection_id        TEXT PRIMARY KEY,
    holder               TEXT NOT NULL,
    expires_at           INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS agent_runs (
    id                   TEXT PRIMARY KEY,
    collection_id        TEXT NOT NULL,
    metadata_json        TEXT NOT NULL,
    scores_json          TEXT NOT NULL,
    updated_at           TEXT NOT NULL
);

-- Group and transcript ids are scoped to their run
CREATE TABLE IF NOT EXISTS transcript_groups (
    agent_run_id                 TEXT NOT NULL,
    id                           TEXT NOT NULL,
    collection_id                TEXT NOT NULL,
    name                         TEXT,
    description                  TEXT,
    parent_transcript_group_id   TEXT,
    metadata_json                TEXT NOT NULL,
    updated_at                   TEXT NOT NULL,
    PRIMARY KEY (agent_run_id, id),
    FOREIGN KEY (agent_run_id, parent_transcript_group_id)
        REFERENCES transcript_groups(agent_run_id, id)
);

CREATE TABLE IF NOT EXISTS transcripts (
    agent_run_id         TEXT NOT NULL,
    id                   TEXT NOT NULL,
    collection_id        TEXT NOT NULL,
    transcript_group_id  TEXT,
    position             INTEGER NOT NULL,
    name                 TEXT,
    description          TEXT,
    messages_json        TEXT NOT NULL,
    metadata_json        TEXT NOT NULL,
    PRIMARY KEY (agent_run_id, id),
    FOREIGN KEY (agent_run_id, transcript_group_id)
        REFERENCES transcript_groups(agent_run_id, id)
);

CREATE INDEX IF NOT EXISTS idx_fragments_collection_category_key
    ON fragments(collection_id, category, key);
CREATE INDEX IF NOT EXISTS idx_run_status_collection_status
    ON run_status(collection_id, status);
CREATE INDEX IF NOT EXISTS idx_transcripts_run
    ON transcripts(agent_run_id, position);
"#;
