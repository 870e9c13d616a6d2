//! Error types for fragment ingestion and run reconstruction.

use rusqlite::ErrorCode;

/// Backing store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {message}")]
    Serialization { message: String },

    #[error("corrupt row in {table}: {message}")]
    CorruptRow { table: &'static str, message: String },

    #[error("not found: {what}")]
    NotFound { what: String },

    #[error("store connection lock poisoned")]
    LockPoisoned,
}

impl StoreError {
    /// Whether the error means the store itself is unreachable, as opposed to
    /// a failure scoped to the row being written.
    ///
    /// Outages abort a whole processing pass; everything else is charged to
    /// the run that triggered it.
    pub fn is_unavailable(&self) -> bool {
        match self {
            Self::Database(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                ErrorCode::DatabaseBusy
                    | ErrorCode::DatabaseLocked
                    | ErrorCode::CannotOpen
                    | ErrorCode::SystemIoFailure
                    | ErrorCode::DiskFull
                    | ErrorCode::NotADatabase
            ),
            Self::LockPoisoned => true,
            _ => false,
        }
    }

    pub(crate) fn serialization(err: impl std::fmt::Display) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err)
    }
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Wire payload decoding errors.
///
/// Element-level variants are logged and skipped by the decoder; only
/// [`DecodeError::Payload`] and [`DecodeError::Envelope`] reach callers.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecodeError {
    #[error("payload is not valid JSON: {message}")]
    Payload { message: String },

    #[error("payload is missing the resourceSpans envelope")]
    Envelope,

    #[error("malformed attribute {key:?}: {reason}")]
    Attribute { key: String, reason: String },

    #[error("malformed event: {reason}")]
    Event { reason: String },

    #[error("malformed link: {reason}")]
    Link { reason: String },

    #[error("malformed identifier {value:?}: {reason}")]
    Identifier { value: String, reason: String },

    #[error("malformed span: {reason}")]
    Span { reason: String },
}

/// Failure while rebuilding one run. Recorded on the run, never surfaced to
/// ingestion callers.
#[derive(Debug, thiserror::Error)]
pub enum ReconstructionError {
    #[error("fragment {fragment_id} has an unreadable {category} payload: {message}")]
    BadFragment {
        fragment_id: i64,
        category: &'static str,
        message: String,
    },

    #[error("invalid run structure: {message}")]
    InvalidStructure { message: String },

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Errors observed by ingestion callers: only the fragment write itself.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("invalid submission: {message}")]
    Invalid { message: String },
}

/// Result type for ingestion calls.
pub type IngestResult<T> = Result<T, IngestError>;

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {message}")]
    Read { path: String, message: String },

    #[error("failed to parse config {path}: {message}")]
    Parse { path: String, message: String },

    #[error("invalid config: {message}")]
    Invalid { message: String },
}
