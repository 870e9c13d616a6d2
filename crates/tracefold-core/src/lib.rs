//! Incremental reconstruction of agent runs from OpenTelemetry span
//! fragments.
//!
//! Telemetry about one agent run arrives as many overlapping, out-of-order,
//! possibly duplicated fragments. This crate provides:
//!
//! - An append-only fragment store keyed by collection / run / group / transcript
//! - Per-run dirty-bit versioning with an atomic claim step
//! - A claim scheduler that rebuilds dirty runs under a per-collection lease
//! - An OTLP/JSON span decoder
//! - Conversation-thread reconstruction from per-span message snapshots
//! - Run assembly and idempotent persistence
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use tracefold_core::{ClaimScheduler, Ingestor, NoopRequester, ProcessingConfig, Store};
//!
//! # fn example(payload: &[u8]) -> anyhow::Result<()> {
//! let store = Store::memory()?;
//! let ingestor = Ingestor::new(store.clone(), Arc::new(NoopRequester));
//! ingestor.submit_spans("my-collection", payload)?;
//!
//! let scheduler = ClaimScheduler::with_lease(store.clone(), Arc::new(NoopRequester), ProcessingConfig::default());
//! scheduler.drain("my-collection")?;
//! # Ok(())
//! # }
//! ```
//!
//! # Configuration
//!
//! | Environment Variable | Description |
//! |---------------------|-------------|
//! | `TRACEFOLD_DB` | SQLite database path (default: in-memory) |
//! | `TRACEFOLD_MAX_RETRIES` | Failures tolerated before a run is parked in `ERROR` (default: 3) |
//! | `TRACEFOLD_ERROR_HISTORY` | Failures remembered per run (default: 5) |
//! | `TRACEFOLD_LOCK_LEASE_SECS` | Collection lease lifetime (default: 300) |
//! | `TRACEFOLD_STALE_CLAIM_SECS` | Age after which a `PROCESSING` claim is reclaimed (default: 900) |

pub mod assemble;
pub mod config;
pub mod error;
pub mod ingest;
pub mod model;
pub mod otel;
pub mod queue;
pub mod reconstruct;
pub mod scheduler;
pub mod store;

// Re-export main types
pub use assemble::{assemble_run, RunAssembler, RunFragments, RunRebuilder};
pub use config::ProcessingConfig;
pub use error::{
    ConfigError, DecodeError, IngestError, IngestResult, ReconstructionError, StoreError,
    StoreResult,
};
pub use ingest::Ingestor;
pub use model::{
    AgentRun, ChatMessage, Collection, Fragment, FragmentCategory, FragmentKey, ProcessingStatus,
    Role, RunStatus, ToolCall, Transcript, TranscriptGroup,
};
pub use otel::{decode_export_request, AttrValue, Span};
pub use queue::{run_worker, NoopRequester, PassRequester, ProcessingQueue, QueueReceiver};
pub use reconstruct::{reconstruct_run, ConversationThread, ThreadPool};
pub use scheduler::{ClaimScheduler, CollectionGuard, CollectionLock, LeaseLock, PassOutcome, PassReport};
pub use store::{default_collection_name, Store};
