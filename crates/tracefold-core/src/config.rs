use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_ERROR_HISTORY_LEN: usize = 5;
const DEFAULT_LOCK_LEASE_SECS: u64 = 300;
const DEFAULT_STALE_CLAIM_SECS: u64 = 900;
const DEFAULT_MAX_PASSES: u32 = 64;

/// Processing and storage settings.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ProcessingConfig {
    /// SQLite database file. `None` means an in-memory store.
    pub database_path: Option<PathBuf>,

    /// Reconstruction failures a run may accumulate and still be retried.
    /// One more parks it in the terminal `ERROR` state.
    pub max_retries: u32,

    /// Number of failures kept in a run's error history.
    pub error_history_len: usize,

    /// Lifetime of a per-collection processing lease.
    pub lock_lease_secs: u64,

    /// Runs claimed longer ago than this are handed back to the queue at the
    /// start of the next pass.
    pub stale_claim_secs: u64,

    /// Upper bound on back-to-back passes when draining a collection.
    pub max_passes: u32,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            max_retries: DEFAULT_MAX_RETRIES,
            error_history_len: DEFAULT_ERROR_HISTORY_LEN,
            lock_lease_secs: DEFAULT_LOCK_LEASE_SECS,
            stale_claim_secs: DEFAULT_STALE_CLAIM_SECS,
            max_passes: DEFAULT_MAX_PASSES,
        }
    }
}

impl ProcessingConfig {
    /// Create config from environment variables.
    ///
    /// | Variable | Description |
    /// |----------|-------------|
    /// | `TRACEFOLD_DB` | SQLite database path |
    /// | `TRACEFOLD_MAX_RETRIES` | Failures tolerated before a run is marked `ERROR` (default: 3) |
    /// | `TRACEFOLD_ERROR_HISTORY` | Failures kept per run (default: 5) |
    /// | `TRACEFOLD_LOCK_LEASE_SECS` | Collection lease lifetime (default: 300) |
    /// | `TRACEFOLD_STALE_CLAIM_SECS` | Age after which a claim is reclaimed (default: 900) |
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_path: std::env::var("TRACEFOLD_DB").ok().map(PathBuf::from),
            max_retries: env_parse("TRACEFOLD_MAX_RETRIES").unwrap_or(defaults.max_retries),
            error_history_len: env_parse("TRACEFOLD_ERROR_HISTORY")
                .unwrap_or(defaults.error_history_len),
            lock_lease_secs: env_parse("TRACEFOLD_LOCK_LEASE_SECS")
                .unwrap_or(defaults.lock_lease_secs),
            stale_claim_secs: env_parse("TRACEFOLD_STALE_CLAIM_SECS")
                .unwrap_or(defaults.stale_claim_secs),
            max_passes: defaults.max_passes,
        }
    }

    /// Load config from a YAML file. Missing keys take their defaults.
    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        let cfg: Self = serde_yaml::from_str(&raw).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_retries == 0 {
            return Err(ConfigError::Invalid {
                message: "max_retries must be at least 1".to_string(),
            });
        }
        if self.error_history_len == 0 {
            return Err(ConfigError::Invalid {
                message: "error_history_len must be at least 1".to_string(),
            });
        }
        if self.lock_lease_secs == 0 {
            return Err(ConfigError::Invalid {
                message: "lock_lease_secs must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    pub fn lock_lease(&self) -> Duration {
        Duration::from_secs(self.lock_lease_secs)
    }

    pub fn stale_claim_after(&self) -> Duration {
        Duration::from_secs(self.stale_claim_secs)
    }

    /// Set the database path.
    pub fn with_database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database_path = Some(path.into());
        self
    }

    /// Set the retry budget.
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set the stale-claim threshold.
    pub fn with_stale_claim_secs(mut self, secs: u64) -> Self {
        self.stale_claim_secs = secs;
        self
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}
