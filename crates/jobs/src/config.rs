//! Job engine configuration.

use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

use crate::service::DEFAULT_LIST_LIMIT;

pub const DATABASE_PATH_VAR: &str = "STUDIO_DATABASE_PATH";
pub const MAX_WORKERS_VAR: &str = "STUDIO_MAX_WORKERS";

/// Job engine configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobEngineConfig {
    /// SQLite database file; its parent directory is created on open.
    pub database_path: PathBuf,
    /// Worker slots. `0` accepts submissions but never runs them.
    pub max_workers: usize,
    /// `list` limit when the query does not carry one.
    pub default_list_limit: usize,
    /// How long a connection waits on a locked database.
    pub busy_timeout: Duration,
}

impl Default for JobEngineConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from(".studio/studio.db"),
            max_workers: 2,
            default_list_limit: DEFAULT_LIST_LIMIT,
            busy_timeout: Duration::from_secs(30),
        }
    }
}

impl JobEngineConfig {
    pub fn with_database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database_path = path.into();
        self
    }

    pub fn with_max_workers(mut self, max: usize) -> Self {
        self.max_workers = max;
        self
    }

    pub fn with_default_list_limit(mut self, limit: usize) -> Self {
        self.default_list_limit = limit;
        self
    }

    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    /// Defaults overridden by `STUDIO_DATABASE_PATH` and `STUDIO_MAX_WORKERS`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`Self::from_env`], reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(path) = lookup(DATABASE_PATH_VAR).filter(|p| !p.trim().is_empty()) {
            config.database_path = PathBuf::from(path.trim());
        }

        if let Some(raw) = lookup(MAX_WORKERS_VAR) {
            match raw.trim().parse::<usize>() {
                Ok(max) => config.max_workers = max,
                Err(err) => warn!(
                    var = MAX_WORKERS_VAR,
                    value = %raw,
                    error = %err,
                    default = config.max_workers,
                    "ignoring invalid worker count"
                ),
            }
        }

        config
    }
}
