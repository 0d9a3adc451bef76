//! Domain-level error taxonomy for fort-gym.

use fortgym_trace::StorageError;

use crate::config::ConfigError;

/// fort-gym domain errors.
#[derive(Debug, thiserror::Error)]
pub enum FortGymError {
    #[error("unknown backend: {0}")]
    UnknownBackend(String),

    #[error("unknown agent: {0}")]
    UnknownAgent(String),

    #[error("invalid run spec: {0}")]
    InvalidRunSpec(String),

    #[error("invalid job: {0}")]
    InvalidJob(String),

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("job {0} is still active")]
    JobStillActive(String),

    #[error("run not found: {0}")]
    RunNotFound(String),

    #[error("trace gap in run {run_id}: expected step {expected}, found {actual}")]
    TraceGap {
        run_id: String,
        expected: u64,
        actual: u64,
    },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for fort-gym domain operations.
pub type Result<T> = std::result::Result<T, FortGymError>;
