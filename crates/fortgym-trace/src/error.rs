//! Error types for fortgym-trace

use thiserror::Error;

/// Errors that can occur in the trace persistence layer
#[derive(Error, Debug)]
pub enum StorageError {
    /// No trace exists for the run
    #[error("Run not found: {run_id}")]
    RunNotFound { run_id: String },

    /// A record arrived whose step index does not extend the trace
    #[error("Out-of-order step record for run {run_id}: expected step {expected}, got {actual}")]
    OutOfOrder {
        run_id: String,
        expected: u64,
        actual: u64,
    },

    /// A persisted line could not be decoded
    #[error("Corrupt trace for run {run_id} at line {line}: {reason}")]
    Corrupt {
        run_id: String,
        line: usize,
        reason: String,
    },

    /// Filesystem failure
    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization failure
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_order_display_names_both_indices() {
        let err = StorageError::OutOfOrder {
            run_id: "run-a".to_string(),
            expected: 3,
            actual: 5,
        };
        let msg = err.to_string();
        assert!(msg.contains("run-a"));
        assert!(msg.contains("expected step 3"));
        assert!(msg.contains("got 5"));
    }
}
