//! Environment backend contract.
//!
//! The engine drives a backend through four calls: `pause`, `observe`,
//! `execute`, `advance`. Every call may fail; the engine bounds each one with
//! a timeout and decides whether to retry from [`BackendError::is_transient`].
//! Before each call it takes a [`BackendLease`]; waiting for the lease is
//! not part of the call's timeout.

pub mod encoder;
pub mod mock;
pub mod shared;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;

use crate::domain::ValidatedAction;

pub use encoder::encode_observation;
pub use mock::MockEnvironment;
pub use shared::SharedBackend;

/// Which backend call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendOp {
    Pause,
    Observe,
    Execute,
    Advance,
}

impl BackendOp {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendOp::Pause => "pause",
            BackendOp::Observe => "observe",
            BackendOp::Execute => "execute",
            BackendOp::Advance => "advance",
        }
    }
}

impl std::fmt::Display for BackendOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendErrorKind {
    /// Worth one more try (connection reset, busy).
    Transient,
    /// Retrying will not help.
    Permanent,
    /// The call did not answer in time.
    Timeout,
}

/// A failed backend call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{op} failed ({kind:?}): {message}")]
pub struct BackendError {
    pub op: BackendOp,
    pub kind: BackendErrorKind,
    pub message: String,
}

impl BackendError {
    pub fn new(op: BackendOp, kind: BackendErrorKind, message: impl Into<String>) -> Self {
        Self {
            op,
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(op: BackendOp, after: std::time::Duration) -> Self {
        Self::new(
            op,
            BackendErrorKind::Timeout,
            format!("no answer after {}ms", after.as_millis()),
        )
    }

    /// Timeouts count as transient.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            BackendErrorKind::Transient | BackendErrorKind::Timeout
        )
    }
}

pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// What the backend shows the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// Short bulleted summary for the agent prompt.
    pub text: String,
    /// Machine-readable state.
    pub state: serde_json::Value,
}

/// Backend answer to an `execute` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecOutcome {
    /// Whether the backend applied the action.
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Backend answer to an `advance` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdvanceOutcome {
    pub ticks: u32,
    /// State after the advance.
    pub state: serde_json::Value,
    /// The simulation has ended (fortress fell, horizon reached).
    pub terminal: bool,
}

/// Right to make one backend call. Dropping it lets the next caller in.
#[derive(Debug)]
pub struct BackendLease(Option<OwnedMutexGuard<()>>);

impl BackendLease {
    /// Lease for a backend that accepts concurrent calls.
    pub fn unshared() -> Self {
        Self(None)
    }

    /// Lease backed by a held backend-scoped lock.
    pub fn exclusive(guard: OwnedMutexGuard<()>) -> Self {
        Self(Some(guard))
    }

    pub fn is_exclusive(&self) -> bool {
        self.0.is_some()
    }
}

/// A stateful simulation the engine can drive.
///
/// Implementations are shared behind `Arc`, so every method takes `&self`.
#[async_trait]
pub trait Environment: Send + Sync {
    /// Short backend name recorded in summaries.
    fn kind(&self) -> &str;

    /// Wait for the right to make one call; hold the lease across that call.
    async fn lease(&self) -> BackendLease {
        BackendLease::unshared()
    }

    /// Stop the simulation clock. Idempotent.
    async fn pause(&self) -> BackendResult<()>;

    async fn observe(&self) -> BackendResult<Observation>;

    async fn execute(&self, action: &ValidatedAction) -> BackendResult<ExecOutcome>;

    async fn advance(&self, ticks: u32) -> BackendResult<AdvanceOutcome>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_are_transient() {
        let err = BackendError::timeout(BackendOp::Execute, std::time::Duration::from_millis(50));
        assert!(err.is_transient());
        assert!(err.to_string().contains("execute failed"));
        assert!(!BackendError::new(BackendOp::Observe, BackendErrorKind::Permanent, "gone")
            .is_transient());
    }
}
