//! Persisted record types and the storage trait for fort-gym traces.
//!
//! A run's durable artifacts are:
//! - an append-only trace: exactly one [`StepRecord`] per completed step,
//!   in strictly increasing `step_idx` order starting at 0
//! - a [`RunSummary`] that is rewritten (never appended) as the run progresses
//!
//! [`TraceStore`] is async and backend-agnostic. A JSONL file store lives in
//! `jsonl_store`, an in-memory fake in `fakes`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::StorageError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// Identity and lifecycle
// ---------------------------------------------------------------------------

/// Unique identifier for a run
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub String);

impl RunId {
    /// Generate a new random RunId
    pub fn new() -> Self {
        RunId(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RunId {
    fn from(value: &str) -> Self {
        RunId(value.to_string())
    }
}

/// Lifecycle status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Created,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (RunStatus::Created, RunStatus::Running)
                | (RunStatus::Created, RunStatus::Failed)
                | (RunStatus::Created, RunStatus::Cancelled)
                | (RunStatus::Running, RunStatus::Paused)
                | (RunStatus::Running, RunStatus::Completed)
                | (RunStatus::Running, RunStatus::Failed)
                | (RunStatus::Running, RunStatus::Cancelled)
                | (RunStatus::Paused, RunStatus::Running)
                | (RunStatus::Paused, RunStatus::Completed)
                | (RunStatus::Paused, RunStatus::Failed)
                | (RunStatus::Paused, RunStatus::Cancelled)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Created => write!(f, "created"),
            RunStatus::Running => write!(f, "running"),
            RunStatus::Paused => write!(f, "paused"),
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Classification of an event in a run's stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    State,
    Action,
    Validation,
    Execute,
    Advance,
    Metrics,
    Score,
    Stderr,
    /// The step's record is durable.
    Step,
    /// Run lifecycle transition.
    Status,
}

impl EventKind {
    /// Phase events emitted once per step, in this order.
    pub const PHASES: [EventKind; 7] = [
        EventKind::State,
        EventKind::Action,
        EventKind::Validation,
        EventKind::Execute,
        EventKind::Advance,
        EventKind::Metrics,
        EventKind::Score,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::State => "state",
            EventKind::Action => "action",
            EventKind::Validation => "validation",
            EventKind::Execute => "execute",
            EventKind::Advance => "advance",
            EventKind::Metrics => "metrics",
            EventKind::Score => "score",
            EventKind::Stderr => "stderr",
            EventKind::Step => "step",
            EventKind::Status => "status",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single event in a run's ordered stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub run_id: RunId,
    /// Step the event belongs to
    pub step_idx: u64,
    /// Strictly increasing within the run, starting at 1
    pub seq: u64,
    pub kind: EventKind,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Step records
// ---------------------------------------------------------------------------

/// Error kinds counted in traces and summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidShape,
    InvalidType,
    InvalidParams,
    OutOfBounds,
    AgentError,
    BackendError,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::InvalidShape => "invalid_shape",
            ErrorKind::InvalidType => "invalid_type",
            ErrorKind::InvalidParams => "invalid_params",
            ErrorKind::OutOfBounds => "out_of_bounds",
            ErrorKind::AgentError => "agent_error",
            ErrorKind::BackendError => "backend_error",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the step's proposed action came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionOrigin {
    Agent,
    Interactive,
}

/// Persisted verdict on the proposed action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ValidationOutcome {
    pub fn accepted() -> Self {
        Self {
            valid: true,
            kind: None,
            reason: None,
        }
    }

    pub fn rejected(kind: ErrorKind, reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            kind: Some(kind),
            reason: Some(reason.into()),
        }
    }

    /// No verdict could be reached (e.g. there was no observation to validate against).
    pub fn not_evaluated(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            kind: None,
            reason: Some(reason.into()),
        }
    }
}

/// What happened when the action was dispatched to the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    /// Backend applied the action.
    Applied {
        attempts: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    /// Backend answered but declined the action.
    Rejected {
        attempts: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    /// Execution never happened (invalid action, agent failure, no observation).
    Skipped { reason: String },
    /// Backend call failed, including the retry.
    Failed { attempts: u32, error: String },
}

impl ExecutionOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            ExecutionOutcome::Applied { .. } => "applied",
            ExecutionOutcome::Rejected { .. } => "rejected",
            ExecutionOutcome::Skipped { .. } => "skipped",
            ExecutionOutcome::Failed { .. } => "failed",
        }
    }
}

/// Outcome of the tick advance that closes every step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AdvanceRecord {
    Advanced { ticks: u32, terminal: bool },
    Failed { ticks: u32, error: String },
}

impl AdvanceRecord {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AdvanceRecord::Advanced { terminal: true, .. })
    }
}

/// Normalized metrics extracted from a simulation state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub time: i64,
    pub pop: i64,
    pub food: i64,
    pub drink: i64,
    #[serde(default)]
    pub wealth: Option<i64>,
    pub hostiles: bool,
    pub dead: i64,
}

/// A milestone crossed between two states
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Milestone {
    #[serde(rename = "k")]
    pub key: String,
    pub ts: i64,
}

/// One completed step. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub run_id: RunId,
    pub step_idx: u64,
    pub observation: serde_json::Value,
    pub observation_text: String,
    pub origin: ActionOrigin,
    /// Proposed action as submitted; `None` when no candidate was produced.
    pub action: Option<serde_json::Value>,
    pub validation: ValidationOutcome,
    pub execution: ExecutionOutcome,
    pub advance: AdvanceRecord,
    pub post_state: serde_json::Value,
    pub metrics: MetricsSnapshot,
    pub score: f64,
    pub reward: f64,
    #[serde(default)]
    pub milestones: Vec<Milestone>,
    #[serde(default)]
    pub errors: Vec<ErrorKind>,
    #[serde(default)]
    pub events: Vec<Event>,
    pub timestamp: DateTime<Utc>,
}

impl StepRecord {
    /// The record without run identity or wall-clock fields.
    ///
    /// Two runs that made the same decisions against the same deterministic
    /// backend produce identical content.
    pub fn content(&self) -> serde_json::Value {
        let event_kinds: Vec<&str> = self.events.iter().map(|e| e.kind.as_str()).collect();
        serde_json::json!({
            "step_idx": self.step_idx,
            "observation": self.observation,
            "action": self.action,
            "origin": self.origin,
            "validation": self.validation,
            "execution": self.execution,
            "advance": self.advance,
            "post_state": self.post_state,
            "metrics": self.metrics,
            "score": self.score,
            "reward": self.reward,
            "milestones": self.milestones,
            "errors": self.errors,
            "events": event_kinds,
        })
    }
}

// ---------------------------------------------------------------------------
// Summary
// ---------------------------------------------------------------------------

/// Per-run aggregate, rewritten in place
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub backend: String,
    pub model: String,
    pub status: RunStatus,
    pub steps: u64,
    pub reward_cum: f64,
    pub final_score: f64,
    pub duration_ticks: i64,
    pub peak_pop: i64,
    pub end_pop: i64,
    #[serde(default)]
    pub milestones: Vec<Milestone>,
    #[serde(default)]
    pub error_counts: BTreeMap<ErrorKind, u64>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Digest
// ---------------------------------------------------------------------------

/// SHA-256 hex digest over a trace's step content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TraceDigest(String);

impl TraceDigest {
    /// Compute the SHA-256 digest of the given bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        use sha2::Digest;
        let mut hasher = Sha256::new();
        hasher.update(data);
        TraceDigest(hex::encode(hasher.finalize()))
    }

    /// Digest of every record's [`StepRecord::content`], in order.
    pub fn of_records(records: &[StepRecord]) -> StorageResult<Self> {
        let content: Vec<serde_json::Value> = records.iter().map(StepRecord::content).collect();
        let bytes = serde_json::to_vec(&content)?;
        Ok(Self::from_bytes(&bytes))
    }

    /// Return the full hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form (first 12 hex chars).
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl std::fmt::Display for TraceDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// TraceStore
// ---------------------------------------------------------------------------

/// Durable trace storage.
///
/// Guarantees:
/// - `append_record` returns only after the record is flushed to durable
///   storage; a crash after it returns never loses the record.
/// - Records for a run are accepted only in contiguous `step_idx` order
///   starting at 0; anything else is `StorageError::OutOfOrder`.
/// - `write_summary` replaces the previous summary atomically.
#[async_trait]
pub trait TraceStore: Send + Sync {
    /// Append one step record to its run's trace.
    async fn append_record(&self, record: &StepRecord) -> StorageResult<()>;

    /// All records for a run, in step order. `RunNotFound` if none were written.
    async fn load_records(&self, run_id: &RunId) -> StorageResult<Vec<StepRecord>>;

    /// Number of records persisted for a run (0 for unknown runs).
    async fn record_count(&self, run_id: &RunId) -> StorageResult<u64> {
        match self.load_records(run_id).await {
            Ok(records) => Ok(records.len() as u64),
            Err(StorageError::RunNotFound { .. }) => Ok(0),
            Err(e) => Err(e),
        }
    }

    /// Replace the run's summary.
    async fn write_summary(&self, summary: &RunSummary) -> StorageResult<()>;

    /// The last written summary, if any.
    async fn load_summary(&self, run_id: &RunId) -> StorageResult<Option<RunSummary>>;

    /// Runs that have a trace or a summary.
    async fn list_runs(&self) -> StorageResult<Vec<RunId>>;
}
