//! fortgym-trace: durable trace persistence for fort-gym
//!
//! This crate is the persistence layer of the run orchestration engine. It
//! owns the on-disk shape of a run: one append-only step trace and one
//! rewritable summary per run.
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: crash consistency, strict per-run ordering, replayable content.
//!
//! ## Key Components
//!
//! - `TraceStore`: async storage contract (append, load, summarize)
//! - `JsonlTraceStore`: `<root>/<run_id>/trace.jsonl` + `summary.json`
//! - `SummaryAccumulator`: incremental `RunSummary` fold over step records
//! - `TraceDigest`: SHA-256 over timestamp-free step content

mod error;
pub mod fakes;
pub mod jsonl_store;
pub mod storage_traits;
pub mod summary;

pub use error::StorageError;
pub use jsonl_store::JsonlTraceStore;
pub use storage_traits::{
    ActionOrigin, AdvanceRecord, ErrorKind, Event, EventKind, ExecutionOutcome, MetricsSnapshot,
    Milestone, RunId, RunStatus, RunSummary, StepRecord, StorageResult, TraceDigest, TraceStore,
    ValidationOutcome,
};
pub use summary::SummaryAccumulator;
