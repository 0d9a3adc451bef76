//! fort-gym Core Library
//!
//! The run orchestration engine: per-run step state machine, bounded
//! parallel jobs, rate-limited interactive control, and the ordered event
//! pipeline feeding live subscribers and the durable trace.

pub mod agent;
pub mod bus;
pub mod config;
pub mod domain;
pub mod engine;
pub mod env;
pub mod gate;
pub mod jobs;
pub mod metrics;
pub mod obs;
pub mod orchestrator;
pub mod replay;
pub mod scoring;
pub mod telemetry;
pub mod trace_writer;
pub mod validator;

pub use agent::{Agent, AgentError, CycleAgent, FakeAgent};
pub use bus::{EventBus, EventHub, Subscription};
pub use config::{ConfigError, EngineConfig, Settings};
pub use domain::{Action, ActionType, FortGymError, Result, Run, RunSpec, ValidatedAction};
pub use engine::{
    ActionSource, CancellationFlag, EngineParts, FatalRunError, StepEngine, StepOutcome,
    StepPhase,
};
pub use env::{
    encode_observation, AdvanceOutcome, BackendError, BackendErrorKind, BackendLease, BackendOp,
    Environment,
    ExecOutcome, MockEnvironment, Observation, SharedBackend,
};
pub use gate::{GateError, GatePolicy, InteractiveGate, InteractiveOutcome, ThrottleError};
pub use jobs::{JobId, JobRegistry, JobState, JobStatus, RunFactory};
pub use orchestrator::{AgentFactory, BackendFactory, BackendProvider, Orchestrator};
pub use replay::{replay_run, ReplaySummary};
pub use scoring::{CompositeScorer, ScoreCard, Scorer};
pub use trace_writer::TraceWriter;
pub use validator::{validate, ValidationError, ValidationErrorKind};

pub use fortgym_trace::{
    ErrorKind, Event, EventKind, JsonlTraceStore, RunId, RunStatus, RunSummary, StepRecord,
    TraceDigest, TraceStore,
};

pub use metrics::METRICS;
pub use obs::RunSpan;
pub use telemetry::init_tracing;

/// fort-gym version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
