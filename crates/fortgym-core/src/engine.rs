//! The per-run step engine.
//!
//! One [`StepEngine`] owns one [`Run`] for its whole life. Each call to
//! [`StepEngine::step`] performs exactly one cycle:
//!
//! ```text
//! pause -> observe -> decide -> validate -> execute | skip -> advance -> score -> persist
//! ```
//!
//! and records the seven phase events (`state`, `action`, `validation`,
//! `execute`, `advance`, `metrics`, `score`) in that order, with `stderr`
//! events interleaved where calls fail. Phase events are staged on the bus
//! and published only once the record is durable, followed by a `step`
//! event acknowledging it. A step that cannot be persisted publishes none
//! of them.
//!
//! Agent, validator and single backend-call failures never stop a run. The
//! only ways out are: `max_steps` reached, a terminal backend state,
//! cooperative cancellation between steps, too many consecutive backend
//! errors, or a record that could not be persisted.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{debug, instrument, warn, Instrument};

use fortgym_trace::{
    ActionOrigin, AdvanceRecord, ErrorKind, Event, EventKind, ExecutionOutcome, RunId, RunStatus,
    StepRecord, StorageError, ValidationOutcome,
};

use crate::agent::{Agent, AgentError};
use crate::bus::EventBus;
use crate::config::EngineConfig;
use crate::domain::{Run, ValidatedAction};
use crate::env::{BackendError, BackendOp, BackendResult, Environment, Observation};
use crate::metrics::METRICS;
use crate::obs::{self, RunSpan};
use crate::scoring::Scorer;
use crate::trace_writer::TraceWriter;
use crate::validator;

/// Execute attempts per step: the first try plus one retry on a transient error.
const MAX_EXECUTE_ATTEMPTS: u32 = 2;

/// Where a step's action comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionSource {
    /// Ask the run's agent.
    Agent,
    /// Use a caller-supplied action (still validated).
    Supplied(Value),
}

impl ActionSource {
    fn origin(&self) -> ActionOrigin {
        match self {
            ActionSource::Agent => ActionOrigin::Agent,
            ActionSource::Supplied(_) => ActionOrigin::Interactive,
        }
    }
}

/// Where the engine is within a step cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepPhase {
    Idle,
    Paused,
    Observing,
    Deciding,
    Validating,
    Executing,
    SkippedInvalid,
    Advancing,
    Scoring,
    Persisted,
}

/// Result of one committed step.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub record: StepRecord,
    /// Run status after the step.
    pub status: RunStatus,
    /// No further steps will run.
    pub done: bool,
}

/// Conditions that end a run, or refuse to step one.
#[derive(Debug, thiserror::Error)]
pub enum FatalRunError {
    #[error("run {run_id} failed after {count} consecutive backend errors")]
    BackendFailures { run_id: String, count: u32 },

    #[error("step {step_idx} of run {run_id} could not be persisted: {source}")]
    Persistence {
        run_id: String,
        step_idx: u64,
        #[source]
        source: StorageError,
    },

    #[error("run {run_id} is already {status}")]
    AlreadyFinished { run_id: String, status: RunStatus },
}

/// Cooperative cancellation, checked between steps only.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Collaborators handed to a new engine.
pub struct EngineParts {
    pub env: Arc<dyn Environment>,
    pub agent: Arc<dyn Agent>,
    pub scorer: Arc<dyn Scorer>,
    pub bus: Arc<EventBus>,
    pub writer: TraceWriter,
    pub config: EngineConfig,
}

/// Events and error kinds gathered while one step runs.
struct StepTrail {
    step_idx: u64,
    events: Vec<Event>,
    errors: Vec<ErrorKind>,
}

pub struct StepEngine {
    run: Run,
    run_tx: watch::Sender<Run>,
    env: Arc<dyn Environment>,
    agent: Arc<dyn Agent>,
    scorer: Arc<dyn Scorer>,
    bus: Arc<EventBus>,
    writer: TraceWriter,
    config: EngineConfig,
    phase: StepPhase,
    consecutive_backend_failures: u32,
}

impl StepEngine {
    pub fn new(run: Run, parts: EngineParts) -> Self {
        let (run_tx, _) = watch::channel(run.clone());
        Self {
            run,
            run_tx,
            env: parts.env,
            agent: parts.agent,
            scorer: parts.scorer,
            bus: parts.bus,
            writer: parts.writer,
            config: parts.config,
            phase: StepPhase::Idle,
            consecutive_backend_failures: 0,
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.run.run_id
    }

    pub fn snapshot(&self) -> Run {
        self.run.clone()
    }

    /// Read-only view of the run that follows every transition.
    pub fn subscribe_run(&self) -> watch::Receiver<Run> {
        self.run_tx.subscribe()
    }

    pub fn phase(&self) -> StepPhase {
        self.phase
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn consecutive_backend_failures(&self) -> u32 {
        self.consecutive_backend_failures
    }

    // ------------------------------------------------------------------
    // Driving
    // ------------------------------------------------------------------

    /// Step until the run reaches a terminal status.
    pub async fn run(&mut self, cancel: &CancellationFlag) -> Run {
        let span = RunSpan::new(self.run.run_id.as_str()).span();
        self.drive(cancel).instrument(span).await
    }

    async fn drive(&mut self, cancel: &CancellationFlag) -> Run {
        obs::emit_run_started(
            self.run.run_id.as_str(),
            &self.run.backend,
            &self.run.model,
            self.run.max_steps,
        );
        loop {
            if self.run.status.is_terminal() {
                break;
            }
            if cancel.is_cancelled() {
                self.finish(RunStatus::Cancelled).await;
                break;
            }
            if self.run.step_idx >= self.run.max_steps {
                self.finish(RunStatus::Completed).await;
                break;
            }
            match self.step(ActionSource::Agent, None).await {
                Ok(outcome) if outcome.done => break,
                Ok(_) => {}
                Err(e) => {
                    warn!(run_id = %self.run.run_id, error = %e, "run stopped");
                    break;
                }
            }
        }
        self.run.clone()
    }

    /// Run exactly one step cycle.
    ///
    /// `ticks` overrides the run's `ticks_per_step` for this step only.
    #[instrument(skip(self, source), fields(run_id = %self.run.run_id, step_idx = self.run.step_idx))]
    pub async fn step(
        &mut self,
        source: ActionSource,
        ticks: Option<u32>,
    ) -> Result<StepOutcome, FatalRunError> {
        if self.run.status.is_terminal() {
            return Err(self.already_finished());
        }
        if self.run.step_idx >= self.run.max_steps {
            self.finish(RunStatus::Completed).await;
            return Err(self.already_finished());
        }
        if matches!(self.run.status, RunStatus::Created | RunStatus::Paused) {
            self.transition(RunStatus::Running);
        }

        let origin = source.origin();
        let mut trail = StepTrail {
            step_idx: self.run.step_idx,
            events: Vec::with_capacity(EventKind::PHASES.len()),
            errors: Vec::new(),
        };

        // pause
        self.phase = StepPhase::Paused;
        if let Err(e) = self.bounded(BackendOp::Pause, self.env.pause()).await {
            self.backend_call_failed(&mut trail, &e, 1);
        }

        // observe
        self.phase = StepPhase::Observing;
        let observation = match self.bounded(BackendOp::Observe, self.env.observe()).await {
            Ok(obs) => Some(obs),
            Err(e) => {
                self.backend_call_failed(&mut trail, &e, 1);
                None
            }
        };
        let state_payload = match &observation {
            Some(obs) => json!({"text": obs.text, "state": obs.state}),
            None => json!({"error": "observation unavailable"}),
        };
        self.emit(&mut trail, EventKind::State, state_payload);

        // decide
        self.phase = StepPhase::Deciding;
        let mut agent_error = None;
        let raw = match (source, &observation) {
            (ActionSource::Supplied(value), _) => Some(value),
            (ActionSource::Agent, None) => None,
            (ActionSource::Agent, Some(obs)) => match self.decide(obs).await {
                Ok(value) => Some(value),
                Err(e) => {
                    agent_error = Some(e);
                    None
                }
            },
        };
        if let Some(e) = &agent_error {
            trail.errors.push(ErrorKind::AgentError);
            METRICS.inc_actions_rejected();
            self.emit(
                &mut trail,
                EventKind::Stderr,
                json!({"source": "agent", "message": e.to_string()}),
            );
        }
        self.emit(
            &mut trail,
            EventKind::Action,
            json!({
                "raw": raw,
                "origin": origin,
                "error": agent_error.as_ref().map(ToString::to_string),
            }),
        );

        // validate
        self.phase = StepPhase::Validating;
        let (validation, validated) = match (&raw, &observation, &agent_error) {
            (_, _, Some(e)) => (
                ValidationOutcome::rejected(ErrorKind::AgentError, e.to_string()),
                None,
            ),
            (Some(value), Some(obs), None) => match validator::validate(value, &obs.state) {
                Ok(action) => (ValidationOutcome::accepted(), Some(action)),
                Err(e) => {
                    let kind = ErrorKind::from(e.kind);
                    trail.errors.push(kind);
                    METRICS.inc_actions_rejected();
                    (ValidationOutcome::rejected(kind, e.reason), None)
                }
            },
            (_, None, None) => (
                ValidationOutcome::not_evaluated("no observation to validate against"),
                None,
            ),
            (None, Some(_), None) => (ValidationOutcome::not_evaluated("no action proposed"), None),
        };
        self.emit(&mut trail, EventKind::Validation, json!(validation));

        // execute, or skip
        let execution = match &validated {
            Some(action) => {
                self.phase = StepPhase::Executing;
                self.execute(&mut trail, action).await
            }
            None => {
                self.phase = StepPhase::SkippedInvalid;
                ExecutionOutcome::Skipped {
                    reason: validation
                        .reason
                        .clone()
                        .unwrap_or_else(|| "no valid action".to_string()),
                }
            }
        };
        self.emit(&mut trail, EventKind::Execute, json!(execution));

        // advance, always
        self.phase = StepPhase::Advancing;
        let ticks = ticks.unwrap_or(self.run.ticks_per_step);
        let pre_state = observation
            .as_ref()
            .map(|o| o.state.clone())
            .unwrap_or(Value::Null);
        let (advance, post_state) = match self.bounded(BackendOp::Advance, self.env.advance(ticks)).await {
            Ok(out) => (
                AdvanceRecord::Advanced {
                    ticks: out.ticks,
                    terminal: out.terminal,
                },
                out.state,
            ),
            Err(e) => {
                self.backend_call_failed(&mut trail, &e, 1);
                (
                    AdvanceRecord::Failed {
                        ticks,
                        error: e.to_string(),
                    },
                    pre_state.clone(),
                )
            }
        };
        self.emit(&mut trail, EventKind::Advance, json!(advance));

        // score
        self.phase = StepPhase::Scoring;
        let card = self
            .scorer
            .compute(&pre_state, &post_state, validated.as_ref(), &execution);
        self.emit(&mut trail, EventKind::Metrics, json!(card.metrics));
        self.emit(
            &mut trail,
            EventKind::Score,
            json!({
                "score": card.score,
                "reward": card.reward,
                "milestones": card.milestones,
            }),
        );

        // persist
        let step_idx = trail.step_idx;
        let record = StepRecord {
            run_id: self.run.run_id.clone(),
            step_idx,
            observation: pre_state,
            observation_text: observation.map(|o| o.text).unwrap_or_default(),
            origin,
            action: raw,
            validation,
            execution,
            advance,
            post_state,
            metrics: card.metrics,
            score: card.score,
            reward: card.reward,
            milestones: card.milestones,
            errors: trail.errors,
            events: trail.events,
            timestamp: Utc::now(),
        };

        if let Err(source) = self.writer.commit(&record, self.run.status).await {
            let message = format!("trace write failed: {source}");
            self.fail_run(&message).await;
            return Err(FatalRunError::Persistence {
                run_id: self.run.run_id.to_string(),
                step_idx,
                source,
            });
        }

        self.phase = StepPhase::Persisted;
        self.run.step_idx += 1;
        self.run.reward_cum += record.reward;
        self.run.last_score = record.score;
        self.bus.publish(&record.events);
        METRICS.inc_steps_committed();
        obs::emit_step_committed(
            self.run.run_id.as_str(),
            step_idx,
            record.score,
            record.reward,
            record.errors.len(),
        );
        self.bus.emit(
            step_idx,
            EventKind::Step,
            json!({
                "step_idx": step_idx,
                "score": record.score,
                "reward": record.reward,
                "errors": record.errors,
            }),
        );
        self.publish();

        let threshold = self.config.max_consecutive_backend_failures;
        if self.consecutive_backend_failures >= threshold {
            let count = self.consecutive_backend_failures;
            self.fail_run(&format!("{count} consecutive backend errors"))
                .await;
            return Err(FatalRunError::BackendFailures {
                run_id: self.run.run_id.to_string(),
                count,
            });
        }

        let done = record.advance.is_terminal() || self.run.step_idx >= self.run.max_steps;
        if done {
            self.finish(RunStatus::Completed).await;
        }

        Ok(StepOutcome {
            record,
            status: self.run.status,
            done,
        })
    }

    /// Park a running run between interactive calls.
    pub fn rest(&mut self) {
        if self.run.status == RunStatus::Running {
            self.transition(RunStatus::Paused);
        }
    }

    /// Move the run to a terminal status and write the final summary.
    ///
    /// No-op for runs that are already terminal.
    pub async fn finish(&mut self, status: RunStatus) -> RunStatus {
        if self.run.status.is_terminal() {
            return self.run.status;
        }
        if self.run.status == RunStatus::Created && status == RunStatus::Completed {
            self.transition(RunStatus::Running);
        }
        self.transition(status);
        self.run.finished_at = Some(Utc::now());
        self.phase = StepPhase::Idle;

        if let Err(e) = self.writer.finalize(self.run.status).await {
            obs::emit_run_finalize_error(self.run.run_id.as_str(), &e);
        }
        obs::emit_run_finished(
            self.run.run_id.as_str(),
            &self.run.status.to_string(),
            self.run.step_idx,
            self.run.reward_cum,
        );
        METRICS.inc_runs_finished();
        self.bus.close();
        self.publish();
        self.run.status
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn already_finished(&self) -> FatalRunError {
        FatalRunError::AlreadyFinished {
            run_id: self.run.run_id.to_string(),
            status: self.run.status,
        }
    }

    fn transition(&mut self, next: RunStatus) {
        let from = self.run.status;
        if !from.can_transition_to(next) {
            warn!(run_id = %self.run.run_id, %from, to = %next, "ignored invalid run transition");
            return;
        }
        self.run.status = next;
        if next == RunStatus::Running && self.run.started_at.is_none() {
            self.run.started_at = Some(Utc::now());
        }
        self.bus.emit(
            self.run.step_idx,
            EventKind::Status,
            json!({"from": from, "to": next}),
        );
        self.publish();
        debug!(run_id = %self.run.run_id, %from, to = %next, "run transition");
    }

    async fn fail_run(&mut self, message: &str) {
        self.bus.emit(
            self.run.step_idx,
            EventKind::Stderr,
            json!({"message": message, "terminal": true}),
        );
        self.finish(RunStatus::Failed).await;
    }

    fn publish(&self) {
        self.run_tx.send_replace(self.run.clone());
    }

    /// Stage a phase event; it is published once the step is durable.
    fn emit(&self, trail: &mut StepTrail, kind: EventKind, payload: Value) {
        let event = self.bus.stage(trail.step_idx, kind, payload);
        trail.events.push(event);
    }

    async fn bounded<T>(
        &self,
        op: BackendOp,
        call: impl Future<Output = BackendResult<T>>,
    ) -> BackendResult<T> {
        // The timeout starts once the lease is held; `call` has not run yet.
        let _lease = self.env.lease().await;
        match tokio::time::timeout(self.config.backend_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::timeout(op, self.config.backend_timeout)),
        }
    }

    async fn decide(&self, obs: &Observation) -> Result<Value, AgentError> {
        let timeout = self.config.agent_timeout;
        match tokio::time::timeout(timeout, self.agent.decide(&obs.text, &obs.state)).await {
            Ok(result) => result,
            Err(_) => Err(AgentError::Timeout {
                ms: timeout.as_millis() as u64,
            }),
        }
    }

    async fn execute(&mut self, trail: &mut StepTrail, action: &ValidatedAction) -> ExecutionOutcome {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.bounded(BackendOp::Execute, self.env.execute(action)).await {
                Ok(out) => {
                    self.consecutive_backend_failures = 0;
                    return if out.accepted {
                        ExecutionOutcome::Applied {
                            attempts,
                            detail: out.detail,
                        }
                    } else {
                        ExecutionOutcome::Rejected {
                            attempts,
                            detail: out.detail,
                        }
                    };
                }
                Err(e) if attempts < MAX_EXECUTE_ATTEMPTS && e.is_transient() => {
                    self.report_backend_error(trail, &e, attempts);
                }
                Err(e) => {
                    self.backend_call_failed(trail, &e, attempts);
                    return ExecutionOutcome::Failed {
                        attempts,
                        error: e.to_string(),
                    };
                }
            }
        }
    }

    /// A backend call failed for good: report it and count it.
    fn backend_call_failed(&mut self, trail: &mut StepTrail, err: &BackendError, attempt: u32) {
        self.report_backend_error(trail, err, attempt);
        self.consecutive_backend_failures += 1;
        trail.errors.push(ErrorKind::BackendError);
        METRICS.inc_backend_errors();
    }

    fn report_backend_error(&self, trail: &mut StepTrail, err: &BackendError, attempt: u32) {
        obs::emit_backend_error(self.run.run_id.as_str(), err.op.as_str(), attempt, err);
        self.emit(
            trail,
            EventKind::Stderr,
            json!({
                "source": "backend",
                "op": err.op,
                "kind": err.kind,
                "attempt": attempt,
                "message": err.message,
            }),
        );
    }
}

impl std::fmt::Debug for StepEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepEngine")
            .field("run_id", &self.run.run_id)
            .field("status", &self.run.status)
            .field("step_idx", &self.run.step_idx)
            .field("phase", &self.phase)
            .finish()
    }
}
