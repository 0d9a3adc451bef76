//! Rate-limited interactive control.
//!
//! An interactive run is stepped by an outside caller that supplies the
//! action. The gate admits at most one call per run at a time and enforces
//! a minimum period between accepted calls. Refused calls touch nothing:
//! no state change, no event, no record.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, instrument};

use fortgym_trace::{RunId, RunStatus};

use crate::config::Settings;
use crate::domain::Run;
use crate::engine::{ActionSource, FatalRunError, StepEngine, StepOutcome};
use crate::env::{encode_observation, Observation};
use crate::metrics::METRICS;
use crate::obs;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ThrottleError {
    #[error("step requested too soon; retry after {retry_after_ms}ms")]
    TooSoon { retry_after_ms: u64 },

    #[error("a step is already in flight for this run")]
    InFlight,
}

impl ThrottleError {
    pub fn retry_after_ms(&self) -> u64 {
        match self {
            ThrottleError::TooSoon { retry_after_ms } => *retry_after_ms,
            ThrottleError::InFlight => 0,
        }
    }

    fn reason(&self) -> &'static str {
        match self {
            ThrottleError::TooSoon { .. } => "too_soon",
            ThrottleError::InFlight => "in_flight",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error(transparent)]
    Throttle(#[from] ThrottleError),

    #[error("no interactive run {0}")]
    UnknownRun(String),

    #[error("run {run_id} is already {status}")]
    RunFinished { run_id: String, status: RunStatus },

    #[error(transparent)]
    Fatal(FatalRunError),
}

/// Reply to an accepted interactive call.
#[derive(Debug, Clone, Serialize)]
pub struct InteractiveOutcome {
    /// Simulation state after the step's advance.
    pub observation: Observation,
    pub reward: f64,
    pub done: bool,
    pub info: Value,
}

impl InteractiveOutcome {
    fn from_step(outcome: StepOutcome) -> Self {
        let record = outcome.record;
        let info = json!({
            "step_idx": record.step_idx,
            "status": outcome.status,
            "score": record.score,
            "validation": record.validation,
            "execution": record.execution,
            "advance": record.advance,
            "errors": record.errors,
            "milestones": record.milestones,
        });
        Self {
            observation: Observation {
                text: encode_observation(&record.post_state),
                state: record.post_state,
            },
            reward: record.reward,
            done: outcome.done,
            info,
        }
    }
}

/// Period and tick limits applied to caller-supplied values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatePolicy {
    pub default_period: Duration,
    pub min_period: Duration,
    pub default_max_ticks: u32,
    pub max_ticks_cap: u32,
}

impl Default for GatePolicy {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

impl GatePolicy {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            default_period: Duration::from_millis(settings.default_min_step_period_ms),
            min_period: Duration::from_millis(settings.min_allowed_step_period_ms),
            default_max_ticks: settings.default_max_ticks,
            max_ticks_cap: settings.max_ticks_cap,
        }
    }

    pub fn period(&self, requested_ms: Option<u64>) -> Duration {
        requested_ms
            .map(Duration::from_millis)
            .unwrap_or(self.default_period)
            .max(self.min_period)
    }

    pub fn ticks(&self, requested: Option<u32>) -> u32 {
        requested
            .unwrap_or(self.default_max_ticks)
            .clamp(1, self.max_ticks_cap.max(1))
    }
}

#[derive(Debug, Default)]
struct Admission {
    in_flight: bool,
    last_accepted: Option<Instant>,
}

struct GateSlot {
    admission: Mutex<Admission>,
    engine: tokio::sync::Mutex<StepEngine>,
    run: watch::Receiver<Run>,
}

impl GateSlot {
    fn admit(&self, period: Duration, now: Instant) -> Result<AdmissionGuard<'_>, ThrottleError> {
        let mut admission = self.admission.lock().unwrap_or_else(PoisonError::into_inner);
        if admission.in_flight {
            return Err(ThrottleError::InFlight);
        }
        if let Some(last) = admission.last_accepted {
            let elapsed = now.saturating_duration_since(last);
            if elapsed < period {
                let wait = period - elapsed;
                let retry_after_ms = (wait.as_micros().div_ceil(1000) as u64).max(1);
                return Err(ThrottleError::TooSoon { retry_after_ms });
            }
        }
        admission.in_flight = true;
        admission.last_accepted = Some(now);
        Ok(AdmissionGuard(&self.admission))
    }
}

/// Clears the in-flight mark when the accepted call ends, however it ends.
struct AdmissionGuard<'a>(&'a Mutex<Admission>);

impl Drop for AdmissionGuard<'_> {
    fn drop(&mut self) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .in_flight = false;
    }
}

/// Registry of interactive runs and their admission state.
pub struct InteractiveGate {
    policy: GatePolicy,
    slots: Mutex<HashMap<RunId, Arc<GateSlot>>>,
}

impl InteractiveGate {
    pub fn new(policy: GatePolicy) -> Self {
        Self {
            policy,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> &GatePolicy {
        &self.policy
    }

    /// Register an engine for interactive stepping.
    pub fn open(&self, engine: StepEngine) -> watch::Receiver<Run> {
        let run = engine.subscribe_run();
        let run_id = engine.run_id().clone();
        let slot = Arc::new(GateSlot {
            admission: Mutex::new(Admission::default()),
            engine: tokio::sync::Mutex::new(engine),
            run: run.clone(),
        });
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(run_id.clone(), slot);
        debug!(run_id = %run_id, "interactive run opened");
        run
    }

    pub fn contains(&self, run_id: &RunId) -> bool {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(run_id)
    }

    pub fn snapshot(&self, run_id: &RunId) -> Option<Run> {
        self.slot(run_id).map(|slot| slot.run.borrow().clone())
    }

    fn slot(&self, run_id: &RunId) -> Option<Arc<GateSlot>> {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(run_id)
            .cloned()
    }

    /// Run one engine cycle with a caller-supplied action.
    #[instrument(skip(self, action), fields(run_id = %run_id))]
    pub async fn interactive_step(
        &self,
        run_id: &RunId,
        action: Value,
        min_step_period_ms: Option<u64>,
        max_ticks: Option<u32>,
    ) -> Result<InteractiveOutcome, GateError> {
        let slot = self
            .slot(run_id)
            .ok_or_else(|| GateError::UnknownRun(run_id.to_string()))?;

        let status = slot.run.borrow().status;
        if status.is_terminal() {
            return Err(GateError::RunFinished {
                run_id: run_id.to_string(),
                status,
            });
        }

        let period = self.policy.period(min_step_period_ms);
        let ticks = self.policy.ticks(max_ticks);
        let _admitted = match slot.admit(period, Instant::now()) {
            Ok(guard) => guard,
            Err(throttle) => {
                METRICS.inc_throttled();
                obs::emit_gate_throttled(run_id.as_str(), throttle.reason(), throttle.retry_after_ms());
                return Err(throttle.into());
            }
        };

        let mut engine = slot.engine.lock().await;
        match engine.step(ActionSource::Supplied(action), Some(ticks)).await {
            Ok(outcome) => {
                if !outcome.done {
                    engine.rest();
                }
                Ok(InteractiveOutcome::from_step(outcome))
            }
            Err(FatalRunError::AlreadyFinished { run_id, status }) => {
                Err(GateError::RunFinished { run_id, status })
            }
            Err(e) => Err(GateError::Fatal(e)),
        }
    }

    /// Stop an interactive run and forget it. Unfinished runs end `Cancelled`.
    pub async fn close(&self, run_id: &RunId) -> Option<Run> {
        let slot = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(run_id)?;
        let mut engine = slot.engine.lock().await;
        engine.finish(RunStatus::Cancelled).await;
        Some(engine.snapshot())
    }
}

impl std::fmt::Debug for InteractiveGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let open = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        f.debug_struct("InteractiveGate")
            .field("policy", &self.policy)
            .field("open", &open)
            .finish()
    }
}
