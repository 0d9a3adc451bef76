//! Orchestrator facade.
//!
//! Holds the agent and backend registries, the event hub, the job registry
//! and the interactive gate, and builds step engines from a [`RunSpec`].
//! Backends are registered either per run (a fresh instance for every run,
//! like the mock) or shared (one live instance behind a [`SharedBackend`]
//! lock, serializing calls across runs).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info};

use fortgym_trace::{RunId, StepRecord, TraceStore};

use crate::agent::{Agent, CycleAgent, FakeAgent};
use crate::bus::{EventHub, Subscription};
use crate::config::Settings;
use crate::domain::{FortGymError, Result, Run, RunSpec};
use crate::engine::{CancellationFlag, EngineParts, StepEngine};
use crate::env::{Environment, MockEnvironment, SharedBackend};
use crate::gate::{GateError, GatePolicy, InteractiveGate, InteractiveOutcome};
use crate::jobs::{JobId, JobRegistry, JobStatus, RunFactory};
use crate::replay::{replay_run, ReplaySummary};
use crate::scoring::CompositeScorer;
use crate::trace_writer::TraceWriter;

/// Builds a fresh agent for each run.
pub type AgentFactory = Arc<dyn Fn() -> Arc<dyn Agent> + Send + Sync>;

/// Builds a fresh backend for each run.
pub type BackendFactory = Arc<dyn Fn(&Settings) -> Arc<dyn Environment> + Send + Sync>;

#[derive(Clone)]
pub enum BackendProvider {
    PerRun(BackendFactory),
    Shared(SharedBackend),
}

impl BackendProvider {
    fn instance(&self, settings: &Settings) -> Arc<dyn Environment> {
        match self {
            BackendProvider::PerRun(factory) => factory(settings),
            BackendProvider::Shared(shared) => Arc::new(shared.clone()),
        }
    }
}

struct EngineContext {
    settings: Settings,
    store: Arc<dyn TraceStore>,
    hub: EventHub,
    agents: Mutex<HashMap<String, AgentFactory>>,
    backends: Mutex<HashMap<String, BackendProvider>>,
    runs: Mutex<HashMap<RunId, watch::Receiver<Run>>>,
}

impl EngineContext {
    fn build_engine(&self, spec: &RunSpec) -> Result<StepEngine> {
        spec.validate()?;
        let provider = self
            .backends
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&spec.backend)
            .cloned()
            .ok_or_else(|| FortGymError::UnknownBackend(spec.backend.clone()))?;
        let make_agent = self
            .agents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&spec.model)
            .cloned()
            .ok_or_else(|| FortGymError::UnknownAgent(spec.model.clone()))?;
        let env = provider.instance(&self.settings);
        let agent = make_agent();

        let ticks = spec.ticks_per_step.unwrap_or(self.settings.ticks_per_step);
        let run = Run::new(RunId::new(), spec, ticks);
        let run_id = run.run_id.clone();
        let writer = TraceWriter::new(
            Arc::clone(&self.store),
            run_id.clone(),
            &spec.backend,
            &spec.model,
            self.settings.summary_every,
        );
        let engine = StepEngine::new(
            run,
            EngineParts {
                env,
                agent,
                scorer: Arc::new(CompositeScorer),
                bus: self.hub.bus(&run_id),
                writer,
                config: self.settings.engine_config(),
            },
        );
        self.runs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(run_id.clone(), engine.subscribe_run());
        debug!(run_id = %run_id, backend = %spec.backend, model = %spec.model, "engine built");
        Ok(engine)
    }

    fn forget(&self, run_id: &RunId) {
        self.hub.remove(run_id);
        self.runs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(run_id);
    }
}

struct EngineFactory {
    spec: RunSpec,
    ctx: Arc<EngineContext>,
}

impl RunFactory for EngineFactory {
    fn build(&self, _index: usize) -> Result<StepEngine> {
        self.ctx.build_engine(&self.spec)
    }
}

pub struct Orchestrator {
    ctx: Arc<EngineContext>,
    jobs: JobRegistry,
    gate: InteractiveGate,
}

impl Orchestrator {
    /// New orchestrator with the `mock` backend and the `fake` and `cycle`
    /// agents registered.
    pub fn new(settings: Settings, store: Arc<dyn TraceStore>) -> Self {
        let gate = InteractiveGate::new(GatePolicy::from_settings(&settings));
        let orchestrator = Self {
            ctx: Arc::new(EngineContext {
                settings,
                store,
                hub: EventHub::new(),
                agents: Mutex::new(HashMap::new()),
                backends: Mutex::new(HashMap::new()),
                runs: Mutex::new(HashMap::new()),
            }),
            jobs: JobRegistry::new(),
            gate,
        };
        orchestrator.register_backend(
            "mock",
            BackendProvider::PerRun(Arc::new(|s: &Settings| {
                Arc::new(MockEnvironment::new(s.mock_seed)) as Arc<dyn Environment>
            })),
        );
        orchestrator.register_agent("fake", || Arc::new(FakeAgent) as Arc<dyn Agent>);
        orchestrator.register_agent("cycle", || Arc::new(CycleAgent::new()) as Arc<dyn Agent>);
        orchestrator
    }

    pub fn settings(&self) -> &Settings {
        &self.ctx.settings
    }

    pub fn store(&self) -> &Arc<dyn TraceStore> {
        &self.ctx.store
    }

    // ------------------------------------------------------------------
    // Registries
    // ------------------------------------------------------------------

    pub fn register_agent<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Arc<dyn Agent> + Send + Sync + 'static,
    {
        self.ctx
            .agents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), Arc::new(factory));
    }

    pub fn register_backend(&self, name: impl Into<String>, provider: BackendProvider) {
        self.ctx
            .backends
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), provider);
    }

    /// Register one live backend instance shared by every run that names it.
    pub fn register_shared_backend(&self, name: impl Into<String>, backend: Arc<dyn Environment>) {
        self.register_backend(name, BackendProvider::Shared(SharedBackend::new(backend)));
    }

    pub fn agents(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .ctx
            .agents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn backends(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .ctx
            .backends
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    // ------------------------------------------------------------------
    // Runs
    // ------------------------------------------------------------------

    /// Build a run without driving it.
    pub fn build_engine(&self, spec: &RunSpec) -> Result<StepEngine> {
        self.ctx.build_engine(spec)
    }

    /// Drive one run to a terminal state on the current task.
    ///
    /// The finished run is returned to the caller and not retained; its
    /// trace stays readable through [`Orchestrator::replay`].
    pub async fn run_to_completion(&self, spec: &RunSpec, cancel: &CancellationFlag) -> Result<Run> {
        let mut engine = self.ctx.build_engine(spec)?;
        let run = engine.run(cancel).await;
        info!(run_id = %run.run_id, status = %run.status, steps = run.step_idx, "run done");
        self.ctx.forget(&run.run_id);
        Ok(run)
    }

    /// Create an interactive run, stepped through [`Orchestrator::interactive_step`].
    pub fn create_run(&self, spec: &RunSpec) -> Result<RunId> {
        let engine = self.ctx.build_engine(spec)?;
        let run_id = engine.run_id().clone();
        self.gate.open(engine);
        Ok(run_id)
    }

    pub async fn interactive_step(
        &self,
        run_id: &RunId,
        action: Value,
        min_step_period_ms: Option<u64>,
        max_ticks: Option<u32>,
    ) -> std::result::Result<InteractiveOutcome, GateError> {
        self.gate
            .interactive_step(run_id, action, min_step_period_ms, max_ticks)
            .await
    }

    /// Stop an interactive run; unfinished runs end `Cancelled`.
    ///
    /// The run's snapshot and event history are dropped with it, so live
    /// subscribers see the end of the stream and new ones get `None`.
    pub async fn close_run(&self, run_id: &RunId) -> Option<Run> {
        let run = self.gate.close(run_id).await?;
        self.ctx.forget(run_id);
        Some(run)
    }

    /// Latest snapshot of any run built by this orchestrator.
    pub fn run_snapshot(&self, run_id: &RunId) -> Option<Run> {
        self.ctx
            .runs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(run_id)
            .map(|rx| rx.borrow().clone())
    }

    /// History-then-live event stream for a run.
    pub fn subscribe(&self, run_id: &RunId) -> Option<Subscription> {
        self.ctx.hub.subscribe(run_id)
    }

    pub async fn replay(&self, run_id: &RunId) -> Result<(Vec<StepRecord>, ReplaySummary)> {
        replay_run(self.ctx.store.as_ref(), run_id).await
    }

    // ------------------------------------------------------------------
    // Jobs
    // ------------------------------------------------------------------

    pub fn start_job(&self, spec: &RunSpec, n: usize, parallelism: usize) -> Result<JobId> {
        spec.validate()?;
        let factory = Arc::new(EngineFactory {
            spec: spec.clone(),
            ctx: Arc::clone(&self.ctx),
        });
        self.jobs.start(n, parallelism, factory)
    }

    pub fn job_status(&self, job_id: &JobId) -> Result<JobStatus> {
        self.jobs.status(job_id)
    }

    pub fn cancel_job(&self, job_id: &JobId) -> Result<()> {
        self.jobs.cancel(job_id)
    }

    pub async fn wait_job(&self, job_id: &JobId) -> Result<JobStatus> {
        self.jobs.wait(job_id).await
    }

    pub fn list_jobs(&self) -> Vec<JobStatus> {
        self.jobs.list()
    }

    /// Drop a finished job along with its runs' event history.
    pub fn evict_job(&self, job_id: &JobId) -> Result<JobStatus> {
        let status = self.jobs.evict(job_id)?;
        for run_id in &status.run_ids {
            self.ctx.forget(run_id);
        }
        Ok(status)
    }

    pub fn jobs(&self) -> &JobRegistry {
        &self.jobs
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("backends", &self.backends())
            .field("agents", &self.agents())
            .field("jobs", &self.jobs)
            .field("gate", &self.gate)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use fortgym_trace::fakes::MemoryTraceStore;
    use fortgym_trace::RunStatus;
    use serde_json::json;

    use super::*;

    fn orchestrator() -> Orchestrator {
        Orchestrator::new(Settings::default(), Arc::new(MemoryTraceStore::new()))
    }

    #[test]
    fn built_in_registrations() {
        let o = orchestrator();
        assert_eq!(o.backends(), vec!["mock".to_string()]);
        assert_eq!(o.agents(), vec!["cycle".to_string(), "fake".to_string()]);
    }

    #[test]
    fn unknown_names_are_rejected() {
        let o = orchestrator();
        let err = o.create_run(&RunSpec::new("dfhack", "fake", 3)).unwrap_err();
        assert!(matches!(err, FortGymError::UnknownBackend(ref b) if b == "dfhack"));

        let err = o.create_run(&RunSpec::new("mock", "gpt", 3)).unwrap_err();
        assert!(matches!(err, FortGymError::UnknownAgent(ref a) if a == "gpt"));

        let err = o
            .start_job(&RunSpec::new("mock", "fake", 3).with_ticks_per_step(0), 2, 1)
            .unwrap_err();
        assert!(matches!(err, FortGymError::InvalidRunSpec(_)));
    }

    #[tokio::test]
    async fn run_to_completion_uses_configured_ticks() {
        let o = orchestrator();
        let run = o
            .run_to_completion(&RunSpec::new("mock", "cycle", 2), &CancellationFlag::new())
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.ticks_per_step, 200);
        assert!(o.run_snapshot(&run.run_id).is_none());
        assert!(o.subscribe(&run.run_id).is_none());

        let (records, summary) = o.replay(&run.run_id).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(summary.summary_consistent, Some(true));
    }

    #[tokio::test]
    async fn interactive_run_through_the_facade() {
        let o = orchestrator();
        let run_id = o.create_run(&RunSpec::new("mock", "fake", 5)).unwrap();
        assert_eq!(o.run_snapshot(&run_id).unwrap().status, RunStatus::Created);

        let out = o
            .interactive_step(&run_id, json!({"type": "NOOP", "params": {}}), None, Some(100))
            .await
            .unwrap();
        assert!(!out.done);
        assert_eq!(o.run_snapshot(&run_id).unwrap().status, RunStatus::Paused);

        let closed = o.close_run(&run_id).await.unwrap();
        assert_eq!(closed.status, RunStatus::Cancelled);
    }

    #[tokio::test]
    async fn closing_an_interactive_run_releases_it() {
        let o = orchestrator();
        let run_id = o.create_run(&RunSpec::new("mock", "fake", 5)).unwrap();
        o.interactive_step(&run_id, json!({"type": "NOOP", "params": {}}), None, Some(100))
            .await
            .unwrap();
        let mut live = o.subscribe(&run_id).unwrap();

        o.close_run(&run_id).await.unwrap();
        assert!(o.run_snapshot(&run_id).is_none());
        assert!(o.subscribe(&run_id).is_none());
        assert!(o.close_run(&run_id).await.is_none());

        // The existing subscriber drains to the terminal status and ends.
        let mut last = None;
        while let Some(event) = live.next().await {
            last = Some(event);
        }
        assert_eq!(last.unwrap().payload["to"], json!("cancelled"));
    }

    #[tokio::test]
    async fn evicting_a_job_forgets_its_runs() {
        let o = orchestrator();
        let job_id = o.start_job(&RunSpec::new("mock", "fake", 1), 2, 2).unwrap();
        let status = o.wait_job(&job_id).await.unwrap();
        assert_eq!(status.completed, 2);

        let run_id = status.run_ids[0].clone();
        assert!(o.subscribe(&run_id).is_some());
        o.evict_job(&job_id).unwrap();
        assert!(o.subscribe(&run_id).is_none());
        assert!(o.run_snapshot(&run_id).is_none());
    }
}
