//! Step engine lifecycle: ordering, bounded steps, failure thresholds and
//! persistence, driven end to end against the mock fortress.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fortgym_core::{
    ActionSource, Agent, AgentError, BackendErrorKind, BackendOp, CancellationFlag,
    CompositeScorer, EngineConfig, EngineParts, ErrorKind, EventBus, EventKind, FakeAgent,
    FatalRunError, JsonlTraceStore, MockEnvironment, Run, RunId, RunSpec, RunStatus, StepEngine,
    TraceStore, TraceWriter,
};
use fortgym_trace::fakes::MemoryTraceStore;
use fortgym_trace::AdvanceRecord;
use serde_json::{json, Value};

/// Never proposes anything the validator accepts.
struct NonsenseAgent;

#[async_trait]
impl Agent for NonsenseAgent {
    fn name(&self) -> &str {
        "nonsense"
    }

    async fn decide(&self, _text: &str, _state: &Value) -> Result<Value, AgentError> {
        Ok(json!("dig a big hole somewhere"))
    }
}

fn engine_on(
    env: MockEnvironment,
    agent: Arc<dyn Agent>,
    store: Arc<dyn TraceStore>,
    max_steps: u64,
) -> StepEngine {
    let spec = RunSpec::new("mock", agent.name().to_string(), max_steps);
    let run = Run::new(RunId::new(), &spec, 100);
    let writer = TraceWriter::new(store, run.run_id.clone(), "mock", &spec.model, 2);
    StepEngine::new(
        run.clone(),
        EngineParts {
            env: Arc::new(env),
            agent,
            scorer: Arc::new(CompositeScorer),
            bus: EventBus::new(run.run_id),
            writer,
            config: EngineConfig {
                agent_timeout: Duration::from_secs(1),
                backend_timeout: Duration::from_secs(1),
                max_consecutive_backend_failures: 3,
            },
        },
    )
}

#[tokio::test]
async fn every_rejected_action_still_yields_a_contiguous_trace() {
    let store = Arc::new(MemoryTraceStore::new());
    let mut engine = engine_on(
        MockEnvironment::default(),
        Arc::new(NonsenseAgent),
        store.clone(),
        4,
    );

    let run = engine.run(&CancellationFlag::new()).await;
    assert_eq!(run.status, RunStatus::Completed);

    let records = store.load_records(&run.run_id).await.unwrap();
    let idx: Vec<u64> = records.iter().map(|r| r.step_idx).collect();
    assert_eq!(idx, vec![0, 1, 2, 3]);
    for record in &records {
        assert_eq!(record.errors, vec![ErrorKind::InvalidShape]);
        assert_eq!(record.execution.label(), "skipped");
        assert!(!record.advance.is_terminal());
    }
    // Ticks kept moving even though nothing was executed.
    assert_eq!(records[3].post_state["time"], 400);

    let summary = store.load_summary(&run.run_id).await.unwrap().unwrap();
    assert_eq!(summary.error_count(ErrorKind::InvalidShape), 4);
}

#[tokio::test]
async fn record_count_never_exceeds_max_steps() {
    for max_steps in [0_u64, 1, 7] {
        let store = Arc::new(MemoryTraceStore::new());
        let mut engine = engine_on(
            MockEnvironment::default(),
            Arc::new(FakeAgent),
            store.clone(),
            max_steps,
        );
        let run = engine.run(&CancellationFlag::new()).await;
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(store.record_count(&run.run_id).await.unwrap(), max_steps);

        let extra = engine.step(ActionSource::Agent, None).await.unwrap_err();
        assert!(matches!(extra, FatalRunError::AlreadyFinished { .. }));
        assert_eq!(store.record_count(&run.run_id).await.unwrap(), max_steps);
    }
}

#[tokio::test]
async fn three_consecutive_execute_failures_fail_the_run() {
    let store = Arc::new(MemoryTraceStore::new());
    let env = MockEnvironment::default().fail_on(
        BackendOp::Execute,
        [1, 2, 3],
        BackendErrorKind::Permanent,
    );
    let mut engine = engine_on(env, Arc::new(FakeAgent), store.clone(), 20);
    let mut sub = engine.bus().subscribe();

    let run = engine.run(&CancellationFlag::new()).await;
    assert_eq!(run.status, RunStatus::Failed);

    let records = store.load_records(&run.run_id).await.unwrap();
    assert_eq!(records.len(), 4);
    assert!(records[1..]
        .iter()
        .all(|r| r.errors == vec![ErrorKind::BackendError]));

    let mut terminal_stderr = false;
    while let Some(event) = sub.next().await {
        if event.kind == EventKind::Stderr && event.payload["terminal"] == true {
            terminal_stderr = true;
        }
    }
    assert!(terminal_stderr);

    let summary = store.load_summary(&run.run_id).await.unwrap().unwrap();
    assert_eq!(summary.status, RunStatus::Failed);
    assert_eq!(summary.error_count(ErrorKind::BackendError), 3);
}

#[tokio::test]
async fn interspersed_failures_keep_the_run_alive() {
    let store = Arc::new(MemoryTraceStore::new());
    let env = MockEnvironment::default().fail_on(
        BackendOp::Execute,
        [0, 1, 3, 4],
        BackendErrorKind::Permanent,
    );
    let mut engine = engine_on(env, Arc::new(FakeAgent), store.clone(), 6);

    for _ in 0..5 {
        let outcome = engine.step(ActionSource::Agent, None).await.unwrap();
        assert_eq!(outcome.status, RunStatus::Running);
    }
    let last = engine.step(ActionSource::Agent, None).await.unwrap();
    assert_eq!(last.status, RunStatus::Completed);
    assert_eq!(store.record_count(engine.run_id()).await.unwrap(), 6);
}

#[tokio::test]
async fn failed_advances_alone_do_not_stop_the_run() {
    let store = Arc::new(MemoryTraceStore::new());
    // A failed advance leaves the mock's step counter in place, so this one
    // fault key covers every following step.
    let env = MockEnvironment::default().fail_on(
        BackendOp::Advance,
        [0],
        BackendErrorKind::Permanent,
    );
    let mut engine = engine_on(env, Arc::new(FakeAgent), store.clone(), 4);

    let run = engine.run(&CancellationFlag::new()).await;
    // Each successful execute resets the consecutive failure counter.
    assert_eq!(run.status, RunStatus::Completed);

    let records = store.load_records(&run.run_id).await.unwrap();
    assert_eq!(records.len(), 4);
    for record in &records {
        assert_eq!(record.errors, vec![ErrorKind::BackendError]);
        assert!(matches!(
            record.advance,
            AdvanceRecord::Failed { ticks: 100, .. }
        ));
        assert_eq!(record.post_state, record.observation);
        assert_eq!(record.reward, 0.0);
    }
}

#[tokio::test]
async fn unwritable_trace_is_fatal() {
    let store = Arc::new(MemoryTraceStore::new());
    let mut engine = engine_on(
        MockEnvironment::default(),
        Arc::new(FakeAgent),
        store.clone(),
        5,
    );

    engine.step(ActionSource::Agent, None).await.unwrap();
    store.set_fail_appends(true);

    let err = engine.step(ActionSource::Agent, None).await.unwrap_err();
    assert!(matches!(err, FatalRunError::Persistence { step_idx: 1, .. }));
    assert_eq!(engine.snapshot().status, RunStatus::Failed);
    assert_eq!(engine.snapshot().step_idx, 1);
    assert_eq!(store.record_count(engine.run_id()).await.unwrap(), 1);
}

#[tokio::test]
async fn jsonl_store_holds_one_line_per_step() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(JsonlTraceStore::new(dir.path()));
    let mut engine = engine_on(
        MockEnvironment::default(),
        Arc::new(FakeAgent),
        store.clone(),
        5,
    );

    let run = engine.run(&CancellationFlag::new()).await;
    let text = std::fs::read_to_string(store.trace_path(&run.run_id)).unwrap();
    assert_eq!(text.lines().count(), 5);

    let summary: fortgym_core::RunSummary =
        serde_json::from_str(&std::fs::read_to_string(store.summary_path(&run.run_id)).unwrap())
            .unwrap();
    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.steps, 5);
    assert_eq!(summary.duration_ticks, 500);
}

#[tokio::test]
async fn cancellation_is_observed_between_steps() {
    let store = Arc::new(MemoryTraceStore::new());
    let mut engine = engine_on(
        MockEnvironment::default(),
        Arc::new(FakeAgent),
        store.clone(),
        10,
    );
    let cancel = CancellationFlag::new();

    engine.step(ActionSource::Agent, None).await.unwrap();
    engine.step(ActionSource::Agent, None).await.unwrap();
    cancel.cancel();

    let run = engine.run(&cancel).await;
    assert_eq!(run.status, RunStatus::Cancelled);
    assert_eq!(store.record_count(&run.run_id).await.unwrap(), 2);
    let summary = store.load_summary(&run.run_id).await.unwrap().unwrap();
    assert_eq!(summary.status, RunStatus::Cancelled);
}

#[tokio::test]
async fn summary_write_failures_do_not_fail_the_run() {
    let store = Arc::new(MemoryTraceStore::new());
    store.set_fail_summaries(true);
    let mut engine = engine_on(
        MockEnvironment::default(),
        Arc::new(FakeAgent),
        store.clone(),
        4,
    );
    let mut sub = engine.bus().subscribe();

    let run = engine.run(&CancellationFlag::new()).await;
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.step_idx, 4);
    assert_eq!(store.record_count(&run.run_id).await.unwrap(), 4);
    assert!(store.load_summary(&run.run_id).await.unwrap().is_none());

    let mut acknowledged = Vec::new();
    while let Some(event) = sub.next().await {
        if event.kind == EventKind::Step {
            acknowledged.push(event.step_idx);
        }
    }
    assert_eq!(acknowledged, vec![0, 1, 2, 3]);
}
