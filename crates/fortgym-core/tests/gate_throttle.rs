//! Interactive gate through the orchestrator facade: refused calls leave the
//! trace untouched.

use std::sync::Arc;
use std::time::Duration;

use fortgym_core::{
    BackendProvider, Environment, GateError, JsonlTraceStore, MockEnvironment, Orchestrator,
    RunSpec, RunStatus, Settings, ThrottleError, TraceStore,
};
use serde_json::json;

fn orchestrator(store: Arc<dyn TraceStore>) -> Orchestrator {
    let o = Orchestrator::new(Settings::default(), store);
    o.register_backend(
        "slow-mock",
        BackendProvider::PerRun(Arc::new(|s: &Settings| {
            Arc::new(MockEnvironment::new(s.mock_seed).with_latency(Duration::from_millis(10)))
                as Arc<dyn Environment>
        })),
    );
    o
}

fn wait() -> serde_json::Value {
    json!({"type": "WAIT", "params": {"ticks": 10}, "intent": "let the dwarves work"})
}

#[tokio::test(start_paused = true)]
async fn throttled_calls_do_not_grow_the_trace() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn TraceStore> = Arc::new(JsonlTraceStore::new(dir.path()));
    let o = orchestrator(store.clone());
    let run_id = o.create_run(&RunSpec::new("mock", "fake", 10)).unwrap();

    o.interactive_step(&run_id, wait(), Some(500), Some(50))
        .await
        .unwrap();
    let before = store.load_records(&run_id).await.unwrap().len();

    for _ in 0..3 {
        let err = o
            .interactive_step(&run_id, wait(), Some(500), Some(50))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GateError::Throttle(ThrottleError::TooSoon { .. })
        ));
    }
    assert_eq!(store.load_records(&run_id).await.unwrap().len(), before);
    assert_eq!(o.run_snapshot(&run_id).unwrap().step_idx, 1);

    tokio::time::advance(Duration::from_millis(500)).await;
    let out = o
        .interactive_step(&run_id, wait(), Some(500), Some(50))
        .await
        .unwrap();
    assert_eq!(out.info["step_idx"], 1);
    assert_eq!(out.observation.state["time"], 100);
    assert_eq!(store.load_records(&run_id).await.unwrap().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn second_concurrent_call_is_rejected_not_queued() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn TraceStore> = Arc::new(JsonlTraceStore::new(dir.path()));
    let o = orchestrator(store.clone());
    let run_id = o.create_run(&RunSpec::new("slow-mock", "fake", 10)).unwrap();

    let (first, second) = tokio::join!(
        o.interactive_step(&run_id, wait(), Some(100), None),
        o.interactive_step(&run_id, wait(), Some(100), None),
    );
    assert!(first.is_ok());
    assert!(matches!(
        second,
        Err(GateError::Throttle(ThrottleError::InFlight))
    ));
    assert_eq!(store.load_records(&run_id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn interactive_run_finishes_at_max_steps() {
    let store: Arc<dyn TraceStore> = Arc::new(fortgym_trace::fakes::MemoryTraceStore::new());
    let o = orchestrator(store.clone());
    let run_id = o.create_run(&RunSpec::new("mock", "fake", 2)).unwrap();

    let first = o.interactive_step(&run_id, wait(), Some(100), None).await.unwrap();
    assert!(!first.done);

    tokio::time::sleep(Duration::from_millis(120)).await;
    let second = o.interactive_step(&run_id, wait(), Some(100), None).await.unwrap();
    assert!(second.done);
    assert_eq!(o.run_snapshot(&run_id).unwrap().status, RunStatus::Completed);

    let err = o
        .interactive_step(&run_id, wait(), Some(100), None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        GateError::RunFinished {
            status: RunStatus::Completed,
            ..
        }
    ));
}
