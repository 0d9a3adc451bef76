//! Bounded parallel jobs against latency-injected mock backends.

use std::sync::Arc;
use std::time::Duration;

use fortgym_core::{
    BackendProvider, Environment, JobState, MockEnvironment, Orchestrator, RunSpec, RunStatus,
    Settings, TraceStore,
};
use fortgym_trace::fakes::MemoryTraceStore;

fn orchestrator(store: Arc<dyn TraceStore>) -> Orchestrator {
    let o = Orchestrator::new(Settings::default(), store);
    o.register_backend(
        "slow-mock",
        BackendProvider::PerRun(Arc::new(|s: &Settings| {
            Arc::new(MockEnvironment::new(s.mock_seed).with_latency(Duration::from_millis(5)))
                as Arc<dyn Environment>
        })),
    );
    o
}

#[tokio::test(start_paused = true)]
async fn ten_runs_two_at_a_time() {
    let store: Arc<dyn TraceStore> = Arc::new(MemoryTraceStore::new());
    let o = orchestrator(store.clone());
    let job_id = o
        .start_job(&RunSpec::new("slow-mock", "cycle", 3), 10, 2)
        .unwrap();
    let runs = o.jobs().runs(&job_id).unwrap();
    assert_eq!(runs.len(), 10);

    let mut max_seen = 0;
    loop {
        let running = runs
            .iter()
            .filter(|rx| rx.borrow().status == RunStatus::Running)
            .count();
        assert!(running <= 2, "{running} runs in Running at once");
        max_seen = max_seen.max(running);

        if o.job_status(&job_id).unwrap().state.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(3)).await;
    }
    assert!(max_seen >= 1);

    let status = o.wait_job(&job_id).await.unwrap();
    assert_eq!(status.state, JobState::Done);
    assert_eq!(status.completed, 10);
    assert!(status.peak_running <= 2);
    for rx in &runs {
        assert!(rx.borrow().status.is_terminal());
    }
    for run_id in &status.run_ids {
        assert_eq!(store.record_count(run_id).await.unwrap(), 3);
    }
}

#[tokio::test(start_paused = true)]
async fn cancel_mid_job_stops_running_and_queued_runs() {
    let store: Arc<dyn TraceStore> = Arc::new(MemoryTraceStore::new());
    let o = orchestrator(store.clone());
    let job_id = o
        .start_job(&RunSpec::new("slow-mock", "fake", 50), 6, 2)
        .unwrap();

    tokio::time::sleep(Duration::from_millis(30)).await;
    o.cancel_job(&job_id).unwrap();

    let status = o.wait_job(&job_id).await.unwrap();
    assert_eq!(status.state, JobState::Cancelled);
    assert_eq!(status.cancelled, 6);
    assert_eq!(status.completed + status.failed, 0);

    let mut stepped = 0;
    for run_id in &status.run_ids {
        let count = store.record_count(run_id).await.unwrap();
        assert!(count < 50);
        if count > 0 {
            stepped += 1;
        }
    }
    // Only the two runs a worker had picked up ever stepped.
    assert_eq!(stepped, 2);
}

#[tokio::test]
async fn parallelism_above_run_count_is_capped() {
    let store: Arc<dyn TraceStore> = Arc::new(MemoryTraceStore::new());
    let o = orchestrator(store);
    let job_id = o.start_job(&RunSpec::new("mock", "fake", 2), 3, 16).unwrap();

    let status = o.wait_job(&job_id).await.unwrap();
    assert_eq!(status.completed, 3);
    assert!(status.peak_running <= 3);
    assert_eq!(o.list_jobs().len(), 1);
}
