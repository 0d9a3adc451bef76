//! Live subscription: history replay spliced onto the live tail.

use std::collections::HashSet;
use std::sync::Arc;

use fortgym_core::{
    ActionSource, CancellationFlag, EventKind, Orchestrator, RunSpec, Settings, TraceStore,
};
use fortgym_trace::fakes::MemoryTraceStore;

fn orchestrator() -> Orchestrator {
    let store: Arc<dyn TraceStore> = Arc::new(MemoryTraceStore::new());
    Orchestrator::new(Settings::default(), store)
}

#[tokio::test]
async fn late_subscriber_sees_every_step_exactly_once() {
    let o = orchestrator();
    let mut engine = o.build_engine(&RunSpec::new("mock", "cycle", 20)).unwrap();
    for _ in 0..5 {
        engine.step(ActionSource::Agent, None).await.unwrap();
    }

    let mut sub = o.subscribe(engine.run_id()).unwrap();
    for _ in 0..2 {
        engine.step(ActionSource::Agent, None).await.unwrap();
    }

    let mut events = Vec::new();
    while let Some(event) = sub.try_next() {
        events.push(event);
    }

    let steps: Vec<u64> = events
        .iter()
        .filter(|e| e.kind == EventKind::Step)
        .map(|e| e.step_idx)
        .collect();
    assert_eq!(steps, vec![0, 1, 2, 3, 4, 5, 6]);

    let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
    assert!(seqs.windows(2).all(|w| w[0] < w[1]));
    let unique: HashSet<u64> = seqs.iter().copied().collect();
    assert_eq!(unique.len(), seqs.len());
    assert_eq!(seqs[0], 1);
}

#[tokio::test]
async fn phase_events_arrive_in_order_for_a_concurrent_subscriber() {
    let o = orchestrator();
    let mut engine = o.build_engine(&RunSpec::new("mock", "fake", 3)).unwrap();
    let mut sub = o.subscribe(engine.run_id()).unwrap();

    let reader = tokio::spawn(async move {
        let mut seen = Vec::new();
        while let Some(event) = sub.next().await {
            seen.push(event);
        }
        seen
    });

    engine.run(&CancellationFlag::new()).await;
    let events = reader.await.unwrap();

    for step in 0..3_u64 {
        let phases: Vec<EventKind> = events
            .iter()
            .filter(|e| e.step_idx == step && EventKind::PHASES.contains(&e.kind))
            .map(|e| e.kind)
            .collect();
        assert_eq!(phases, EventKind::PHASES.to_vec());
    }
    let last = events.last().unwrap();
    assert_eq!(last.kind, EventKind::Status);
    assert_eq!(last.payload["to"], "completed");
}

#[tokio::test]
async fn unpersisted_step_publishes_no_phase_events() {
    let store = Arc::new(MemoryTraceStore::new());
    let o = Orchestrator::new(Settings::default(), store.clone());
    let mut engine = o.build_engine(&RunSpec::new("mock", "fake", 5)).unwrap();
    let mut sub = o.subscribe(engine.run_id()).unwrap();

    engine.step(ActionSource::Agent, None).await.unwrap();
    store.set_fail_appends(true);
    assert!(engine.step(ActionSource::Agent, None).await.is_err());

    let mut events = Vec::new();
    while let Some(event) = sub.next().await {
        events.push(event);
    }

    let first_step: Vec<EventKind> = events
        .iter()
        .filter(|e| e.step_idx == 0 && EventKind::PHASES.contains(&e.kind))
        .map(|e| e.kind)
        .collect();
    assert_eq!(first_step, EventKind::PHASES.to_vec());
    assert!(!events
        .iter()
        .any(|e| e.step_idx == 1 && EventKind::PHASES.contains(&e.kind)));
    assert!(events
        .iter()
        .any(|e| e.kind == EventKind::Stderr && e.payload["terminal"] == true));

    let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
    assert!(seqs.windows(2).all(|w| w[0] < w[1]));
}
