//! Trait contract tests for TraceStore.
//!
//! Every conforming store must pass these; they run against both the
//! in-memory fake and the JSONL file store.

use std::io::Write;

use chrono::Utc;
use fortgym_trace::fakes::MemoryTraceStore;
use fortgym_trace::storage_traits::*;
use fortgym_trace::{JsonlTraceStore, StorageError, SummaryAccumulator};

fn record(run_id: &str, step_idx: u64) -> StepRecord {
    StepRecord {
        run_id: RunId::from(run_id),
        step_idx,
        observation: serde_json::json!({"time": step_idx * 100}),
        observation_text: format!("- Time: tick {}", step_idx * 100),
        origin: ActionOrigin::Agent,
        action: Some(serde_json::json!({"type": "NOOP", "params": {}, "intent": "wait"})),
        validation: ValidationOutcome::accepted(),
        execution: ExecutionOutcome::Applied {
            attempts: 1,
            detail: None,
        },
        advance: AdvanceRecord::Advanced {
            ticks: 100,
            terminal: false,
        },
        post_state: serde_json::json!({"time": (step_idx + 1) * 100}),
        metrics: MetricsSnapshot {
            time: ((step_idx + 1) * 100) as i64,
            pop: 7,
            food: 100,
            drink: 80,
            ..MetricsSnapshot::default()
        },
        score: 20.0,
        reward: 0.5,
        milestones: Vec::new(),
        errors: Vec::new(),
        events: Vec::new(),
        timestamp: Utc::now(),
    }
}

async fn append_in_order(store: &dyn TraceStore) {
    for idx in 0..3 {
        store.append_record(&record("run-1", idx)).await.unwrap();
    }
    let records = store.load_records(&RunId::from("run-1")).await.unwrap();
    let indices: Vec<u64> = records.iter().map(|r| r.step_idx).collect();
    assert_eq!(indices, vec![0, 1, 2]);
    assert_eq!(store.record_count(&RunId::from("run-1")).await.unwrap(), 3);
}

async fn reject_gaps_and_duplicates(store: &dyn TraceStore) {
    store.append_record(&record("run-2", 0)).await.unwrap();

    let dup = store.append_record(&record("run-2", 0)).await.unwrap_err();
    assert!(matches!(
        dup,
        StorageError::OutOfOrder {
            expected: 1,
            actual: 0,
            ..
        }
    ));

    let gap = store.append_record(&record("run-2", 5)).await.unwrap_err();
    assert!(matches!(
        gap,
        StorageError::OutOfOrder {
            expected: 1,
            actual: 5,
            ..
        }
    ));

    assert_eq!(store.record_count(&RunId::from("run-2")).await.unwrap(), 1);
}

async fn missing_run_is_not_found(store: &dyn TraceStore) {
    let err = store
        .load_records(&RunId::from("never-written"))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::RunNotFound { .. }));
    assert_eq!(
        store
            .record_count(&RunId::from("never-written"))
            .await
            .unwrap(),
        0
    );
}

async fn summary_is_rewritten(store: &dyn TraceStore) {
    let run_id = RunId::from("run-3");
    let mut acc = SummaryAccumulator::new(run_id.clone(), "mock", "fake");
    acc.observe(&record("run-3", 0));
    store
        .write_summary(&acc.snapshot(RunStatus::Running))
        .await
        .unwrap();

    acc.observe(&record("run-3", 1));
    store
        .write_summary(&acc.snapshot(RunStatus::Completed))
        .await
        .unwrap();

    let summary = store.load_summary(&run_id).await.unwrap().unwrap();
    assert_eq!(summary.steps, 2);
    assert_eq!(summary.status, RunStatus::Completed);
    assert!(store
        .load_summary(&RunId::from("nope"))
        .await
        .unwrap()
        .is_none());
}

// ===========================================================================
// MemoryTraceStore
// ===========================================================================

#[tokio::test]
async fn memory_appends_in_order() {
    append_in_order(&MemoryTraceStore::new()).await;
}

#[tokio::test]
async fn memory_rejects_gaps_and_duplicates() {
    reject_gaps_and_duplicates(&MemoryTraceStore::new()).await;
}

#[tokio::test]
async fn memory_missing_run_is_not_found() {
    missing_run_is_not_found(&MemoryTraceStore::new()).await;
}

#[tokio::test]
async fn memory_summary_is_rewritten() {
    summary_is_rewritten(&MemoryTraceStore::new()).await;
}

#[tokio::test]
async fn memory_injected_failure_leaves_trace_untouched() {
    let store = MemoryTraceStore::new();
    store.append_record(&record("run-f", 0)).await.unwrap();
    store.set_fail_appends(true);
    assert!(store.append_record(&record("run-f", 1)).await.is_err());
    store.set_fail_appends(false);
    assert_eq!(store.record_count(&RunId::from("run-f")).await.unwrap(), 1);
}

// ===========================================================================
// JsonlTraceStore
// ===========================================================================

#[tokio::test]
async fn jsonl_appends_in_order() {
    let dir = tempfile::tempdir().unwrap();
    append_in_order(&JsonlTraceStore::new(dir.path())).await;
}

#[tokio::test]
async fn jsonl_rejects_gaps_and_duplicates() {
    let dir = tempfile::tempdir().unwrap();
    reject_gaps_and_duplicates(&JsonlTraceStore::new(dir.path())).await;
}

#[tokio::test]
async fn jsonl_missing_run_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    missing_run_is_not_found(&JsonlTraceStore::new(dir.path())).await;
}

#[tokio::test]
async fn jsonl_summary_is_rewritten() {
    let dir = tempfile::tempdir().unwrap();
    summary_is_rewritten(&JsonlTraceStore::new(dir.path())).await;
}

#[tokio::test]
async fn jsonl_writes_one_line_per_record() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonlTraceStore::new(dir.path());
    for idx in 0..4 {
        store.append_record(&record("run-lines", idx)).await.unwrap();
    }

    let text = std::fs::read_to_string(store.trace_path(&RunId::from("run-lines"))).unwrap();
    assert_eq!(text.lines().count(), 4);
    for line in text.lines() {
        let value: serde_json::Value = serde_json::from_str(line).unwrap();
        for field in [
            "step_idx",
            "observation",
            "action",
            "validation",
            "execution",
            "advance",
            "metrics",
            "score",
            "timestamp",
        ] {
            assert!(value.get(field).is_some(), "missing field {field}");
        }
    }
}

#[tokio::test]
async fn jsonl_recovers_from_torn_tail() {
    let dir = tempfile::tempdir().unwrap();
    let run_id = RunId::from("run-torn");
    {
        let store = JsonlTraceStore::new(dir.path());
        store.append_record(&record("run-torn", 0)).await.unwrap();
        store.append_record(&record("run-torn", 1)).await.unwrap();

        // Simulate a crash halfway through writing step 2.
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(store.trace_path(&run_id))
            .unwrap();
        file.write_all(b"{\"run_id\":\"run-torn\",\"step_idx\":2,\"obs").unwrap();
    }

    // A fresh store (new process) sees only the two complete records...
    let store = JsonlTraceStore::new(dir.path());
    let records = store.load_records(&run_id).await.unwrap();
    assert_eq!(records.len(), 2);

    // ...and resumes appending at step 2 on a clean line boundary.
    store.append_record(&record("run-torn", 2)).await.unwrap();
    let records = store.load_records(&run_id).await.unwrap();
    let indices: Vec<u64> = records.iter().map(|r| r.step_idx).collect();
    assert_eq!(indices, vec![0, 1, 2]);
}

#[tokio::test]
async fn jsonl_corrupt_middle_line_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonlTraceStore::new(dir.path());
    let run_id = RunId::from("run-corrupt");
    store.append_record(&record("run-corrupt", 0)).await.unwrap();

    let path = store.trace_path(&run_id);
    let mut text = std::fs::read_to_string(&path).unwrap();
    text.push_str("not json\n");
    std::fs::write(&path, text).unwrap();

    let err = store.load_records(&run_id).await.unwrap_err();
    assert!(matches!(err, StorageError::Corrupt { line: 2, .. }));
}

#[tokio::test]
async fn jsonl_lists_runs_with_artifacts() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonlTraceStore::new(dir.path());
    store.append_record(&record("run-b", 0)).await.unwrap();
    store.append_record(&record("run-a", 0)).await.unwrap();
    std::fs::create_dir_all(dir.path().join("stray-dir")).unwrap();

    let runs = store.list_runs().await.unwrap();
    assert_eq!(runs, vec![RunId::from("run-a"), RunId::from("run-b")]);
}

#[tokio::test]
async fn trace_digest_ignores_wall_clock_and_run_identity() {
    let a = vec![record("run-x", 0), record("run-x", 1)];
    let mut b = vec![record("run-y", 0), record("run-y", 1)];
    b[1].timestamp = Utc::now() + chrono::Duration::seconds(30);

    let da = TraceDigest::of_records(&a).unwrap();
    let db = TraceDigest::of_records(&b).unwrap();
    assert_eq!(da, db);

    b[1].score = 99.0;
    let dc = TraceDigest::of_records(&b).unwrap();
    assert_ne!(da, dc);
}
