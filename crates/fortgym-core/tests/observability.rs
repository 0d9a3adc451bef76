//! Observability tests for fort-gym run lifecycle tracing.
//!
//! These verify that structured tracing events are emitted without panics
//! for run start/finish, step commit, backend errors, throttling and jobs.

use std::sync::Arc;

use fortgym_core::obs::{
    emit_backend_error, emit_gate_throttled, emit_job_finished, emit_job_started,
    emit_run_finalize_error, emit_run_finished, emit_run_started, emit_step_committed,
};
use fortgym_core::{CancellationFlag, Orchestrator, RunSpan, RunSpec, Settings, METRICS};
use fortgym_trace::fakes::MemoryTraceStore;
use tracing_test::traced_test;

#[traced_test]
#[test]
fn test_emit_run_lifecycle_events() {
    emit_run_started("run-123", "mock", "fake", 10);
    emit_step_committed("run-123", 0, 42.5, 1.25, 0);
    emit_run_finished("run-123", "completed", 10, 12.0);
}

#[traced_test]
#[test]
fn test_emit_warning_events() {
    emit_backend_error("run-err-001", "execute", 2, &"connection reset");
    emit_run_finalize_error("run-err-001", &"disk full");
}

#[traced_test]
#[test]
fn test_emit_gate_and_job_events() {
    emit_gate_throttled("run-gate-001", "too_soon", 250);
    emit_job_started("job-1", 10, 2);
    emit_job_finished("job-1", 9, 1, 0);
}

#[traced_test]
#[test]
fn test_run_span_enter_creates_span() {
    let span = RunSpan::enter("test-span-run");
    drop(span);
}

#[traced_test]
#[tokio::test]
async fn test_full_run_emits_and_counts() {
    let before = METRICS.steps_committed();
    let o = Orchestrator::new(Settings::default(), Arc::new(MemoryTraceStore::new()));
    o.run_to_completion(&RunSpec::new("mock", "fake", 2), &CancellationFlag::new())
        .await
        .unwrap();

    // Counters are process-global; other tests may bump them concurrently.
    assert!(METRICS.steps_committed() >= before + 2);
    METRICS.flush();
}
