//! Structured observability hooks for run, job and gate lifecycle events.
//!
//! This module provides:
//! - Run-scoped tracing spans via `RunSpan`
//! - Emission functions for key lifecycle events: run start/finish, step
//!   commit, backend errors, throttled interactive calls, job start/finish
//!
//! Events are emitted at `info!` level (warn for failures). Filter with
//! `RUST_LOG`; JSON output is selected in `telemetry::init_tracing`.

use tracing::{info, warn};

/// Run-scoped tracing span.
///
/// Use [`RunSpan::enter`] in synchronous code. Async code should attach
/// [`RunSpan::span`] with `tracing::Instrument` so the future stays `Send`.
pub struct RunSpan {
    span: tracing::Span,
}

impl RunSpan {
    pub fn new(run_id: &str) -> Self {
        Self {
            span: tracing::info_span!("fortgym.run", run_id = %run_id),
        }
    }

    /// Create and enter a span tagged with the run_id.
    pub fn enter(run_id: &str) -> tracing::span::EnteredSpan {
        Self::new(run_id).span.entered()
    }

    pub fn span(&self) -> tracing::Span {
        self.span.clone()
    }
}

/// Emit event: run started.
///
/// ```ignore
/// emit_run_started("run-123", "mock", "fake", 10);
/// // logs: event=run.started run_id=run-123 backend=mock model=fake max_steps=10
/// ```
pub fn emit_run_started(run_id: &str, backend: &str, model: &str, max_steps: u64) {
    info!(
        event = "run.started",
        run_id = %run_id,
        backend = %backend,
        model = %model,
        max_steps = max_steps,
    );
}

/// Emit event: one step record is durable.
pub fn emit_step_committed(run_id: &str, step_idx: u64, score: f64, reward: f64, errors: usize) {
    info!(
        event = "step.committed",
        run_id = %run_id,
        step_idx = step_idx,
        score = score,
        reward = reward,
        errors = errors,
    );
}

/// Emit event: run reached a terminal status.
pub fn emit_run_finished(run_id: &str, status: &str, steps: u64, reward_cum: f64) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        status = %status,
        steps = steps,
        reward_cum = reward_cum,
    );
}

/// Emit event: a backend call failed (warning level).
pub fn emit_backend_error(run_id: &str, op: &str, attempt: u32, error: &dyn std::fmt::Display) {
    warn!(
        event = "backend.error",
        run_id = %run_id,
        op = %op,
        attempt = attempt,
        error = %error,
    );
}

/// Emit event: an interactive call was refused by the gate.
pub fn emit_gate_throttled(run_id: &str, reason: &str, retry_after_ms: u64) {
    info!(
        event = "gate.throttled",
        run_id = %run_id,
        reason = %reason,
        retry_after_ms = retry_after_ms,
    );
}

/// Emit event: job workers spawned.
pub fn emit_job_started(job_id: &str, total: usize, parallelism: usize) {
    info!(
        event = "job.started",
        job_id = %job_id,
        total = total,
        parallelism = parallelism,
    );
}

/// Emit event: every run in the job is terminal.
pub fn emit_job_finished(job_id: &str, completed: u64, failed: u64, cancelled: u64) {
    info!(
        event = "job.finished",
        job_id = %job_id,
        completed = completed,
        failed = failed,
        cancelled = cancelled,
    );
}

/// Emit event: a mid-run summary refresh failed; the step itself is durable.
pub fn emit_summary_refresh_error(run_id: &str, steps: u64, error: &dyn std::fmt::Display) {
    warn!(event = "summary.refresh_error", run_id = %run_id, steps = steps, error = %error);
}

/// Emit event: a run's engine panicked; the run is finished as failed.
pub fn emit_run_panicked(run_id: &str, message: &str) {
    warn!(event = "run.panicked", run_id = %run_id, message = %message);
}

/// Emit event: summary could not be written at run end (warning level).
pub fn emit_run_finalize_error(run_id: &str, error: &dyn std::fmt::Display) {
    warn!(event = "run.finalize_error", run_id = %run_id, error = %error);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_span_create() {
        let _span = RunSpan::enter("test-run-id");
        let _detached = RunSpan::new("test-run-id").span();
    }
}
