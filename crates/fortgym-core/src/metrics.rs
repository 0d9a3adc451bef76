//! Global atomic counters for fort-gym observability.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (e.g. when a job finishes).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters, no allocations, no locking.
pub struct Metrics {
    steps_committed: AtomicU64,
    actions_rejected: AtomicU64,
    backend_errors: AtomicU64,
    throttled: AtomicU64,
    runs_finished: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            steps_committed: AtomicU64::new(0),
            actions_rejected: AtomicU64::new(0),
            backend_errors: AtomicU64::new(0),
            throttled: AtomicU64::new(0),
            runs_finished: AtomicU64::new(0),
        }
    }

    pub fn inc_steps_committed(&self) {
        self.steps_committed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "steps_committed", "counter incremented");
    }

    /// An action refused by the validator or never produced by the agent.
    pub fn inc_actions_rejected(&self) {
        self.actions_rejected.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "actions_rejected", "counter incremented");
    }

    pub fn inc_backend_errors(&self) {
        self.backend_errors.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "backend_errors", "counter incremented");
    }

    pub fn inc_throttled(&self) {
        self.throttled.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "throttled", "counter incremented");
    }

    pub fn inc_runs_finished(&self) {
        self.runs_finished.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "runs_finished", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            steps_committed = self.steps_committed(),
            actions_rejected = self.actions_rejected(),
            backend_errors = self.backend_errors(),
            throttled = self.throttled(),
            runs_finished = self.runs_finished(),
        );
    }

    pub fn steps_committed(&self) -> u64 {
        self.steps_committed.load(Ordering::Relaxed)
    }

    pub fn actions_rejected(&self) -> u64 {
        self.actions_rejected.load(Ordering::Relaxed)
    }

    pub fn backend_errors(&self) -> u64 {
        self.backend_errors.load(Ordering::Relaxed)
    }

    pub fn throttled(&self) -> u64 {
        self.throttled.load(Ordering::Relaxed)
    }

    pub fn runs_finished(&self) -> u64 {
        self.runs_finished.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.steps_committed.store(0, Ordering::Relaxed);
        self.actions_rejected.store(0, Ordering::Relaxed);
        self.backend_errors.store(0, Ordering::Relaxed);
        self.throttled.store(0, Ordering::Relaxed);
        self.runs_finished.store(0, Ordering::Relaxed);
    }
}
