//! Per-run trace writer.
//!
//! A `TraceWriter` is owned by exactly one step engine, so a run's trace
//! only ever has one writer. `commit` returns once the record is durable;
//! the summary is refreshed every `summary_every` steps and rewritten when
//! the run finishes. Only the append can fail a commit: a refresh that
//! cannot be written is logged and retried at the next refresh.

use std::sync::Arc;

use tracing::{debug, instrument};

use crate::obs;

use fortgym_trace::{
    RunId, RunStatus, RunSummary, StepRecord, StorageResult, SummaryAccumulator, TraceStore,
};

pub struct TraceWriter {
    store: Arc<dyn TraceStore>,
    run_id: RunId,
    summary: SummaryAccumulator,
    summary_every: u64,
}

impl TraceWriter {
    pub fn new(
        store: Arc<dyn TraceStore>,
        run_id: RunId,
        backend: &str,
        model: &str,
        summary_every: u64,
    ) -> Self {
        Self {
            summary: SummaryAccumulator::new(run_id.clone(), backend, model),
            store,
            run_id,
            summary_every: summary_every.max(1),
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn steps_committed(&self) -> u64 {
        self.summary.steps()
    }

    /// Durably append one record; refresh the summary on schedule.
    #[instrument(skip(self, record), fields(run_id = %self.run_id, step_idx = record.step_idx), level = "debug")]
    pub async fn commit(&mut self, record: &StepRecord, status: RunStatus) -> StorageResult<()> {
        self.store.append_record(record).await?;
        self.summary.observe(record);

        let steps = self.summary.steps();
        if steps % self.summary_every == 0 {
            match self.store.write_summary(&self.summary.snapshot(status)).await {
                Ok(()) => debug!(steps, "summary refreshed"),
                Err(e) => obs::emit_summary_refresh_error(self.run_id.as_str(), steps, &e),
            }
        }
        Ok(())
    }

    /// Rewrite the summary with the run's final status.
    pub async fn finalize(&mut self, status: RunStatus) -> StorageResult<RunSummary> {
        let summary = self.summary.snapshot(status);
        self.store.write_summary(&summary).await?;
        Ok(summary)
    }

    /// Summary as of the last committed step.
    pub fn current_summary(&self, status: RunStatus) -> RunSummary {
        self.summary.snapshot(status)
    }
}

impl std::fmt::Debug for TraceWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceWriter")
            .field("run_id", &self.run_id)
            .field("steps", &self.summary.steps())
            .field("summary_every", &self.summary_every)
            .finish()
    }
}
