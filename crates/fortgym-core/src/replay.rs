//! Replay a persisted run.
//!
//! Loads a run's step records, checks that step indices are contiguous from
//! zero, and digests the timestamp-free content. Two runs of the seeded mock
//! with the same agent produce the same digest.

use serde::Serialize;
use tracing::{info, instrument};

use fortgym_trace::{RunId, RunSummary, StepRecord, StorageError, TraceDigest, TraceStore};

use crate::domain::{FortGymError, Result};

/// Outcome of replaying one trace.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplaySummary {
    pub run_id: RunId,
    pub step_count: u64,
    pub digest: TraceDigest,
    pub final_score: f64,
    pub reward_cum: f64,
    /// Whether the stored summary agrees with the trace. `None` when no
    /// summary was ever written.
    pub summary_consistent: Option<bool>,
}

/// Load, check and digest the trace of `run_id`.
///
/// A missing run surfaces as [`FortGymError::RunNotFound`]; a hole in the
/// step sequence as [`FortGymError::TraceGap`].
#[instrument(skip(store), fields(run_id = %run_id))]
pub async fn replay_run(
    store: &dyn TraceStore,
    run_id: &RunId,
) -> Result<(Vec<StepRecord>, ReplaySummary)> {
    let stored = store.load_summary(run_id).await?;
    let records = match store.load_records(run_id).await {
        Ok(records) => records,
        // Runs that ended before their first step have a summary and no trace.
        Err(StorageError::RunNotFound { .. }) if stored.is_some() => Vec::new(),
        Err(StorageError::RunNotFound { run_id }) => return Err(FortGymError::RunNotFound(run_id)),
        Err(e) => return Err(e.into()),
    };
    check_contiguous(run_id, &records)?;

    let digest = TraceDigest::of_records(&records)?;
    let summary_consistent = stored.as_ref().map(|s| {
        let recomputed = RunSummary::from_records(run_id.clone(), &s.backend, &s.model, s.status, &records);
        recomputed.steps == s.steps
            && recomputed.reward_cum == s.reward_cum
            && recomputed.final_score == s.final_score
            && recomputed.error_counts == s.error_counts
    });

    let reward_cum = records.iter().map(|r| r.reward).sum::<f64>();
    let summary = ReplaySummary {
        run_id: run_id.clone(),
        step_count: records.len() as u64,
        final_score: records.last().map(|r| r.score).unwrap_or(0.0),
        reward_cum: (reward_cum * 100.0).round() / 100.0,
        digest,
        summary_consistent,
    };
    info!(
        event = "run.replayed",
        steps = summary.step_count,
        digest = %summary.digest.short(),
    );
    Ok((records, summary))
}

fn check_contiguous(run_id: &RunId, records: &[StepRecord]) -> Result<()> {
    for (expected, record) in records.iter().enumerate() {
        let expected = expected as u64;
        if record.step_idx != expected {
            return Err(FortGymError::TraceGap {
                run_id: run_id.to_string(),
                expected,
                actual: record.step_idx,
            });
        }
    }
    Ok(())
}
