//! Incremental run summary built from step records.

use std::collections::BTreeMap;

use chrono::Utc;

use crate::storage_traits::{ErrorKind, Milestone, RunId, RunStatus, RunSummary, StepRecord};

/// Folds step records into a [`RunSummary`] one at a time.
///
/// The same fold backs live summaries (fed by the trace writer) and
/// recomputation from a persisted trace, so both agree by construction.
#[derive(Debug, Clone)]
pub struct SummaryAccumulator {
    run_id: RunId,
    backend: String,
    model: String,
    steps: u64,
    reward_cum: f64,
    final_score: f64,
    duration_ticks: i64,
    peak_pop: i64,
    end_pop: i64,
    milestones: Vec<Milestone>,
    error_counts: BTreeMap<ErrorKind, u64>,
}

impl SummaryAccumulator {
    pub fn new(run_id: RunId, backend: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            run_id,
            backend: backend.into(),
            model: model.into(),
            steps: 0,
            reward_cum: 0.0,
            final_score: 0.0,
            duration_ticks: 0,
            peak_pop: 0,
            end_pop: 0,
            milestones: Vec::new(),
            error_counts: BTreeMap::new(),
        }
    }

    /// Fold one record.
    pub fn observe(&mut self, record: &StepRecord) {
        self.steps += 1;
        self.reward_cum += record.reward;
        self.final_score = record.score;
        self.duration_ticks = self.duration_ticks.max(record.metrics.time);
        self.peak_pop = self.peak_pop.max(record.metrics.pop);
        self.end_pop = record.metrics.pop;
        self.milestones.extend(record.milestones.iter().cloned());
        for kind in &record.errors {
            *self.error_counts.entry(*kind).or_insert(0) += 1;
        }
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Current summary, stamped with `status`.
    pub fn snapshot(&self, status: RunStatus) -> RunSummary {
        RunSummary {
            run_id: self.run_id.clone(),
            backend: self.backend.clone(),
            model: self.model.clone(),
            status,
            steps: self.steps,
            reward_cum: round2(self.reward_cum),
            final_score: self.final_score,
            duration_ticks: self.duration_ticks,
            peak_pop: self.peak_pop,
            end_pop: self.end_pop,
            milestones: self.milestones.clone(),
            error_counts: self.error_counts.clone(),
            updated_at: Utc::now(),
        }
    }
}

impl RunSummary {
    /// Recompute a summary from a full trace.
    pub fn from_records(
        run_id: RunId,
        backend: &str,
        model: &str,
        status: RunStatus,
        records: &[StepRecord],
    ) -> Self {
        let mut acc = SummaryAccumulator::new(run_id, backend, model);
        for record in records {
            acc.observe(record);
        }
        acc.snapshot(status)
    }

    /// Count of a given error kind (0 when never seen).
    pub fn error_count(&self, kind: ErrorKind) -> u64 {
        self.error_counts.get(&kind).copied().unwrap_or(0)
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage_traits::{
        ActionOrigin, AdvanceRecord, ExecutionOutcome, MetricsSnapshot, ValidationOutcome,
    };

    fn record(step_idx: u64, pop: i64, time: i64, reward: f64, errors: Vec<ErrorKind>) -> StepRecord {
        StepRecord {
            run_id: RunId::from("run-sum"),
            step_idx,
            observation: serde_json::json!({}),
            observation_text: String::new(),
            origin: ActionOrigin::Agent,
            action: None,
            validation: ValidationOutcome::accepted(),
            execution: ExecutionOutcome::Applied {
                attempts: 1,
                detail: None,
            },
            advance: AdvanceRecord::Advanced {
                ticks: 100,
                terminal: false,
            },
            post_state: serde_json::json!({}),
            metrics: MetricsSnapshot {
                time,
                pop,
                ..MetricsSnapshot::default()
            },
            score: reward * 10.0,
            reward,
            milestones: Vec::new(),
            errors,
            events: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn accumulates_steps_rewards_and_population() {
        let records = vec![
            record(0, 7, 100, 1.5, vec![]),
            record(1, 9, 200, 0.25, vec![ErrorKind::InvalidParams]),
            record(2, 8, 300, -0.5, vec![ErrorKind::BackendError, ErrorKind::InvalidParams]),
        ];
        let summary = RunSummary::from_records(
            RunId::from("run-sum"),
            "mock",
            "fake",
            RunStatus::Completed,
            &records,
        );

        assert_eq!(summary.steps, 3);
        assert_eq!(summary.reward_cum, 1.25);
        assert_eq!(summary.final_score, -5.0);
        assert_eq!(summary.peak_pop, 9);
        assert_eq!(summary.end_pop, 8);
        assert_eq!(summary.duration_ticks, 300);
        assert_eq!(summary.error_count(ErrorKind::InvalidParams), 2);
        assert_eq!(summary.error_count(ErrorKind::BackendError), 1);
        assert_eq!(summary.error_count(ErrorKind::AgentError), 0);
    }

    #[test]
    fn empty_trace_yields_zeroed_summary() {
        let summary = RunSummary::from_records(
            RunId::from("run-empty"),
            "mock",
            "fake",
            RunStatus::Failed,
            &[],
        );
        assert_eq!(summary.steps, 0);
        assert_eq!(summary.status, RunStatus::Failed);
        assert!(summary.error_counts.is_empty());
    }
}
