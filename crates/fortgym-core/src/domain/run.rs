//! Run tracking.

use chrono::{DateTime, Utc};
use fortgym_trace::{RunId, RunStatus};
use serde::{Deserialize, Serialize};

use crate::domain::error::{FortGymError, Result};

/// Input accepted when creating a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunSpec {
    /// Registered backend name (`mock` is always available).
    pub backend: String,

    /// Registered agent name.
    pub model: String,

    /// Upper bound on committed steps.
    pub max_steps: u64,

    /// Ticks advanced after every step; `None` uses the configured default.
    #[serde(default)]
    pub ticks_per_step: Option<u32>,
}

impl RunSpec {
    pub fn new(backend: impl Into<String>, model: impl Into<String>, max_steps: u64) -> Self {
        Self {
            backend: backend.into(),
            model: model.into(),
            max_steps,
            ticks_per_step: None,
        }
    }

    pub fn with_ticks_per_step(mut self, ticks: u32) -> Self {
        self.ticks_per_step = Some(ticks);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.backend.trim().is_empty() {
            return Err(FortGymError::InvalidRunSpec("backend must not be empty".into()));
        }
        if self.model.trim().is_empty() {
            return Err(FortGymError::InvalidRunSpec("model must not be empty".into()));
        }
        if self.ticks_per_step == Some(0) {
            return Err(FortGymError::InvalidRunSpec(
                "ticks_per_step must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// A single execution of an agent against a backend.
///
/// Owned by exactly one step engine; everything else sees snapshots.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Run {
    pub run_id: RunId,
    pub backend: String,
    pub model: String,
    pub max_steps: u64,
    pub ticks_per_step: u32,

    /// Index of the next step to execute; equals the number of committed steps.
    pub step_idx: u64,

    pub status: RunStatus,
    pub reward_cum: f64,
    pub last_score: f64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Run {
    /// Create a new run in `Created` state.
    pub fn new(run_id: RunId, spec: &RunSpec, ticks_per_step: u32) -> Self {
        Self {
            run_id,
            backend: spec.backend.clone(),
            model: spec.model.clone(),
            max_steps: spec.max_steps,
            ticks_per_step,
            step_idx: 0,
            status: RunStatus::Created,
            reward_cum: 0.0,
            last_score: 0.0,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn steps_remaining(&self) -> u64 {
        self.max_steps.saturating_sub(self.step_idx)
    }
}
