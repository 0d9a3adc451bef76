//! Metrics extraction, composite scoring and milestone detection.

use serde_json::Value;

use fortgym_trace::{ExecutionOutcome, Milestone, MetricsSnapshot};

use crate::domain::ValidatedAction;

pub const TARGET_SURVIVAL_TICKS: f64 = 2400.0;
pub const POP_CAP: f64 = 50.0;
pub const WEALTH_CAP: f64 = 100_000.0;
pub const SURVIVAL_WEIGHT: f64 = 30.0;
pub const POP_WEIGHT: f64 = 25.0;
pub const AVAIL_WEIGHT: f64 = 20.0;
pub const WEALTH_WEIGHT: f64 = 15.0;
pub const DRINK_THRESHOLD: i64 = 20;
pub const CASUALTY_THRESHOLD: i64 = 3;
pub const CASUALTY_PENALTY: f64 = 10.0;
pub const HOSTILES_PENALTY: f64 = 10.0;

/// Output of one scoring pass.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreCard {
    pub metrics: MetricsSnapshot,
    pub reward: f64,
    pub score: f64,
    pub milestones: Vec<Milestone>,
}

/// Turns a state transition into metrics, score and reward.
pub trait Scorer: Send + Sync {
    fn compute(
        &self,
        pre: &Value,
        post: &Value,
        action: Option<&ValidatedAction>,
        exec: &ExecutionOutcome,
    ) -> ScoreCard;
}

fn int(value: Option<&Value>) -> i64 {
    match value {
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .unwrap_or(0),
        Some(Value::Bool(b)) => i64::from(*b),
        _ => 0,
    }
}

/// Normalized metrics from a raw backend state.
pub fn metrics_from_state(state: &Value) -> MetricsSnapshot {
    let stocks = state.get("stocks");
    let wealth = stocks
        .and_then(|s| s.get("wealth"))
        .or_else(|| state.get("wealth"))
        .filter(|w| !w.is_null())
        .map(|w| int(Some(w)));

    let hostiles = match state.get("hostiles") {
        Some(Value::Bool(b)) => *b,
        Some(Value::Null) | None => state
            .get("risks")
            .and_then(Value::as_array)
            .map(|risks| {
                risks
                    .iter()
                    .any(|r| r.as_str().unwrap_or_default().to_lowercase().contains("hostile"))
            })
            .unwrap_or(false),
        Some(other) => int(Some(other)) != 0,
    };

    MetricsSnapshot {
        time: int(state.get("time")),
        pop: int(state.get("population").or_else(|| state.get("pop"))),
        food: int(stocks.and_then(|s| s.get("food"))),
        drink: int(stocks.and_then(|s| s.get("drink"))),
        wealth,
        hostiles,
        dead: int(state.get("dead")),
    }
}

/// Milestones crossed between two snapshots.
pub fn detect_milestones(prev: Option<&MetricsSnapshot>, curr: &MetricsSnapshot) -> Vec<Milestone> {
    let (prev_pop, prev_drink, prev_hostiles) = prev
        .map(|p| (p.pop, p.drink, p.hostiles))
        .unwrap_or((0, 0, false));
    let mut out = Vec::new();
    let mut hit = |key: &str| {
        out.push(Milestone {
            key: key.to_string(),
            ts: curr.time,
        })
    };
    if curr.pop >= 10 && prev_pop < 10 {
        hit("POP_10");
    }
    if curr.drink >= 50 && prev_drink < 50 {
        hit("DRINK_50");
    }
    if curr.hostiles && !prev_hostiles {
        hit("HOSTILES");
    }
    out
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Weighted survival / population / drink / wealth score with penalties.
#[derive(Debug, Default, Clone, Copy)]
pub struct CompositeScorer;

impl CompositeScorer {
    pub fn score(metrics: &MetricsSnapshot) -> f64 {
        let survival = (metrics.time as f64).clamp(0.0, TARGET_SURVIVAL_TICKS) / TARGET_SURVIVAL_TICKS;
        let pop = (metrics.pop as f64).clamp(0.0, POP_CAP) / POP_CAP;
        let drink = if metrics.drink >= DRINK_THRESHOLD { 1.0 } else { 0.0 };
        let wealth = (metrics.wealth.unwrap_or(0) as f64).clamp(0.0, WEALTH_CAP) / WEALTH_CAP;

        let mut total = survival * SURVIVAL_WEIGHT
            + pop * POP_WEIGHT
            + drink * AVAIL_WEIGHT
            + wealth * WEALTH_WEIGHT;
        if metrics.dead >= CASUALTY_THRESHOLD {
            total -= CASUALTY_PENALTY;
        }
        if metrics.hostiles {
            total -= HOSTILES_PENALTY;
        }
        round2(total)
    }
}

impl Scorer for CompositeScorer {
    fn compute(
        &self,
        pre: &Value,
        post: &Value,
        _action: Option<&ValidatedAction>,
        _exec: &ExecutionOutcome,
    ) -> ScoreCard {
        let before = (!pre.is_null()).then(|| metrics_from_state(pre));
        let metrics = metrics_from_state(post);
        let score = Self::score(&metrics);
        let reward = match &before {
            Some(b) => round2(score - Self::score(b)),
            None => 0.0,
        };
        ScoreCard {
            milestones: detect_milestones(before.as_ref(), &metrics),
            metrics,
            reward,
            score,
        }
    }
}
