//! Deterministic mock fortress.
//!
//! Same seed and same action sequence always yield the same states. Stocks
//! decay as ticks pass (food every 50 ticks, drink every 60), and a migrant
//! arrives every 1000 ticks. Faults and latency can be injected per backend
//! call for failure-path and serialization tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use super::{
    encode_observation, AdvanceOutcome, BackendError, BackendErrorKind, BackendOp, BackendResult,
    Environment, ExecOutcome, Observation,
};
use crate::domain::{Action, ValidatedAction};

pub const DEFAULT_SEED: u64 = 123;
pub const MAP_BOUNDS: [i64; 3] = [200, 200, 50];

const START_POPULATION: i64 = 7;
const START_FOOD: i64 = 100;
const START_DRINK: i64 = 80;
const FOOD_DECAY_TICKS: i64 = 50;
const DRINK_DECAY_TICKS: i64 = 60;
const MIGRANT_INTERVAL: i64 = 1000;
const RECENT_EVENTS: usize = 5;

#[derive(Debug, Clone)]
struct Fortress {
    time: i64,
    population: i64,
    food: i64,
    drink: i64,
    dead: i64,
    risks: Vec<String>,
    reminders: Vec<String>,
    recent_events: Vec<String>,
    workshops: BTreeMap<String, i64>,
}

impl Fortress {
    fn new() -> Self {
        Self {
            time: 0,
            population: START_POPULATION,
            food: START_FOOD,
            drink: START_DRINK,
            dead: 0,
            risks: Vec::new(),
            reminders: Vec::new(),
            recent_events: Vec::new(),
            workshops: BTreeMap::new(),
        }
    }

    fn state(&self, seed: u64) -> Value {
        let skip = self.recent_events.len().saturating_sub(RECENT_EVENTS);
        let dwarves: Vec<Value> = (1..=self.population)
            .map(|i| json!({"name": format!("Dwarf {i}"), "mood": "content"}))
            .collect();
        json!({
            "seed": seed,
            "time": self.time,
            "population": self.population,
            "stocks": {"food": self.food, "drink": self.drink},
            "risks": self.risks,
            "reminders": self.reminders,
            "recent_events": &self.recent_events[skip..],
            "dwarves": dwarves,
            "map_bounds": MAP_BOUNDS,
            "workshops": self.workshops,
            "dead": self.dead,
        })
    }

    fn apply(&mut self, action: &Action) -> ExecOutcome {
        let summary = match action {
            Action::Dig(d) | Action::Channel(d) => {
                self.food = (self.food - 1).max(0);
                format!(
                    "{}: {}x{} at ({}, {}, {})",
                    action.action_type(),
                    d.width,
                    d.height,
                    d.origin.x,
                    d.origin.y,
                    d.origin.z
                )
            }
            Action::Build(b) => {
                self.drink = (self.drink - 1).max(0);
                *self.workshops.entry(b.kind.as_str().to_string()).or_insert(0) += 1;
                format!("BUILD: {} at ({}, {}, {})", b.kind.as_str(), b.at.x, b.at.y, b.at.z)
            }
            Action::Order(o) => {
                self.reminders
                    .push(format!("Order queued: {} x{}", o.item.as_str(), o.quantity));
                format!("ORDER: {} x{}", o.item.as_str(), o.quantity)
            }
            Action::Wait(_) => "WAIT".to_string(),
            Action::Inspect(_) => "INSPECT".to_string(),
            Action::Noop => "NOOP".to_string(),
            Action::Keystroke(_) => {
                return ExecOutcome {
                    accepted: false,
                    detail: Some("keystrokes need a live interface".to_string()),
                }
            }
        };
        self.recent_events.push(summary.clone());
        ExecOutcome {
            accepted: true,
            detail: Some(summary),
        }
    }

    fn advance(&mut self, ticks: u32) {
        let before = self.time;
        let ticks = i64::from(ticks);
        self.time += ticks;
        self.food = (self.food - ticks / FOOD_DECAY_TICKS).max(0);
        self.drink = (self.drink - ticks / DRINK_DECAY_TICKS).max(0);

        let migrants = self.time / MIGRANT_INTERVAL - before / MIGRANT_INTERVAL;
        for _ in 0..migrants {
            self.population += 1;
            self.recent_events.push("Migrant arrived".to_string());
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Fault {
    kind: BackendErrorKind,
    /// `None` fails every call at that step.
    remaining: Option<u32>,
}

#[derive(Debug)]
struct Inner {
    fortress: Fortress,
    /// Number of completed advances; identifies the current step.
    advances: u64,
    faults: HashMap<(BackendOp, u64), Fault>,
    calls: HashMap<BackendOp, u64>,
}

impl Inner {
    fn check_fault(&mut self, op: BackendOp) -> BackendResult<()> {
        let key = (op, self.advances);
        let Some(fault) = self.faults.get_mut(&key) else {
            return Ok(());
        };
        let kind = fault.kind;
        match fault.remaining.as_mut() {
            Some(0) => return Ok(()),
            Some(n) => *n -= 1,
            None => {}
        }
        Err(BackendError::new(
            op,
            kind,
            format!("injected fault at step {}", key.1),
        ))
    }
}

/// In-process fortress simulation.
#[derive(Debug)]
pub struct MockEnvironment {
    seed: u64,
    latency: Option<Duration>,
    horizon: Option<i64>,
    inner: Mutex<Inner>,
    in_flight: AtomicU64,
    peak_in_flight: AtomicU64,
}

impl Default for MockEnvironment {
    fn default() -> Self {
        Self::new(DEFAULT_SEED)
    }
}

impl MockEnvironment {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            latency: None,
            horizon: None,
            inner: Mutex::new(Inner {
                fortress: Fortress::new(),
                advances: 0,
                faults: HashMap::new(),
                calls: HashMap::new(),
            }),
            in_flight: AtomicU64::new(0),
            peak_in_flight: AtomicU64::new(0),
        }
    }

    /// Sleep this long inside every call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Report `terminal` once simulated time reaches `ticks`.
    pub fn with_horizon(mut self, ticks: i64) -> Self {
        self.horizon = Some(ticks);
        self
    }

    /// Fail every `op` call made during the given steps.
    pub fn fail_on(self, op: BackendOp, steps: impl IntoIterator<Item = u64>, kind: BackendErrorKind) -> Self {
        self.add_faults(op, steps, kind, None)
    }

    /// Fail only the first `op` call made during each given step.
    pub fn fail_once_on(self, op: BackendOp, steps: impl IntoIterator<Item = u64>, kind: BackendErrorKind) -> Self {
        self.add_faults(op, steps, kind, Some(1))
    }

    fn add_faults(
        self,
        op: BackendOp,
        steps: impl IntoIterator<Item = u64>,
        kind: BackendErrorKind,
        remaining: Option<u32>,
    ) -> Self {
        {
            let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            for step in steps {
                inner.faults.insert((op, step), Fault { kind, remaining });
            }
        }
        self
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Back to the seeded starting fortress. Injected faults are kept.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.fortress = Fortress::new();
        inner.advances = 0;
        inner.calls.clear();
    }

    /// Calls made for `op`, including failed ones.
    pub fn calls(&self, op: BackendOp) -> u64 {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.calls.get(&op).copied().unwrap_or(0)
    }

    /// Highest number of calls ever observed running at once.
    pub fn peak_in_flight(&self) -> u64 {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    async fn call<T, F>(&self, op: BackendOp, f: F) -> BackendResult<T>
    where
        F: FnOnce(&mut Inner, u64) -> BackendResult<T> + Send,
        T: Send,
    {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        *inner.calls.entry(op).or_insert(0) += 1;
        inner.check_fault(op)?;
        f(&mut inner, self.seed)
    }
}

struct InFlight<'a>(&'a AtomicU64);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Environment for MockEnvironment {
    fn kind(&self) -> &str {
        "mock"
    }

    async fn pause(&self) -> BackendResult<()> {
        self.call(BackendOp::Pause, |_, _| Ok(())).await
    }

    async fn observe(&self) -> BackendResult<Observation> {
        self.call(BackendOp::Observe, |inner, seed| {
            let state = inner.fortress.state(seed);
            Ok(Observation {
                text: encode_observation(&state),
                state,
            })
        })
        .await
    }

    async fn execute(&self, action: &ValidatedAction) -> BackendResult<ExecOutcome> {
        self.call(BackendOp::Execute, |inner, _| {
            let outcome = inner.fortress.apply(action.action());
            debug!(action = %action.action_type(), accepted = outcome.accepted, "mock execute");
            Ok(outcome)
        })
        .await
    }

    async fn advance(&self, ticks: u32) -> BackendResult<AdvanceOutcome> {
        let horizon = self.horizon;
        self.call(BackendOp::Advance, move |inner, seed| {
            inner.fortress.advance(ticks);
            inner.advances += 1;
            let terminal = horizon.is_some_and(|h| inner.fortress.time >= h);
            Ok(AdvanceOutcome {
                ticks,
                state: inner.fortress.state(seed),
                terminal,
            })
        })
        .await
    }
}
