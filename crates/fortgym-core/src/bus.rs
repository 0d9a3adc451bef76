//! Per-run ordered event bus.
//!
//! Each run has one [`EventBus`]. It stamps every event with the next
//! sequence number, keeps the full history, and fans events out over a
//! broadcast channel. Sequence assignment, the history append and the
//! broadcast happen under one lock, so a subscriber that snapshots history
//! and attaches a receiver under that same lock sees every event exactly
//! once: the replayed prefix, then the live tail.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use fortgym_trace::{Event, EventKind, RunId};

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug)]
struct BusState {
    next_seq: u64,
    history: Vec<Event>,
    /// Dropped on close so live receivers see the end of the stream.
    tx: Option<broadcast::Sender<Event>>,
}

#[derive(Debug)]
pub struct EventBus {
    run_id: RunId,
    state: Mutex<BusState>,
}

impl EventBus {
    pub fn new(run_id: RunId) -> Arc<Self> {
        Self::with_capacity(run_id, DEFAULT_CAPACITY)
    }

    /// `capacity` bounds how far a live receiver may lag before it falls
    /// back to history.
    pub fn with_capacity(run_id: RunId, capacity: usize) -> Arc<Self> {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Arc::new(Self {
            run_id,
            state: Mutex::new(BusState {
                next_seq: 1,
                history: Vec::new(),
                tx: Some(tx),
            }),
        })
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Stamp, record and publish one event.
    pub fn emit(&self, step_idx: u64, kind: EventKind, payload: serde_json::Value) -> Event {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let event = self.stamp(&mut state, step_idx, kind, payload);
        self.deliver(&mut state, &event);
        event
    }

    /// Stamp an event with the next sequence number without publishing it.
    ///
    /// Staged events reach history and subscribers only through
    /// [`EventBus::publish`]. A staged event that is never published leaves
    /// a gap in the sequence; order is still strictly increasing.
    pub fn stage(&self, step_idx: u64, kind: EventKind, payload: serde_json::Value) -> Event {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.stamp(&mut state, step_idx, kind, payload)
    }

    /// Record and publish previously staged events, in order.
    pub fn publish(&self, events: &[Event]) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        for event in events {
            let last = state.history.last().map_or(0, |e| e.seq);
            if event.seq <= last {
                warn!(run_id = %self.run_id, seq = event.seq, last, "dropped out-of-order staged event");
                continue;
            }
            self.deliver(&mut state, event);
        }
    }

    fn stamp(
        &self,
        state: &mut BusState,
        step_idx: u64,
        kind: EventKind,
        payload: serde_json::Value,
    ) -> Event {
        let event = Event {
            run_id: self.run_id.clone(),
            step_idx,
            seq: state.next_seq,
            kind,
            payload,
            timestamp: Utc::now(),
        };
        state.next_seq += 1;
        event
    }

    fn deliver(&self, state: &mut BusState, event: &Event) {
        state.history.push(event.clone());
        match &state.tx {
            // No receivers is fine.
            Some(tx) => {
                let _ = tx.send(event.clone());
            }
            None => warn!(run_id = %self.run_id, seq = event.seq, "event emitted after bus closed"),
        }
    }

    /// Replay everything so far, then follow live events.
    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let backlog: VecDeque<Event> = state.history.iter().cloned().collect();
        let rx = state.tx.as_ref().map(broadcast::Sender::subscribe);
        Subscription {
            bus: Arc::clone(self),
            backlog,
            rx,
            last_seq: 0,
        }
    }

    /// All events with `seq > after`.
    pub fn history_after(&self, after: u64) -> Vec<Event> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state
            .history
            .iter()
            .filter(|e| e.seq > after)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// End the live stream. History stays readable.
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.tx.take().is_some() {
            debug!(run_id = %self.run_id, events = state.history.len(), "event bus closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.tx.is_none()
    }
}

/// A subscriber's view: replayed history followed by the live tail.
#[derive(Debug)]
pub struct Subscription {
    bus: Arc<EventBus>,
    backlog: VecDeque<Event>,
    rx: Option<broadcast::Receiver<Event>>,
    last_seq: u64,
}

impl Subscription {
    /// Next event in sequence order; `None` once the bus is closed and drained.
    pub async fn next(&mut self) -> Option<Event> {
        loop {
            if let Some(event) = self.backlog.pop_front() {
                if event.seq <= self.last_seq {
                    continue;
                }
                self.last_seq = event.seq;
                return Some(event);
            }

            let rx = self.rx.as_mut()?;
            match rx.recv().await {
                Ok(event) if event.seq <= self.last_seq => continue,
                Ok(event) => {
                    self.last_seq = event.seq;
                    return Some(event);
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    debug!(run_id = %self.bus.run_id, missed, "subscriber lagged; refilling from history");
                    self.backlog.extend(self.bus.history_after(self.last_seq));
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.rx = None;
                    // Anything emitted between our last receive and close.
                    self.backlog.extend(self.bus.history_after(self.last_seq));
                    if self.backlog.is_empty() {
                        return None;
                    }
                }
            }
        }
    }

    /// Next event if one is ready right now.
    pub fn try_next(&mut self) -> Option<Event> {
        loop {
            if let Some(event) = self.backlog.pop_front() {
                if event.seq <= self.last_seq {
                    continue;
                }
                self.last_seq = event.seq;
                return Some(event);
            }
            let rx = self.rx.as_mut()?;
            match rx.try_recv() {
                Ok(event) if event.seq <= self.last_seq => continue,
                Ok(event) => {
                    self.last_seq = event.seq;
                    return Some(event);
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => {
                    self.backlog.extend(self.bus.history_after(self.last_seq));
                }
                Err(_) => return None,
            }
        }
    }

    /// Sequence number of the last event handed out.
    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }
}

/// run_id → bus registry used by subscribers.
#[derive(Debug, Default)]
pub struct EventHub {
    buses: Mutex<HashMap<RunId, Arc<EventBus>>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// The bus for `run_id`, created on first use.
    pub fn bus(&self, run_id: &RunId) -> Arc<EventBus> {
        let mut buses = self.buses.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            buses
                .entry(run_id.clone())
                .or_insert_with(|| EventBus::new(run_id.clone())),
        )
    }

    pub fn get(&self, run_id: &RunId) -> Option<Arc<EventBus>> {
        let buses = self.buses.lock().unwrap_or_else(PoisonError::into_inner);
        buses.get(run_id).cloned()
    }

    pub fn subscribe(&self, run_id: &RunId) -> Option<Subscription> {
        self.get(run_id).map(|bus| bus.subscribe())
    }

    pub fn remove(&self, run_id: &RunId) -> Option<Arc<EventBus>> {
        let mut buses = self.buses.lock().unwrap_or_else(PoisonError::into_inner);
        buses.remove(run_id)
    }
}
