//! Agent contract and built-in deterministic agents.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::{json, Value};

/// A decision call that produced no usable action.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AgentError {
    #[error("agent timed out after {ms}ms")]
    Timeout { ms: u64 },

    #[error("agent returned unparseable output: {0}")]
    Malformed(String),

    #[error("agent failed: {0}")]
    Failed(String),
}

/// Something that picks one action per step.
///
/// Whatever JSON comes back is validated before it reaches a backend; an
/// agent never needs to pre-check its own output.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Name recorded as the run's model.
    fn name(&self) -> &str;

    async fn decide(&self, observation_text: &str, state: &Value) -> Result<Value, AgentError>;
}

/// Always digs the same small rectangle.
#[derive(Debug, Default, Clone)]
pub struct FakeAgent;

#[async_trait]
impl Agent for FakeAgent {
    fn name(&self) -> &str {
        "fake"
    }

    async fn decide(&self, _observation_text: &str, _state: &Value) -> Result<Value, AgentError> {
        Ok(json!({
            "type": "DIG",
            "params": {"area": [60, 18, 0], "size": [3, 3, 1]},
            "intent": "fake agent baseline",
        }))
    }
}

/// Rotates through a fixed list of safe actions.
#[derive(Debug, Default)]
pub struct CycleAgent {
    cursor: AtomicUsize,
}

impl CycleAgent {
    pub fn new() -> Self {
        Self::default()
    }

    fn rotation() -> [Value; 5] {
        [
            json!({"type": "DIG", "params": {"area": [60, 18, 0], "size": [5, 5, 1]}, "intent": "expand living quarters"}),
            json!({"type": "BUILD", "params": {"kind": "CarpenterWorkshop", "x": 65, "y": 22, "z": 0}, "intent": "furniture production"}),
            json!({"type": "ORDER", "params": {"item": "bed", "quantity": 2}, "intent": "beds for the dormitory"}),
            json!({"type": "WAIT", "params": {"ticks": 100}, "intent": "let jobs progress"}),
            json!({"type": "INSPECT", "params": {"x": 60, "y": 18, "z": 0}, "intent": "check the dig site"}),
        ]
    }
}

#[async_trait]
impl Agent for CycleAgent {
    fn name(&self) -> &str {
        "cycle"
    }

    async fn decide(&self, _observation_text: &str, _state: &Value) -> Result<Value, AgentError> {
        let rotation = Self::rotation();
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % rotation.len();
        Ok(rotation[idx].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validator::validate;

    fn bounds() -> Value {
        json!({"map_bounds": [200, 200, 50]})
    }

    #[tokio::test]
    async fn fake_agent_proposes_a_valid_dig() {
        let raw = FakeAgent.decide("", &bounds()).await.unwrap();
        let action = validate(&raw, &bounds()).unwrap();
        assert_eq!(action.intent(), Some("fake agent baseline"));
    }

    #[tokio::test]
    async fn cycle_agent_rotation_is_valid_and_wraps() {
        let agent = CycleAgent::new();
        let mut types = Vec::new();
        for _ in 0..6 {
            let raw = agent.decide("", &bounds()).await.unwrap();
            types.push(validate(&raw, &bounds()).unwrap().action_type().as_str());
        }
        assert_eq!(types, vec!["DIG", "BUILD", "ORDER", "WAIT", "INSPECT", "DIG"]);
    }
}
