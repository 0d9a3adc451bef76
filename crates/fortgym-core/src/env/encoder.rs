//! Observation text encoding.

use serde_json::Value;

fn int_at(state: &Value, path: &[&str]) -> i64 {
    let mut cur = state;
    for key in path {
        match cur.get(key) {
            Some(next) => cur = next,
            None => return 0,
        }
    }
    cur.as_i64().unwrap_or(0)
}

fn strings_at(state: &Value, key: &str) -> Vec<String> {
    state
        .get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Bulleted summary of a fortress state: time, population, stocks, risks, reminders.
pub fn encode_observation(state: &Value) -> String {
    let mut bullets = vec![
        format!("- Time: tick {}", int_at(state, &["time"])),
        format!("- Population: {} dwarves", int_at(state, &["population"])),
        format!(
            "- Stocks: food={}, drink={}",
            int_at(state, &["stocks", "food"]),
            int_at(state, &["stocks", "drink"])
        ),
    ];

    let risks = strings_at(state, "risks");
    if risks.is_empty() {
        bullets.push("- Risks: none detected".to_string());
    } else {
        bullets.push(format!("- Risks: {}", risks.join(", ")));
    }

    let reminders = strings_at(state, "reminders");
    if reminders.is_empty() {
        bullets.push("- Reminders: none".to_string());
    } else {
        bullets.push(format!("- Reminders: {}", reminders.join("; ")));
    }

    bullets.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn encodes_all_bullets() {
        let state = json!({
            "time": 400,
            "population": 8,
            "stocks": {"food": 91, "drink": 73},
            "risks": ["hostile goblins"],
            "reminders": ["Order queued: bed x2", "Check still"],
        });
        let text = encode_observation(&state);
        assert_eq!(
            text,
            "- Time: tick 400\n\
             - Population: 8 dwarves\n\
             - Stocks: food=91, drink=73\n\
             - Risks: hostile goblins\n\
             - Reminders: Order queued: bed x2; Check still"
        );
    }

    #[test]
    fn empty_state_uses_defaults() {
        let text = encode_observation(&json!({}));
        assert!(text.contains("- Time: tick 0"));
        assert!(text.contains("- Risks: none detected"));
        assert!(text.ends_with("- Reminders: none"));
    }
}
