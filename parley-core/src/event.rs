// ABOUTME: Caller-visible events produced for one streamed turn.
// ABOUTME: Serialized with a kebab-case type tag for SSE and CLI consumers.

use chrono::{DateTime, Utc};
use parley_engine::Usage;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum TurnEvent {
    /// Always the first event; carries the id used to cancel the turn
    Stream { stream_id: String },
    /// The provider started producing visible text
    TurnStarted,
    TextDelta { text: String },
    ToolObserved { id: String, name: String, input: Value },
    Done {
        cost_usd: Option<f64>,
        usage: Option<Usage>,
    },
    Cancelled {
        reason: String,
        timestamp: DateTime<Utc>,
    },
    Error { message: String },
}

impl TurnEvent {
    /// Event name as it appears on the wire
    pub fn name(&self) -> &'static str {
        match self {
            TurnEvent::Stream { .. } => "stream",
            TurnEvent::TurnStarted => "turn-started",
            TurnEvent::TextDelta { .. } => "text-delta",
            TurnEvent::ToolObserved { .. } => "tool-observed",
            TurnEvent::Done { .. } => "done",
            TurnEvent::Cancelled { .. } => "cancelled",
            TurnEvent::Error { .. } => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TurnEvent::Done { .. } | TurnEvent::Cancelled { .. } | TurnEvent::Error { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_names_match_serde_tags() {
        let events = vec![
            TurnEvent::Stream {
                stream_id: "s".to_string(),
            },
            TurnEvent::TurnStarted,
            TurnEvent::TextDelta {
                text: "x".to_string(),
            },
            TurnEvent::ToolObserved {
                id: "t".to_string(),
                name: "Read".to_string(),
                input: json!({}),
            },
            TurnEvent::Done {
                cost_usd: None,
                usage: None,
            },
            TurnEvent::Cancelled {
                reason: "r".to_string(),
                timestamp: Utc::now(),
            },
            TurnEvent::Error {
                message: "m".to_string(),
            },
        ];
        for event in events {
            let value = serde_json::to_value(&event).unwrap();
            assert_eq!(value["type"], event.name());
        }
    }

    #[test]
    fn test_only_done_cancelled_error_are_terminal() {
        assert!(!TurnEvent::TurnStarted.is_terminal());
        assert!(TurnEvent::Error {
            message: String::new()
        }
        .is_terminal());
    }
}
