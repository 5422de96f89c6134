// ABOUTME: Event types emitted by engines while executing a conversation turn.
// ABOUTME: Closed set of variants; unrecognized provider payloads travel as Other.

use crate::permission::PermissionDecision;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Events emitted by an engine during one turn.
///
/// The end of the stream is signalled by the event channel closing, not by a
/// variant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// Engine initialized; carries the resumable provider session token
    Init {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tools: Vec<String>,
    },

    /// A complete assistant message (or a slice of one) with its content blocks
    AssistantContent {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
        blocks: Vec<ContentBlock>,
    },

    /// Incremental text chunk for real-time display
    TextDelta {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
        text: String,
    },

    /// The engine asked for permission to run a tool and got this answer
    ToolInvocation {
        id: String,
        name: String,
        input: Value,
        decision: PermissionDecision,
    },

    /// Final totals for the turn. Does not end the stream by itself.
    Result {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        num_turns: Option<u32>,
    },

    /// The engine failed; the stream closes after this
    Error { code: ErrorCode, message: String },

    /// Provider payload with no dedicated variant
    Other { kind: String, payload: Value },
}

impl EngineEvent {
    /// Short kind name used for audit records and logging
    pub fn kind(&self) -> &str {
        match self {
            EngineEvent::Init { .. } => "init",
            EngineEvent::AssistantContent { .. } => "assistant_content",
            EngineEvent::TextDelta { .. } => "text_delta",
            EngineEvent::ToolInvocation { .. } => "tool_invocation",
            EngineEvent::Result { .. } => "result",
            EngineEvent::Error { .. } => "error",
            EngineEvent::Other { kind, .. } => kind,
        }
    }

    /// Convenience constructor for an unattributed text delta
    pub fn text(text: impl Into<String>) -> Self {
        EngineEvent::TextDelta {
            message_id: None,
            text: text.into(),
        }
    }
}

/// Content block inside an assistant message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    ToolUse { id: String, name: String, input: Value },
    Thinking { thinking: String },
}

/// Typed error codes for programmatic handling
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Request timed out
    Timeout,
    /// Rate limited by the provider
    RateLimited,
    /// Authentication failed
    AuthFailed,
    /// Resume token refers to a conversation the provider no longer has
    SessionOrphaned,
    /// Permission denied for operation
    PermissionDenied,
    /// Engine process or transport failure
    BackendError,
    /// Unknown error
    Unknown,
}

impl ErrorCode {
    /// Best-effort classification of a provider error message
    pub fn classify(message: &str) -> Self {
        let lower = message.to_lowercase();
        if lower.contains("timeout") || lower.contains("timed out") {
            ErrorCode::Timeout
        } else if lower.contains("rate limit") {
            ErrorCode::RateLimited
        } else if lower.contains("authentication") || lower.contains("api key") {
            ErrorCode::AuthFailed
        } else if lower.contains("permission") {
            ErrorCode::PermissionDenied
        } else {
            ErrorCode::BackendError
        }
    }
}

/// Token usage and cost tracking
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Usage {
    /// Input tokens consumed
    pub input_tokens: u64,
    /// Output tokens generated
    pub output_tokens: u64,
    /// Tokens read from cache
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_read_tokens: Option<u64>,
    /// Tokens written to cache
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_write_tokens: Option<u64>,
    /// Total cost in USD
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
}
