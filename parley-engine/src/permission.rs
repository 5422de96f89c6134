// ABOUTME: Synchronous tool-permission decision interface consulted by engines.
// ABOUTME: Engines call the handler for every tool invocation that needs approval.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Answer to a tool-permission request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "behavior", rename_all = "snake_case")]
pub enum PermissionDecision {
    Allow,
    Deny { message: String },
    /// Allow, but run the tool with a rewritten input
    Modify { input: Value },
}

impl PermissionDecision {
    pub fn is_allowed(&self) -> bool {
        !matches!(self, PermissionDecision::Deny { .. })
    }
}

/// Decides whether a tool may run.
///
/// Implementations must not block: engines call this inline while reading
/// their event stream.
pub trait PermissionHandler: Send + Sync {
    fn decide(&self, tool_name: &str, input: &Value) -> PermissionDecision;
}

impl<F> PermissionHandler for F
where
    F: Fn(&str, &Value) -> PermissionDecision + Send + Sync,
{
    fn decide(&self, tool_name: &str, input: &Value) -> PermissionDecision {
        self(tool_name, input)
    }
}

/// Handler that allows every tool
pub struct AllowAll;

impl PermissionHandler for AllowAll {
    fn decide(&self, _tool_name: &str, _input: &Value) -> PermissionDecision {
        PermissionDecision::Allow
    }
}
