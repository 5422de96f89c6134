// ABOUTME: Tool permission policy evaluated for every tool invocation during a turn.
// ABOUTME: Pure first-match rules over tool name, permission mode and tool input.

use crate::model::PermissionMode;
use parley_engine::{PermissionDecision, PermissionHandler};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Tools allowed in every mode, and the only tools offered in plan mode
pub const READ_ONLY_TOOLS: [&str; 4] = ["Read", "Glob", "Grep", "Skill"];

/// File-editing tools auto mode allows without asking
const AUTO_EDIT_TOOLS: [&str; 2] = ["Write", "Edit"];

const SHELL_TOOLS: [&str; 1] = ["Bash"];

/// Shell commands auto mode allows when they are the whole command
const SAFE_SHELL_VERBS: [&str; 4] = ["mkdir", "touch", "mv", "cp"];

/// Anything that chains or redirects turns a safe verb into an arbitrary command
const SHELL_CONTROL_SEQUENCES: [&str; 8] = [";", "&", "|", "`", "$(", ">", "<", "\n"];

pub fn is_read_only_tool(tool_name: &str) -> bool {
    READ_ONLY_TOOLS.contains(&tool_name)
}

/// What happens to a tool no rule covers
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum UnmatchedToolFallback {
    /// Allow and log a warning
    #[default]
    Allow,
    Deny,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ToolPermissionPolicy {
    fallback: UnmatchedToolFallback,
}

impl ToolPermissionPolicy {
    pub fn new(fallback: UnmatchedToolFallback) -> Self {
        Self { fallback }
    }

    pub fn fallback(&self) -> UnmatchedToolFallback {
        self.fallback
    }

    /// First matching rule wins.
    ///
    /// Plan mode is not handled here: plan turns are never offered
    /// non-read-only tools in the first place.
    pub fn decide(&self, tool_name: &str, mode: PermissionMode, input: &Value) -> PermissionDecision {
        if is_read_only_tool(tool_name) {
            return PermissionDecision::Allow;
        }
        if mode == PermissionMode::Bypass {
            return PermissionDecision::Allow;
        }
        if mode == PermissionMode::Auto {
            if AUTO_EDIT_TOOLS.contains(&tool_name) {
                return PermissionDecision::Allow;
            }
            if SHELL_TOOLS.contains(&tool_name) && is_safe_shell_command(input) {
                return PermissionDecision::Allow;
            }
        }

        match self.fallback {
            UnmatchedToolFallback::Allow => {
                tracing::warn!(
                    tool = %tool_name,
                    mode = %mode,
                    "No permission rule matched; allowing by fallback policy"
                );
                PermissionDecision::Allow
            }
            UnmatchedToolFallback::Deny => {
                tracing::info!(tool = %tool_name, mode = %mode, "No permission rule matched; denying");
                PermissionDecision::Deny {
                    message: format!(
                        "Tool '{}' is not permitted in {} mode",
                        tool_name, mode
                    ),
                }
            }
        }
    }
}

fn is_safe_shell_command(input: &Value) -> bool {
    let Some(command) = input.get("command").and_then(|c| c.as_str()) else {
        return false;
    };
    if SHELL_CONTROL_SEQUENCES.iter().any(|seq| command.contains(seq)) {
        return false;
    }
    command
        .split_whitespace()
        .next()
        .is_some_and(|verb| SAFE_SHELL_VERBS.contains(&verb))
}

/// Binds the policy to one turn's resolved mode so engines can consult it
pub struct TurnPermissions {
    policy: ToolPermissionPolicy,
    mode: PermissionMode,
    session_id: String,
}

impl TurnPermissions {
    pub fn new(policy: ToolPermissionPolicy, mode: PermissionMode, session_id: &str) -> Self {
        Self {
            policy,
            mode,
            session_id: session_id.to_string(),
        }
    }
}

impl PermissionHandler for TurnPermissions {
    fn decide(&self, tool_name: &str, input: &Value) -> PermissionDecision {
        let decision = self.policy.decide(tool_name, self.mode, input);
        tracing::debug!(
            session_id = %self.session_id,
            tool = %tool_name,
            allowed = decision.is_allowed(),
            "Tool permission evaluated"
        );
        decision
    }
}
