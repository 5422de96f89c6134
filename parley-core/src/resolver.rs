// ABOUTME: Derives the effective configuration of one turn from overrides, session and defaults.
// ABOUTME: Agent lookups that fail degrade to a warning instead of failing the turn.

use crate::error::TurnError;
use crate::model::{AgentProfile, ChatSession, PermissionMode};
use crate::store::ContentStore;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

pub const DEFAULT_MODEL: &str = "claude-sonnet-4-5";

pub const DEFAULT_ALLOWED_TOOLS: [&str; 7] =
    ["Read", "Write", "Bash", "Grep", "Glob", "Skill", "Edit"];

/// Appended to the system prompt of plan-mode turns
pub const PLAN_INSTRUCTIONS: &str = "You are in plan mode. Investigate using read-only tools \
and produce a step-by-step plan for the requested change. Do not modify files or run commands. \
End with the plan as a numbered list and wait for approval before doing anything else.";

/// Per-turn values that take precedence over the stored session
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnOverrides {
    pub agent_id: Option<String>,
    pub skill_ids: Option<Vec<String>>,
    pub permission_mode: Option<PermissionMode>,
}

#[derive(Debug, Clone)]
pub struct ResolverDefaults {
    pub model: String,
    pub allowed_tools: Vec<String>,
    /// Parent of per-session working directories
    pub sessions_root: PathBuf,
}

impl Default for ResolverDefaults {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            allowed_tools: DEFAULT_ALLOWED_TOOLS.iter().map(|t| t.to_string()).collect(),
            sessions_root: std::env::temp_dir().join("parley").join("sessions"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveTurnConfig {
    pub session_id: String,
    pub agent: Option<AgentProfile>,
    pub custom_system_prompt: Option<String>,
    pub model: String,
    pub allowed_tools: Vec<String>,
    pub disallowed_tools: Vec<String>,
    pub permission_mode: PermissionMode,
    pub plan_mode: bool,
    pub mcp_servers: Vec<String>,
    pub plan_instructions: Option<String>,
    pub working_dir: PathBuf,
    pub resume_token: Option<String>,
    pub skill_ids: Vec<String>,
}

pub struct SessionConfigResolver {
    store: Arc<dyn ContentStore>,
    defaults: ResolverDefaults,
}

impl SessionConfigResolver {
    pub fn new(store: Arc<dyn ContentStore>, defaults: ResolverDefaults) -> Self {
        Self { store, defaults }
    }

    pub fn defaults(&self) -> &ResolverDefaults {
        &self.defaults
    }

    pub async fn resolve(
        &self,
        session: Option<&ChatSession>,
        overrides: &TurnOverrides,
    ) -> Result<EffectiveTurnConfig, TurnError> {
        let session = session.ok_or_else(|| TurnError::SessionNotFound("unknown".to_string()))?;

        let agent = self.resolve_agent(session, overrides).await;

        let permission_mode = overrides
            .permission_mode
            .unwrap_or(session.permission_mode);
        let plan_mode = permission_mode == PermissionMode::Plan || session.plan_mode;

        let model = agent
            .as_ref()
            .and_then(|a| a.model.clone())
            .unwrap_or_else(|| self.defaults.model.clone());

        let allowed_tools = match &agent {
            Some(a) if !a.allowed_tools.is_empty() => a.allowed_tools.clone(),
            _ => self.defaults.allowed_tools.clone(),
        };
        let disallowed_tools = agent
            .as_ref()
            .map(|a| a.disallowed_tools.clone())
            .unwrap_or_default();
        let mcp_servers = agent
            .as_ref()
            .map(|a| a.mcp_servers.clone())
            .unwrap_or_default();

        let working_dir = session
            .working_dir
            .as_deref()
            .or_else(|| agent.as_ref().and_then(|a| a.working_dir.as_deref()))
            .map(PathBuf::from)
            .unwrap_or_else(|| self.defaults.sessions_root.join(&session.id));

        let skill_ids = overrides
            .skill_ids
            .clone()
            .unwrap_or_else(|| session.skill_ids.clone());

        Ok(EffectiveTurnConfig {
            session_id: session.id.clone(),
            agent,
            custom_system_prompt: session.custom_system_prompt.clone(),
            model,
            allowed_tools,
            disallowed_tools,
            permission_mode,
            plan_mode,
            mcp_servers,
            plan_instructions: plan_mode.then(|| PLAN_INSTRUCTIONS.to_string()),
            working_dir,
            resume_token: session.provider_session_id.clone(),
            skill_ids,
        })
    }

    async fn resolve_agent(
        &self,
        session: &ChatSession,
        overrides: &TurnOverrides,
    ) -> Option<AgentProfile> {
        if let Some(requested) = overrides.agent_id.as_deref() {
            if session.agent_id.as_deref() != Some(requested) {
                match self.fetch_agent(&session.id, requested).await {
                    Some(agent) => return Some(agent),
                    None => tracing::warn!(
                        session_id = %session.id,
                        agent_id = %requested,
                        "Agent override unavailable, falling back to session agent"
                    ),
                }
            }
        }
        let stored = session.agent_id.as_deref()?;
        let agent = self.fetch_agent(&session.id, stored).await;
        if agent.is_none() {
            tracing::warn!(
                session_id = %session.id,
                agent_id = %stored,
                "Session agent unavailable, continuing without agent"
            );
        }
        agent
    }

    async fn fetch_agent(&self, session_id: &str, agent_id: &str) -> Option<AgentProfile> {
        match self.store.get_agent(agent_id).await {
            Ok(agent) => agent,
            Err(e) => {
                tracing::warn!(
                    session_id = %session_id,
                    agent_id = %agent_id,
                    error = %e,
                    "Failed to load agent"
                );
                None
            }
        }
    }
}
