// ABOUTME: Provider-agnostic request descriptor handed to an engine for one turn.
// ABOUTME: Covers model, prompts, permission mode, tool lists, MCP servers, resume token and content.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Everything an engine needs to execute a single turn
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineRequest {
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    pub permission_mode: EnginePermissionMode,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    #[serde(default)]
    pub disallowed_tools: Vec<String>,
    #[serde(default)]
    pub mcp_servers: BTreeMap<String, McpServerSpec>,
    /// Provider session token to continue an earlier conversation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    pub content: PromptContent,
}

impl EngineRequest {
    /// Minimal request with default permissions and no tools
    pub fn new(model: impl Into<String>, content: PromptContent) -> Self {
        Self {
            model: model.into(),
            system_prompt: None,
            permission_mode: EnginePermissionMode::Default,
            allowed_tools: Vec::new(),
            disallowed_tools: Vec::new(),
            mcp_servers: BTreeMap::new(),
            resume: None,
            working_dir: None,
            content,
        }
    }
}

/// Permission modes in the engine's own vocabulary
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum EnginePermissionMode {
    #[default]
    Default,
    AcceptEdits,
    BypassPermissions,
    Plan,
}

impl EnginePermissionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnginePermissionMode::Default => "default",
            EnginePermissionMode::AcceptEdits => "acceptEdits",
            EnginePermissionMode::BypassPermissions => "bypassPermissions",
            EnginePermissionMode::Plan => "plan",
        }
    }
}

/// One entry of an `mcpServers` map
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum McpServerSpec {
    /// Local process speaking MCP over stdio
    Stdio {
        command: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        args: Vec<String>,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        env: BTreeMap<String, String>,
    },
    /// Remote server reached over HTTP or SSE
    Remote {
        #[serde(rename = "type")]
        transport: String,
        url: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        headers: BTreeMap<String, String>,
    },
}

/// Outbound user content.
///
/// Serialized untagged: a bare JSON string for plain text, a JSON array of
/// typed blocks otherwise.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum PromptContent {
    Text(String),
    Blocks(Vec<InputBlock>),
}

impl PromptContent {
    /// Concatenated text of the content, ignoring binary blocks
    pub fn text(&self) -> String {
        match self {
            PromptContent::Text(text) => text.clone(),
            PromptContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    InputBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n\n"),
        }
    }
}

/// Typed content block of a user message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputBlock {
    Text { text: String },
    Image { source: BinarySource },
    Document {
        source: BinarySource,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
    },
}

/// Base64 payload of an image or document block
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BinarySource {
    #[serde(rename = "type")]
    pub kind: String,
    pub media_type: String,
    pub data: String,
}

impl BinarySource {
    pub fn base64(media_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            kind: "base64".to_string(),
            media_type: media_type.into(),
            data: data.into(),
        }
    }
}
