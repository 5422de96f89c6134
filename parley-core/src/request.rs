// ABOUTME: Builds the engine request descriptor for a turn from its effective configuration.
// ABOUTME: Maps permission modes, enforces plan-mode tools, resolves MCP servers and encodes attachments.

use crate::mcp::McpCatalog;
use crate::model::{Attachment, PermissionMode};
use crate::policy::READ_ONLY_TOOLS;
use crate::resolver::EffectiveTurnConfig;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use parley_engine::{BinarySource, EnginePermissionMode, EngineRequest, InputBlock, PromptContent};
use std::sync::Arc;

/// Non-`text/*` types that are still readable as text
const TEXTUAL_APPLICATION_TYPES: [&str; 6] = [
    "application/json",
    "application/xml",
    "application/x-yaml",
    "application/yaml",
    "application/toml",
    "application/javascript",
];

const PDF_MIME: &str = "application/pdf";

pub fn engine_permission_mode(mode: PermissionMode) -> EnginePermissionMode {
    match mode {
        PermissionMode::Bypass => EnginePermissionMode::BypassPermissions,
        PermissionMode::Auto => EnginePermissionMode::AcceptEdits,
        // Plan turns are restricted through their tool list instead
        PermissionMode::Plan | PermissionMode::Default => EnginePermissionMode::Default,
    }
}

#[derive(Clone, Default)]
pub struct RequestBuilder {
    mcp: Arc<McpCatalog>,
}

impl RequestBuilder {
    pub fn new(mcp: Arc<McpCatalog>) -> Self {
        Self { mcp }
    }

    pub fn build(
        &self,
        config: &EffectiveTurnConfig,
        message: &str,
        attachments: &[Attachment],
    ) -> EngineRequest {
        let mut request = EngineRequest::new(config.model.clone(), build_content(message, attachments));

        request.system_prompt = system_prompt(config);
        request.permission_mode = engine_permission_mode(config.permission_mode);
        request.allowed_tools = if config.plan_mode {
            READ_ONLY_TOOLS.iter().map(|t| t.to_string()).collect()
        } else {
            config.allowed_tools.clone()
        };
        request.disallowed_tools = config.disallowed_tools.clone();
        request.mcp_servers = self.mcp.select(&config.mcp_servers);
        request.resume = config.resume_token.clone();
        request.working_dir = Some(config.working_dir.clone());

        tracing::debug!(
            session_id = %config.session_id,
            model = %request.model,
            mode = request.permission_mode.as_str(),
            tools = request.allowed_tools.len(),
            mcp_servers = request.mcp_servers.len(),
            resume = request.resume.is_some(),
            "Built engine request"
        );
        request
    }
}

/// Agent prompt, else the session's custom prompt, plus plan instructions
fn system_prompt(config: &EffectiveTurnConfig) -> Option<String> {
    let base = config
        .agent
        .as_ref()
        .and_then(|a| a.system_prompt.clone())
        .filter(|p| !p.trim().is_empty())
        .or_else(|| {
            config
                .custom_system_prompt
                .clone()
                .filter(|p| !p.trim().is_empty())
        });

    match (base, config.plan_instructions.as_deref()) {
        (Some(base), Some(plan)) => Some(format!("{}\n\n{}", base, plan)),
        (None, Some(plan)) => Some(plan.to_string()),
        (base, None) => base,
    }
}

/// Raw text when there is nothing to attach, typed blocks otherwise
pub fn build_content(message: &str, attachments: &[Attachment]) -> PromptContent {
    let attachment_blocks: Vec<InputBlock> = attachments.iter().filter_map(attachment_block).collect();
    if attachment_blocks.is_empty() {
        return PromptContent::Text(message.to_string());
    }

    let mut blocks = Vec::with_capacity(attachment_blocks.len() + 1);
    if !message.is_empty() {
        blocks.push(InputBlock::Text {
            text: message.to_string(),
        });
    }
    blocks.extend(attachment_blocks);
    PromptContent::Blocks(blocks)
}

fn effective_mime(attachment: &Attachment) -> String {
    let declared = attachment.mime_type.trim();
    if declared.is_empty() || declared == "application/octet-stream" {
        mime_guess::from_path(&attachment.file_name)
            .first_or_octet_stream()
            .to_string()
    } else {
        declared.to_lowercase()
    }
}

fn attachment_block(attachment: &Attachment) -> Option<InputBlock> {
    let mime = effective_mime(attachment);

    if mime.starts_with("image/") {
        return Some(InputBlock::Image {
            source: BinarySource::base64(mime, BASE64_STANDARD.encode(&attachment.data)),
        });
    }
    if mime == PDF_MIME {
        return Some(InputBlock::Document {
            source: BinarySource::base64(mime, BASE64_STANDARD.encode(&attachment.data)),
            title: Some(attachment.file_name.clone()),
        });
    }
    if mime.starts_with("text/") || TEXTUAL_APPLICATION_TYPES.contains(&mime.as_str()) {
        return match std::str::from_utf8(&attachment.data) {
            Ok(text) => Some(InputBlock::Text {
                text: format!("--- File: {} ---\n{}", attachment.file_name, text),
            }),
            Err(_) => {
                tracing::warn!(file = %attachment.file_name, mime = %mime, "Text attachment is not UTF-8, skipping");
                None
            }
        };
    }

    tracing::warn!(file = %attachment.file_name, mime = %mime, "Unsupported attachment type, skipping");
    None
}
