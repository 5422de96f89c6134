// ABOUTME: Direct CLI engine - spawns claude with stream-json input and output.
// ABOUTME: Parses JSONL from stdout into EngineEvents and answers permission prompts over stdin.

use crate::event::{ContentBlock, EngineEvent, ErrorCode, Usage};
use crate::handle::{Command, EngineHandle};
use crate::permission::{PermissionDecision, PermissionHandler};
use crate::request::EngineRequest;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command as ProcessCommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Configuration for the Direct CLI engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectCliConfig {
    /// Path to the claude binary
    #[serde(default = "default_binary")]
    pub binary: String,
    /// Fallback working directory when a request does not name one
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Ask the CLI for token-level stream events
    #[serde(default = "default_true")]
    pub include_partial_messages: bool,
    /// Extra arguments appended verbatim
    #[serde(default)]
    pub extra_args: Vec<String>,
}

fn default_binary() -> String {
    "claude".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for DirectCliConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            working_dir: None,
            include_partial_messages: true,
            extra_args: Vec::new(),
        }
    }
}

pub struct DirectCliEngine {
    config: DirectCliConfig,
}

impl DirectCliEngine {
    pub fn new(config: DirectCliConfig) -> Self {
        Self { config }
    }

    pub fn into_handle(self) -> EngineHandle {
        let (tx, mut rx) = mpsc::channel::<Command>(32);
        let config = Arc::new(self.config);

        tokio::spawn(async move {
            while let Some(cmd) = rx.recv().await {
                match cmd {
                    Command::Run {
                        request,
                        cancel,
                        permissions,
                        event_tx,
                        reply,
                    } => {
                        let _ = reply.send(Ok(()));
                        let config = Arc::clone(&config);
                        tokio::spawn(async move {
                            let error_tx = event_tx.clone();
                            if let Err(e) =
                                run_turn(&config, request, cancel, permissions, event_tx).await
                            {
                                tracing::error!(error = %e, "Direct CLI turn failed");
                                let _ = error_tx
                                    .send(EngineEvent::Error {
                                        code: ErrorCode::BackendError,
                                        message: format!("{:#}", e),
                                    })
                                    .await;
                            }
                        });
                    }
                }
            }
        });

        EngineHandle::new(tx, "direct")
    }

    /// Factory function for the registry
    pub fn factory() -> crate::registry::EngineFactory {
        Box::new(|config| {
            let cfg: DirectCliConfig = if config.is_null() {
                DirectCliConfig::default()
            } else {
                serde_json::from_value(config.clone()).context("Invalid direct engine config")?
            };
            Ok(DirectCliEngine::new(cfg).into_handle())
        })
    }
}

/// Command-line arguments for one turn
pub fn build_args(config: &DirectCliConfig, request: &EngineRequest) -> Vec<String> {
    let mut args: Vec<String> = [
        "--print",
        "--output-format",
        "stream-json",
        "--input-format",
        "stream-json",
        "--verbose",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    if config.include_partial_messages {
        args.push("--include-partial-messages".to_string());
    }

    args.push("--model".to_string());
    args.push(request.model.clone());

    if let Some(ref prompt) = request.system_prompt {
        args.push("--system-prompt".to_string());
        args.push(prompt.clone());
    }

    args.push("--permission-mode".to_string());
    args.push(request.permission_mode.as_str().to_string());

    if !request.allowed_tools.is_empty() {
        args.push("--allowedTools".to_string());
        args.push(request.allowed_tools.join(","));
    }
    if !request.disallowed_tools.is_empty() {
        args.push("--disallowedTools".to_string());
        args.push(request.disallowed_tools.join(","));
    }

    if !request.mcp_servers.is_empty() {
        args.push("--mcp-config".to_string());
        args.push(json!({ "mcpServers": request.mcp_servers }).to_string());
    }

    if let Some(ref token) = request.resume {
        args.push("--resume".to_string());
        args.push(token.clone());
    }

    // Route tool approvals to us as control requests on stdout
    args.push("--permission-prompt-tool".to_string());
    args.push("stdio".to_string());

    args.extend(config.extra_args.iter().cloned());
    args
}

/// The single stream-json line carrying the user message
pub fn user_message_line(request: &EngineRequest) -> String {
    json!({
        "type": "user",
        "message": {
            "role": "user",
            "content": request.content,
        },
    })
    .to_string()
}

/// Reply to a `can_use_tool` control request
pub fn permission_response(request_id: &str, input: &Value, decision: &PermissionDecision) -> Value {
    let body = match decision {
        PermissionDecision::Allow => json!({"behavior": "allow", "updatedInput": input}),
        PermissionDecision::Modify { input } => json!({"behavior": "allow", "updatedInput": input}),
        PermissionDecision::Deny { message } => json!({"behavior": "deny", "message": message}),
    };
    json!({
        "type": "control_response",
        "response": {
            "subtype": "success",
            "request_id": request_id,
            "response": body,
        },
    })
}

async fn write_line(stdin: &mut ChildStdin, line: &str) -> Result<()> {
    stdin.write_all(line.as_bytes()).await?;
    stdin.write_all(b"\n").await?;
    stdin.flush().await?;
    Ok(())
}

async fn run_turn(
    config: &DirectCliConfig,
    request: EngineRequest,
    cancel: CancellationToken,
    permissions: Arc<dyn PermissionHandler>,
    event_tx: mpsc::Sender<EngineEvent>,
) -> Result<()> {
    let args = build_args(config, &request);
    tracing::debug!(?args, "Spawning Claude CLI");

    let mut command = ProcessCommand::new(&config.binary);
    command
        .args(&args)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = request.working_dir.as_ref().or(config.working_dir.as_ref()) {
        command.current_dir(dir);
    }

    let mut child = command.spawn().context("Failed to spawn Claude CLI")?;
    let mut stdin = Some(child.stdin.take().context("Failed to capture stdin")?);
    let stdout = child.stdout.take().context("Failed to capture stdout")?;
    let stderr = child.stderr.take().context("Failed to capture stderr")?;

    if let Some(ref mut pipe) = stdin {
        write_line(pipe, &user_message_line(&request))
            .await
            .context("Failed to write user message to Claude CLI")?;
    }

    let stderr_tx = event_tx.clone();
    let stderr_handle = tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.is_empty() {
                continue;
            }
            tracing::warn!(stderr = %line, "Claude CLI stderr");
            if line.contains("No conversation found with session ID") {
                let _ = stderr_tx
                    .send(EngineEvent::Error {
                        code: ErrorCode::SessionOrphaned,
                        message: "Resume token refers to an unknown conversation".to_string(),
                    })
                    .await;
            }
        }
    });

    let mut lines = BufReader::new(stdout).lines();
    let mut parser = StreamParser::default();
    let mut saw_result = false;

    loop {
        let line = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::info!("Turn cancelled, killing Claude CLI");
                if let Err(e) = child.kill().await {
                    tracing::warn!(error = %e, "Failed to kill Claude CLI");
                }
                stderr_handle.abort();
                return Ok(());
            }
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read Claude CLI stdout");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let json: Value = match serde_json::from_str(&line) {
            Ok(json) => json,
            Err(_) => {
                tracing::debug!(line = %line, "Skipping non-JSON line from Claude CLI");
                continue;
            }
        };

        if json.get("type").and_then(|t| t.as_str()) == Some("control_request") {
            if let Some(event) = answer_control_request(&json, &permissions, stdin.as_mut()).await {
                if event_tx.send(event).await.is_err() {
                    tracing::debug!("Event receiver closed, stopping stream");
                    break;
                }
            }
            continue;
        }

        let events = parser.parse(&json);
        if json.get("type").and_then(|t| t.as_str()) == Some("result") {
            saw_result = true;
            // Closing stdin lets the CLI exit after the turn
            stdin = None;
        }
        let mut receiver_gone = false;
        for event in events {
            if event_tx.send(event).await.is_err() {
                receiver_gone = true;
                break;
            }
        }
        if receiver_gone {
            tracing::debug!("Event receiver closed, stopping stream");
            break;
        }
    }

    drop(stdin);
    let status = child.wait().await?;
    if !status.success() && !saw_result {
        let _ = event_tx
            .send(EngineEvent::Error {
                code: ErrorCode::BackendError,
                message: format!("CLI exited with status: {:?}", status.code()),
            })
            .await;
    }

    if let Err(e) = stderr_handle.await {
        tracing::warn!(error = %e, "stderr reader task failed to complete");
    }

    Ok(())
}

async fn answer_control_request(
    json: &Value,
    permissions: &Arc<dyn PermissionHandler>,
    stdin: Option<&mut ChildStdin>,
) -> Option<EngineEvent> {
    let request_id = json.get("request_id").and_then(|v| v.as_str())?;
    let request = json.get("request")?;
    let subtype = request.get("subtype").and_then(|v| v.as_str());
    if subtype != Some("can_use_tool") {
        tracing::debug!(?subtype, "Ignoring unsupported control request");
        return Some(EngineEvent::Other {
            kind: "control_request".to_string(),
            payload: json.clone(),
        });
    }

    let tool_name = request
        .get("tool_name")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string();
    let input = request.get("input").cloned().unwrap_or(Value::Null);
    let tool_use_id = request
        .get("tool_use_id")
        .and_then(|v| v.as_str())
        .unwrap_or(request_id)
        .to_string();

    let decision = permissions.decide(&tool_name, &input);
    tracing::info!(tool = %tool_name, allowed = decision.is_allowed(), "Tool permission decided");

    let response = permission_response(request_id, &input, &decision).to_string();
    match stdin {
        Some(pipe) => {
            if let Err(e) = write_line(pipe, &response).await {
                tracing::warn!(error = %e, "Failed to send permission response");
            }
        }
        None => tracing::warn!(tool = %tool_name, "Permission request after stdin closed"),
    }

    Some(EngineEvent::ToolInvocation {
        id: tool_use_id,
        name: tool_name,
        input,
        decision,
    })
}

/// Maps stream-json lines to EngineEvents.
///
/// Tracks the id of the message currently being streamed so text deltas can
/// be matched against the complete assistant message that follows them.
#[derive(Debug, Default)]
pub struct StreamParser {
    current_message_id: Option<String>,
}

impl StreamParser {
    pub fn parse(&mut self, json: &Value) -> Vec<EngineEvent> {
        let event_type = json.get("type").and_then(|t| t.as_str()).unwrap_or("unknown");

        match event_type {
            "system" if json.get("subtype").and_then(|s| s.as_str()) == Some("init") => {
                match json.get("session_id").and_then(|s| s.as_str()) {
                    Some(session_id) => vec![EngineEvent::Init {
                        session_id: session_id.to_string(),
                        model: json.get("model").and_then(|m| m.as_str()).map(String::from),
                        tools: json
                            .get("tools")
                            .and_then(|t| t.as_array())
                            .map(|tools| {
                                tools
                                    .iter()
                                    .filter_map(|t| t.as_str().map(String::from))
                                    .collect()
                            })
                            .unwrap_or_default(),
                    }],
                    None => vec![other(event_type, json)],
                }
            }
            "assistant" => {
                let message = json.get("message");
                let message_id = message
                    .and_then(|m| m.get("id"))
                    .and_then(|i| i.as_str())
                    .map(String::from);
                let blocks: Vec<ContentBlock> = message
                    .and_then(|m| m.get("content"))
                    .and_then(|c| c.as_array())
                    .map(|items| items.iter().filter_map(parse_block).collect())
                    .unwrap_or_default();
                for block in &blocks {
                    if let ContentBlock::ToolUse { name, id, .. } = block {
                        tracing::info!(tool = %name, id = %id, "Tool use detected");
                    }
                }
                vec![EngineEvent::AssistantContent { message_id, blocks }]
            }
            "stream_event" => self.parse_stream_event(json),
            "result" => vec![parse_result(json)],
            _ => vec![other(event_type, json)],
        }
    }

    fn parse_stream_event(&mut self, json: &Value) -> Vec<EngineEvent> {
        let Some(event) = json.get("event") else {
            return vec![other("stream_event", json)];
        };
        match event.get("type").and_then(|t| t.as_str()) {
            Some("message_start") => {
                self.current_message_id = event
                    .get("message")
                    .and_then(|m| m.get("id"))
                    .and_then(|i| i.as_str())
                    .map(String::from);
            }
            Some("content_block_delta") => {
                let delta = event.get("delta");
                if delta.and_then(|d| d.get("type")).and_then(|t| t.as_str()) == Some("text_delta") {
                    if let Some(text) = delta.and_then(|d| d.get("text")).and_then(|t| t.as_str()) {
                        return vec![EngineEvent::TextDelta {
                            message_id: self.current_message_id.clone(),
                            text: text.to_string(),
                        }];
                    }
                }
            }
            _ => {}
        }
        vec![other("stream_event", json)]
    }
}

fn other(kind: &str, json: &Value) -> EngineEvent {
    EngineEvent::Other {
        kind: kind.to_string(),
        payload: json.clone(),
    }
}

fn parse_block(item: &Value) -> Option<ContentBlock> {
    match item.get("type").and_then(|t| t.as_str())? {
        "text" => Some(ContentBlock::Text {
            text: item.get("text")?.as_str()?.to_string(),
        }),
        "tool_use" => Some(ContentBlock::ToolUse {
            id: item
                .get("id")
                .and_then(|i| i.as_str())
                .unwrap_or("unknown")
                .to_string(),
            name: item
                .get("name")
                .and_then(|n| n.as_str())
                .unwrap_or("unknown")
                .to_string(),
            input: item.get("input").cloned().unwrap_or(Value::Null),
        }),
        "thinking" => Some(ContentBlock::Thinking {
            thinking: item
                .get("thinking")
                .and_then(|t| t.as_str())
                .unwrap_or_default()
                .to_string(),
        }),
        _ => None,
    }
}

fn parse_result(json: &Value) -> EngineEvent {
    let is_error = json
        .get("is_error")
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
        || json
            .get("subtype")
            .and_then(|s| s.as_str())
            .is_some_and(|s| s.starts_with("error"));

    if is_error {
        let message = json
            .get("error")
            .or_else(|| json.get("result"))
            .and_then(|e| e.as_str())
            .or_else(|| json.get("subtype").and_then(|s| s.as_str()))
            .unwrap_or("Unknown error")
            .to_string();
        return EngineEvent::Error {
            code: ErrorCode::classify(&message),
            message,
        };
    }

    let usage = extract_usage(json);
    tracing::debug!(
        input_tokens = usage.as_ref().map(|u| u.input_tokens).unwrap_or(0),
        output_tokens = usage.as_ref().map(|u| u.output_tokens).unwrap_or(0),
        "Turn result received"
    );

    EngineEvent::Result {
        text: json.get("result").and_then(|r| r.as_str()).map(String::from),
        usage,
        duration_ms: json.get("duration_ms").and_then(|v| v.as_u64()),
        num_turns: json
            .get("num_turns")
            .and_then(|v| v.as_u64())
            .map(|n| n as u32),
    }
}

fn extract_usage(json: &Value) -> Option<Usage> {
    let mut usage = Usage::default();
    let mut found_usage = false;

    if let Some(cost) = json.get("total_cost_usd").and_then(|v| v.as_f64()) {
        usage.cost_usd = Some(cost);
        found_usage = true;
    }

    if let Some(usage_obj) = json.get("usage") {
        usage.input_tokens = usage_obj
            .get("input_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        usage.output_tokens = usage_obj
            .get("output_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        usage.cache_read_tokens = usage_obj
            .get("cache_read_input_tokens")
            .and_then(|v| v.as_u64());
        usage.cache_write_tokens = usage_obj
            .get("cache_creation_input_tokens")
            .and_then(|v| v.as_u64());
        found_usage = true;
    }

    // modelUsage carries per-model totals when the flat usage block is empty
    if usage.input_tokens == 0 && usage.output_tokens == 0 {
        if let Some(model_usage) = json.get("modelUsage").and_then(|v| v.as_object()) {
            for stats in model_usage.values() {
                usage.input_tokens += stats
                    .get("inputTokens")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0);
                usage.output_tokens += stats
                    .get("outputTokens")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0);
                found_usage = true;
            }
        }
    }

    found_usage.then_some(usage)
}
