// ABOUTME: Terminal commands: run a turn and print its events, manage sessions and agent profiles.
// ABOUTME: Turns run in-process against the same orchestrator wiring the server uses.

use anyhow::{bail, Context, Result};
use parley_core::{
    AgentProfile, Attachment, ChatMessage, ChatSession, ContentStore, NewSession, Orchestrator,
    PermissionMode, TurnEvent, TurnOverrides, TurnRequest,
};
use std::io::Write;
use std::path::Path;

/// Read a file from disk as a turn attachment, guessing its mime type from the name
pub fn read_attachment(path: &Path) -> Result<Attachment> {
    let data =
        std::fs::read(path).with_context(|| format!("Failed to read attachment {}", path.display()))?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string());
    let mime_type = mime_guess::from_path(path)
        .first_or_octet_stream()
        .essence_str()
        .to_string();
    Ok(Attachment {
        file_name,
        mime_type,
        data,
    })
}

/// Write one turn event for a human. Text goes to `out` as it streams; everything else to `info`.
pub fn render_event(event: &TurnEvent, out: &mut impl Write, info: &mut impl Write) -> Result<()> {
    match event {
        TurnEvent::Stream { stream_id } => writeln!(info, "[stream {}]", stream_id)?,
        TurnEvent::TurnStarted => {}
        TurnEvent::TextDelta { text } => {
            write!(out, "{}", text)?;
            out.flush()?;
        }
        TurnEvent::ToolObserved { name, input, .. } => {
            writeln!(info, "\n[tool] {} {}", name, input)?;
        }
        TurnEvent::Done { cost_usd, usage } => {
            writeln!(out)?;
            let mut summary = String::from("[done");
            if let Some(usage) = usage {
                summary.push_str(&format!(
                    " in={} out={}",
                    usage.input_tokens, usage.output_tokens
                ));
            }
            if let Some(cost) = cost_usd {
                summary.push_str(&format!(" cost=${:.4}", cost));
            }
            summary.push(']');
            writeln!(info, "{}", summary)?;
        }
        TurnEvent::Cancelled { reason, .. } => writeln!(info, "\n[cancelled: {}]", reason)?,
        TurnEvent::Error { message } => writeln!(info, "\n[error: {}]", message)?,
    }
    Ok(())
}

/// Run one turn, printing events until the terminal one. Ctrl-C cancels the turn.
///
/// Returns the terminal event so the caller can choose an exit status.
pub async fn chat(orchestrator: &Orchestrator, request: TurnRequest) -> Result<Option<TurnEvent>> {
    let mut turn = orchestrator.start_turn(request).await?;
    let stream_id = turn.stream_id().to_string();
    let mut stdout = std::io::stdout();
    let mut stderr = std::io::stderr();
    let mut terminal = None;
    let mut interrupted = false;

    loop {
        tokio::select! {
            event = turn.recv() => {
                let Some(event) = event else { break };
                render_event(&event, &mut stdout, &mut stderr)?;
                if event.is_terminal() {
                    terminal = Some(event);
                }
            }
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                orchestrator.cancel(&stream_id);
            }
        }
    }
    Ok(terminal)
}

pub fn overrides(agent: Option<String>, mode: Option<PermissionMode>, skills: Vec<String>) -> TurnOverrides {
    TurnOverrides {
        agent_id: agent,
        skill_ids: if skills.is_empty() { None } else { Some(skills) },
        permission_mode: mode,
    }
}

pub fn print_session_row(session: &ChatSession, out: &mut impl Write) -> Result<()> {
    writeln!(
        out,
        "{}  {:<8}  {:<8}  {}  {}",
        session.id,
        session.status.to_string(),
        session.permission_mode.to_string(),
        session.updated_at.format("%Y-%m-%d %H:%M"),
        session.title
    )?;
    Ok(())
}

pub fn print_transcript(
    session: &ChatSession,
    messages: &[ChatMessage],
    out: &mut impl Write,
) -> Result<()> {
    writeln!(out, "# {} ({})", session.title, session.id)?;
    if let Some(agent) = &session.agent_id {
        writeln!(out, "agent: {}", agent)?;
    }
    if session.plan_mode {
        writeln!(out, "plan mode: on")?;
    }
    for message in messages {
        writeln!(out)?;
        writeln!(
            out,
            "[{} {}]",
            message.role,
            message.created_at.format("%Y-%m-%d %H:%M:%S")
        )?;
        writeln!(out, "{}", message.content)?;
        for attachment in &message.attachments {
            writeln!(
                out,
                "  (attached {} {}, {} bytes)",
                attachment.file_name, attachment.mime_type, attachment.size
            )?;
        }
        if let Some(metadata) = &message.metadata {
            for tool in &metadata.tool_uses {
                writeln!(out, "  (tool {})", tool.name)?;
            }
        }
    }
    Ok(())
}

pub async fn new_session(store: &dyn ContentStore, new: NewSession) -> Result<ChatSession> {
    let session = store.create_session(new).await?;
    tracing::info!(session_id = %session.id, "Session created");
    Ok(session)
}

pub async fn show_session(store: &dyn ContentStore, session_id: &str, out: &mut impl Write) -> Result<()> {
    let Some(session) = store.get_session(session_id).await? else {
        bail!("Session not found: {}", session_id);
    };
    let messages = store.list_messages(session_id).await?;
    print_transcript(&session, &messages, out)
}

/// Parse an agent profile from TOML and store it, replacing any profile with the same id
pub async fn add_agent(store: &dyn ContentStore, path: &Path) -> Result<AgentProfile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let agent: AgentProfile = toml::from_str(&content)
        .with_context(|| format!("Failed to parse agent profile {}", path.display()))?;
    if agent.id.trim().is_empty() {
        bail!("Agent profile {} has an empty id", path.display());
    }
    store.upsert_agent(&agent).await?;
    Ok(agent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use parley_core::{SqliteStore, Usage};
    use serde_json::json;

    fn render(event: TurnEvent) -> (String, String) {
        let mut out = Vec::new();
        let mut info = Vec::new();
        render_event(&event, &mut out, &mut info).unwrap();
        (
            String::from_utf8(out).unwrap(),
            String::from_utf8(info).unwrap(),
        )
    }

    #[test]
    fn test_text_goes_to_stdout_without_newline() {
        let (out, info) = render(TurnEvent::TextDelta {
            text: "Hello".to_string(),
        });
        assert_eq!(out, "Hello");
        assert!(info.is_empty());
    }

    #[test]
    fn test_tool_and_terminal_events_go_to_info() {
        let (out, info) = render(TurnEvent::ToolObserved {
            id: "t1".to_string(),
            name: "Read".to_string(),
            input: json!({"file_path": "a.rs"}),
        });
        assert!(out.is_empty());
        assert!(info.contains("[tool] Read"));

        let (_, info) = render(TurnEvent::Cancelled {
            reason: "cancelled by user".to_string(),
            timestamp: Utc::now(),
        });
        assert!(info.contains("cancelled by user"));
    }

    #[test]
    fn test_done_summarizes_usage_and_cost() {
        let (out, info) = render(TurnEvent::Done {
            cost_usd: Some(0.0123),
            usage: Some(Usage {
                input_tokens: 10,
                output_tokens: 4,
                ..Default::default()
            }),
        });
        assert_eq!(out, "\n");
        assert_eq!(info.trim(), "[done in=10 out=4 cost=$0.0123]");
    }

    #[test]
    fn test_overrides_leave_skills_unset_when_none_given() {
        let o = overrides(None, Some(PermissionMode::Plan), vec![]);
        assert!(o.skill_ids.is_none());
        assert_eq!(o.permission_mode, Some(PermissionMode::Plan));

        let o = overrides(Some("a".to_string()), None, vec!["s".to_string()]);
        assert_eq!(o.skill_ids, Some(vec!["s".to_string()]));
    }

    #[test]
    fn test_read_attachment_guesses_mime_type() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, "# hi").unwrap();

        let attachment = read_attachment(&path).unwrap();
        assert_eq!(attachment.file_name, "notes.txt");
        assert_eq!(attachment.mime_type, "text/plain");
        assert_eq!(attachment.data, b"# hi");
    }

    #[tokio::test]
    async fn test_add_agent_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reviewer.toml");
        std::fs::write(
            &path,
            r#"
id = "reviewer"
name = "Code Reviewer"
system_prompt = "Review carefully."
model = "claude-opus-4-1"
allowed_tools = ["Read", "Grep"]
"#,
        )
        .unwrap();
        let store = SqliteStore::open_in_memory().unwrap();

        let agent = add_agent(&store, &path).await.unwrap();
        assert_eq!(agent.allowed_tools, vec!["Read", "Grep"]);
        let stored = store.agent("reviewer").unwrap().unwrap();
        assert_eq!(stored, agent);
    }

    #[tokio::test]
    async fn test_add_agent_rejects_empty_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "id = \"\"\nname = \"x\"\n").unwrap();
        let store = SqliteStore::open_in_memory().unwrap();

        assert!(add_agent(&store, &path).await.is_err());
    }

    #[tokio::test]
    async fn test_show_session_prints_transcript() {
        let store = SqliteStore::open_in_memory().unwrap();
        let session = store
            .create_session(NewSession {
                title: Some("Refactor".to_string()),
                ..Default::default()
            })
            .unwrap();
        store
            .insert_message(&session.id, parley_core::model::NewMessage::user("hi", vec![]))
            .unwrap();

        let mut out = Vec::new();
        show_session(&store, &session.id, &mut out).await.unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("# Refactor"));
        assert!(text.contains("hi"));

        let mut out = Vec::new();
        assert!(show_session(&store, "missing", &mut out).await.is_err());
    }
}
