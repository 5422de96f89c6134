// ABOUTME: Append-only audit log mirroring every message and raw engine event.
// ABOUTME: JSONL file per chat session; writes are best effort and never fail a turn.

use crate::model::ChatMessage;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use parley_engine::EngineEvent;
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append_event(&self, session_id: &str, turn_id: &str, event: &EngineEvent) -> Result<()>;

    async fn append_message(&self, session_id: &str, message: &ChatMessage) -> Result<()>;
}

/// Discards everything
pub struct NoopAuditSink;

#[async_trait]
impl AuditSink for NoopAuditSink {
    async fn append_event(&self, _session_id: &str, _turn_id: &str, _event: &EngineEvent) -> Result<()> {
        Ok(())
    }

    async fn append_message(&self, _session_id: &str, _message: &ChatMessage) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct AuditRecord<'a> {
    timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    turn_id: Option<&'a str>,
    kind: &'a str,
    payload: Value,
}

/// Writes `<dir>/<session_id>.jsonl`, one record per line
pub struct JsonlAuditSink {
    dir: PathBuf,
}

impl JsonlAuditSink {
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create audit directory {}", dir.display()))?;
        Ok(Self { dir })
    }

    /// Path of a session's log; rejects ids that would escape the audit directory
    pub fn log_path(&self, session_id: &str) -> Result<PathBuf> {
        if session_id.is_empty()
            || session_id.contains("..")
            || session_id.contains('/')
            || session_id.contains('\\')
        {
            anyhow::bail!("Invalid session id for audit log: {:?}", session_id);
        }
        Ok(self.dir.join(format!("{}.jsonl", session_id)))
    }

    async fn append(&self, session_id: &str, record: &AuditRecord<'_>) -> Result<()> {
        let path = self.log_path(session_id)?;
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        // One write per record keeps concurrent appends line-atomic
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("Failed to open audit log {}", path.display()))?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl AuditSink for JsonlAuditSink {
    async fn append_event(&self, session_id: &str, turn_id: &str, event: &EngineEvent) -> Result<()> {
        let record = AuditRecord {
            timestamp: Utc::now().to_rfc3339(),
            turn_id: Some(turn_id),
            kind: event.kind(),
            payload: serde_json::to_value(event)?,
        };
        self.append(session_id, &record).await
    }

    async fn append_message(&self, session_id: &str, message: &ChatMessage) -> Result<()> {
        let record = AuditRecord {
            timestamp: Utc::now().to_rfc3339(),
            turn_id: message
                .metadata
                .as_ref()
                .and_then(|m| m.stream_id.as_deref()),
            kind: "message",
            payload: serde_json::to_value(message)?,
        };
        self.append(session_id, &record).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MessageRole;

    fn message(session_id: &str) -> ChatMessage {
        ChatMessage {
            id: "m1".to_string(),
            session_id: session_id.to_string(),
            role: MessageRole::User,
            content: "hello".to_string(),
            attachments: vec![],
            metadata: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_jsonl_sink_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonlAuditSink::new(dir.path()).unwrap();

        sink.append_message("s1", &message("s1")).await.unwrap();
        sink.append_event("s1", "turn-1", &EngineEvent::text("Hel"))
            .await
            .unwrap();

        let content = tokio::fs::read_to_string(dir.path().join("s1.jsonl"))
            .await
            .unwrap();
        let lines: Vec<Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["kind"], "message");
        assert_eq!(lines[0]["payload"]["content"], "hello");
        assert_eq!(lines[1]["kind"], "text_delta");
        assert_eq!(lines[1]["turn_id"], "turn-1");
        assert_eq!(lines[1]["payload"]["text"], "Hel");
    }

    #[tokio::test]
    async fn test_jsonl_sink_keeps_sessions_apart() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonlAuditSink::new(dir.path()).unwrap();
        sink.append_event("a", "t", &EngineEvent::text("x")).await.unwrap();
        sink.append_event("b", "t", &EngineEvent::text("y")).await.unwrap();
        assert!(dir.path().join("a.jsonl").exists());
        assert!(dir.path().join("b.jsonl").exists());
    }

    #[test]
    fn test_log_path_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonlAuditSink::new(dir.path()).unwrap();
        assert!(sink.log_path("../etc/passwd").is_err());
        assert!(sink.log_path("a/b").is_err());
        assert!(sink.log_path("").is_err());
        assert!(sink.log_path("9c1f2f1e").is_ok());
    }
}
