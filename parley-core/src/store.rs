// ABOUTME: Content store interface for sessions, agents and messages, plus its SQLite adapter.
// ABOUTME: The orchestrator only reads sessions and agents and writes messages and session patches.
use crate::model::{
    AgentProfile, ChatMessage, ChatSession, MessageMetadata, MessageRole, NewMessage, NewSession,
    SessionPatch, SessionStatus, DEFAULT_SESSION_TITLE,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Durable storage the orchestrator reads and writes during a turn.
///
/// Implementations must tolerate concurrent calls for different sessions.
#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn get_session(&self, id: &str) -> Result<Option<ChatSession>>;

    async fn get_agent(&self, id: &str) -> Result<Option<AgentProfile>>;

    async fn create_message(&self, session_id: &str, message: NewMessage) -> Result<ChatMessage>;

    async fn update_session(&self, id: &str, patch: SessionPatch) -> Result<()>;

    async fn create_session(&self, new: NewSession) -> Result<ChatSession>;

    async fn list_sessions(&self) -> Result<Vec<ChatSession>>;

    async fn list_messages(&self, session_id: &str) -> Result<Vec<ChatMessage>>;

    async fn upsert_agent(&self, agent: &AgentProfile) -> Result<()>;
}

#[derive(Clone)]
pub struct SqliteStore {
    db: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database file, creating parent directories
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database {}", path.display()))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'active',
                skill_ids TEXT NOT NULL DEFAULT '[]',
                agent_id TEXT,
                custom_system_prompt TEXT,
                permission_mode TEXT NOT NULL DEFAULT 'default',
                plan_mode INTEGER NOT NULL DEFAULT 0,
                provider_session_id TEXT,
                working_dir TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS agents (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                system_prompt TEXT,
                model TEXT,
                allowed_tools TEXT NOT NULL DEFAULT '[]',
                disallowed_tools TEXT NOT NULL DEFAULT '[]',
                mcp_servers TEXT NOT NULL DEFAULT '[]',
                working_dir TEXT
            );
            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                attachments TEXT NOT NULL DEFAULT '[]',
                metadata TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_session
                ON messages(session_id, created_at);",
        )
        .context("Failed to initialize database schema")?;

        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.db
            .lock()
            .map_err(|e| anyhow::anyhow!("Database mutex poisoned: {}", e))
    }

    pub fn create_session(&self, new: NewSession) -> Result<ChatSession> {
        let now = Utc::now();
        let session = ChatSession {
            id: uuid::Uuid::new_v4().to_string(),
            title: new
                .title
                .filter(|t| !t.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_SESSION_TITLE.to_string()),
            status: SessionStatus::Active,
            skill_ids: new.skill_ids,
            agent_id: new.agent_id,
            custom_system_prompt: new.custom_system_prompt,
            permission_mode: new.permission_mode,
            plan_mode: new.plan_mode,
            provider_session_id: None,
            working_dir: new.working_dir,
            created_at: now,
            updated_at: now,
        };

        self.conn()?.execute(
            "INSERT INTO sessions (id, title, status, skill_ids, agent_id, custom_system_prompt,
                permission_mode, plan_mode, provider_session_id, working_dir, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, NULL, ?9, ?10, ?10)",
            params![
                session.id,
                session.title,
                session.status.to_string(),
                serde_json::to_string(&session.skill_ids)?,
                session.agent_id,
                session.custom_system_prompt,
                session.permission_mode.to_string(),
                session.plan_mode,
                session.working_dir,
                now.to_rfc3339(),
            ],
        )?;

        tracing::info!(session_id = %session.id, title = %session.title, "Created chat session");
        Ok(session)
    }

    pub fn session(&self, id: &str) -> Result<Option<ChatSession>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {} FROM sessions WHERE id = ?1", SESSION_COLUMNS),
            params![id],
            session_from_row,
        )
        .optional()
        .context("Failed to query session")
    }

    pub fn list_sessions(&self) -> Result<Vec<ChatSession>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM sessions ORDER BY updated_at DESC",
            SESSION_COLUMNS
        ))?;
        let sessions = stmt
            .query_map([], session_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(sessions)
    }

    pub fn apply_patch(&self, id: &str, patch: &SessionPatch) -> Result<()> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE sessions SET
                title = COALESCE(?2, title),
                status = COALESCE(?3, status),
                provider_session_id = COALESCE(?4, provider_session_id),
                updated_at = ?5
             WHERE id = ?1",
            params![
                id,
                patch.title,
                patch.status.map(|s| s.to_string()),
                patch.provider_session_id,
                Utc::now().to_rfc3339(),
            ],
        )?;
        if updated == 0 {
            anyhow::bail!("Session not found: {}", id);
        }
        Ok(())
    }

    pub fn upsert_agent(&self, agent: &AgentProfile) -> Result<()> {
        self.conn()?.execute(
            "INSERT INTO agents (id, name, system_prompt, model, allowed_tools, disallowed_tools,
                mcp_servers, working_dir)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                system_prompt = excluded.system_prompt,
                model = excluded.model,
                allowed_tools = excluded.allowed_tools,
                disallowed_tools = excluded.disallowed_tools,
                mcp_servers = excluded.mcp_servers,
                working_dir = excluded.working_dir",
            params![
                agent.id,
                agent.name,
                agent.system_prompt,
                agent.model,
                serde_json::to_string(&agent.allowed_tools)?,
                serde_json::to_string(&agent.disallowed_tools)?,
                serde_json::to_string(&agent.mcp_servers)?,
                agent.working_dir,
            ],
        )?;
        tracing::info!(agent_id = %agent.id, name = %agent.name, "Saved agent profile");
        Ok(())
    }

    pub fn agent(&self, id: &str) -> Result<Option<AgentProfile>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, name, system_prompt, model, allowed_tools, disallowed_tools, mcp_servers,
                working_dir
             FROM agents WHERE id = ?1",
            params![id],
            |row| {
                Ok(AgentProfile {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    system_prompt: row.get(2)?,
                    model: row.get(3)?,
                    allowed_tools: json_column(row, 4)?,
                    disallowed_tools: json_column(row, 5)?,
                    mcp_servers: json_column(row, 6)?,
                    working_dir: row.get(7)?,
                })
            },
        )
        .optional()
        .context("Failed to query agent")
    }

    pub fn insert_message(&self, session_id: &str, message: NewMessage) -> Result<ChatMessage> {
        let message = ChatMessage {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            role: message.role,
            content: message.content,
            attachments: message.attachments,
            metadata: message.metadata,
            created_at: Utc::now(),
        };
        let metadata = message
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        self.conn()?
            .execute(
                "INSERT INTO messages (id, session_id, role, content, attachments, metadata, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    message.id,
                    message.session_id,
                    message.role.to_string(),
                    message.content,
                    serde_json::to_string(&message.attachments)?,
                    metadata,
                    message.created_at.to_rfc3339(),
                ],
            )
            .with_context(|| format!("Failed to insert message for session {}", session_id))?;
        Ok(message)
    }

    pub fn list_messages(&self, session_id: &str) -> Result<Vec<ChatMessage>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, session_id, role, content, attachments, metadata, created_at
             FROM messages WHERE session_id = ?1 ORDER BY created_at ASC, rowid ASC",
        )?;
        let messages = stmt
            .query_map(params![session_id], |row| {
                let role: String = row.get(2)?;
                let metadata: Option<String> = row.get(5)?;
                Ok(ChatMessage {
                    id: row.get(0)?,
                    session_id: row.get(1)?,
                    role: role.parse::<MessageRole>().map_err(|e| conversion_error(2, e))?,
                    content: row.get(3)?,
                    attachments: json_column(row, 4)?,
                    metadata: metadata
                        .map(|m| serde_json::from_str::<MessageMetadata>(&m))
                        .transpose()
                        .map_err(|e| conversion_error(5, e.into()))?,
                    created_at: timestamp_column(row, 6)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(messages)
    }
}

const SESSION_COLUMNS: &str = "id, title, status, skill_ids, agent_id, custom_system_prompt,
    permission_mode, plan_mode, provider_session_id, working_dir, created_at, updated_at";

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<ChatSession> {
    let status: String = row.get(2)?;
    let mode: String = row.get(6)?;
    Ok(ChatSession {
        id: row.get(0)?,
        title: row.get(1)?,
        status: status.parse().map_err(|e| conversion_error(2, e))?,
        skill_ids: json_column(row, 3)?,
        agent_id: row.get(4)?,
        custom_system_prompt: row.get(5)?,
        permission_mode: mode.parse().map_err(|e| conversion_error(6, e))?,
        plan_mode: row.get(7)?,
        provider_session_id: row.get(8)?,
        working_dir: row.get(9)?,
        created_at: timestamp_column(row, 10)?,
        updated_at: timestamp_column(row, 11)?,
    })
}

fn conversion_error(column: usize, e: anyhow::Error) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, e.into())
}

fn json_column<T: serde::de::DeserializeOwned>(row: &Row<'_>, column: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(column)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(column, e.into()))
}

fn timestamp_column(row: &Row<'_>, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(column)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion_error(column, e.into()))
}

#[async_trait]
impl ContentStore for SqliteStore {
    async fn get_session(&self, id: &str) -> Result<Option<ChatSession>> {
        self.session(id)
    }

    async fn get_agent(&self, id: &str) -> Result<Option<AgentProfile>> {
        self.agent(id)
    }

    async fn create_message(&self, session_id: &str, message: NewMessage) -> Result<ChatMessage> {
        self.insert_message(session_id, message)
    }

    async fn update_session(&self, id: &str, patch: SessionPatch) -> Result<()> {
        self.apply_patch(id, &patch)
    }

    async fn create_session(&self, new: NewSession) -> Result<ChatSession> {
        SqliteStore::create_session(self, new)
    }

    async fn list_sessions(&self) -> Result<Vec<ChatSession>> {
        SqliteStore::list_sessions(self)
    }

    async fn list_messages(&self, session_id: &str) -> Result<Vec<ChatMessage>> {
        SqliteStore::list_messages(self, session_id)
    }

    async fn upsert_agent(&self, agent: &AgentProfile) -> Result<()> {
        SqliteStore::upsert_agent(self, agent)
    }
}
