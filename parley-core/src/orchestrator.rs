// ABOUTME: Entry point for streamed conversation turns: validates, resolves, dispatches, tracks.
// ABOUTME: Shared by Arc between callers; owns the cancellation registry and the turn tasks.

use crate::audit::{AuditSink, NoopAuditSink};
use crate::error::TurnError;
use crate::mcp::McpCatalog;
use crate::metrics;
use crate::model::{Attachment, ChatSession, NewMessage, PermissionMode, SessionPatch, DEFAULT_SESSION_TITLE};
use crate::policy::{ToolPermissionPolicy, TurnPermissions};
use crate::registry::{ActiveStream, CancellationRegistry, RegistrationGuard, CANCEL_REASON_SHUTDOWN};
use crate::request::RequestBuilder;
use crate::resolver::{ResolverDefaults, SessionConfigResolver, TurnOverrides};
use crate::skills::{NoopSkillSync, SkillSync};
use crate::store::ContentStore;
use crate::stream::{StreamSession, TurnStream, TURN_EVENT_BUFFER};
use parley_engine::EngineHandle;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::task::TaskTracker;

/// Longest auto-generated session title, in characters
const MAX_TITLE_CHARS: usize = 50;

/// One user message to run as a turn
#[derive(Debug, Clone, Default)]
pub struct TurnRequest {
    pub session_id: String,
    pub message: String,
    pub attachments: Vec<Attachment>,
    pub overrides: TurnOverrides,
}

impl TurnRequest {
    pub fn new(session_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    pub fn with_overrides(mut self, overrides: TurnOverrides) -> Self {
        self.overrides = overrides;
        self
    }
}

pub struct Orchestrator {
    store: Arc<dyn ContentStore>,
    engine: EngineHandle,
    registry: Arc<CancellationRegistry>,
    audit: Arc<dyn AuditSink>,
    skills: Arc<dyn SkillSync>,
    policy: ToolPermissionPolicy,
    resolver: SessionConfigResolver,
    requests: RequestBuilder,
    tasks: TaskTracker,
}

impl Orchestrator {
    pub fn new(store: Arc<dyn ContentStore>, engine: EngineHandle) -> Self {
        Self {
            resolver: SessionConfigResolver::new(Arc::clone(&store), ResolverDefaults::default()),
            store,
            engine,
            registry: Arc::new(CancellationRegistry::new()),
            audit: Arc::new(NoopAuditSink),
            skills: Arc::new(NoopSkillSync),
            policy: ToolPermissionPolicy::default(),
            requests: RequestBuilder::default(),
            tasks: TaskTracker::new(),
        }
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_skill_sync(mut self, skills: Arc<dyn SkillSync>) -> Self {
        self.skills = skills;
        self
    }

    pub fn with_policy(mut self, policy: ToolPermissionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_defaults(mut self, defaults: ResolverDefaults) -> Self {
        self.resolver = SessionConfigResolver::new(Arc::clone(&self.store), defaults);
        self
    }

    pub fn with_mcp_catalog(mut self, catalog: McpCatalog) -> Self {
        self.requests = RequestBuilder::new(Arc::new(catalog));
        self
    }

    pub fn registry(&self) -> Arc<CancellationRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn store(&self) -> Arc<dyn ContentStore> {
        Arc::clone(&self.store)
    }

    pub fn engine_name(&self) -> &'static str {
        self.engine.name()
    }

    /// Start a turn and return its event stream.
    ///
    /// Errors only when the turn cannot start; everything after dispatch is
    /// reported through the stream's terminal event.
    pub async fn start_turn(&self, request: TurnRequest) -> Result<TurnStream, TurnError> {
        let TurnRequest {
            session_id,
            message,
            attachments,
            overrides,
        } = request;

        if message.trim().is_empty() && attachments.is_empty() {
            return Err(TurnError::InvalidRequest(
                "message must contain text or attachments".to_string(),
            ));
        }

        let session = self
            .store
            .get_session(&session_id)
            .await
            .map_err(TurnError::Store)?
            .ok_or_else(|| TurnError::SessionNotFound(session_id.clone()))?;

        self.save_user_message(&session, &message, &attachments).await;
        self.maybe_retitle(&session, &message).await;

        let config = self.resolver.resolve(Some(&session), &overrides).await?;

        if let Err(e) = tokio::fs::create_dir_all(&config.working_dir).await {
            tracing::warn!(
                session_id = %session.id,
                path = %config.working_dir.display(),
                error = %e,
                "Failed to create working directory"
            );
        }
        if let Err(e) = self
            .skills
            .sync(&session.id, &config.skill_ids, &config.working_dir)
            .await
        {
            metrics::record_error("skill_sync");
            tracing::warn!(session_id = %session.id, error = %e, "Skill sync failed, continuing turn");
        }

        let engine_request = self.requests.build(&config, &message, &attachments);

        let (stream_id, cancel) = self.registry.register(&session.id);
        let guard = RegistrationGuard::new(Arc::clone(&self.registry), stream_id.clone());

        // Plan turns are judged as plan even when the sticky flag forced them
        let mode = if config.plan_mode {
            PermissionMode::Plan
        } else {
            config.permission_mode
        };
        let permissions = Arc::new(TurnPermissions::new(self.policy, mode, &session.id));

        let engine_events = self
            .engine
            .run(engine_request, cancel.clone(), permissions)
            .await
            .map_err(|e| {
                metrics::record_error("engine_dispatch");
                tracing::error!(session_id = %session.id, error = %e, "Engine refused turn");
                TurnError::Engine(format!("{:#}", e))
            })?;

        metrics::record_turn_started(self.engine.name());
        tracing::info!(
            stream_id = %stream_id,
            session_id = %session.id,
            engine = self.engine.name(),
            model = %config.model,
            mode = %mode,
            attachments = attachments.len(),
            "Turn started"
        );

        let (tx, rx) = mpsc::channel(TURN_EVENT_BUFFER);
        let stream = StreamSession {
            stream_id: stream_id.clone(),
            session_id: session.id.clone(),
            had_resume_token: session.provider_session_id.is_some(),
            cancel,
            registry: Arc::clone(&self.registry),
            guard,
            store: Arc::clone(&self.store),
            audit: Arc::clone(&self.audit),
            events: tx,
        };
        self.tasks.spawn(stream.run(engine_events));

        Ok(TurnStream::new(stream_id, rx))
    }

    /// Request cancellation of a live turn. True only the first time.
    pub fn cancel(&self, stream_id: &str) -> bool {
        self.registry.cancel(stream_id)
    }

    pub fn list_active_streams(&self) -> Vec<String> {
        self.registry.list()
    }

    pub fn active_streams(&self) -> Vec<ActiveStream> {
        self.registry.snapshot()
    }

    /// Cancel every live turn and wait for their tasks to finish
    pub async fn shutdown(&self) -> usize {
        let cancelled = self.registry.cancel_all(CANCEL_REASON_SHUTDOWN);
        tracing::info!(cancelled, "Shutting down orchestrator");
        self.tasks.close();
        self.tasks.wait().await;
        cancelled
    }

    async fn save_user_message(&self, session: &ChatSession, message: &str, attachments: &[Attachment]) {
        let references = attachments.iter().map(Attachment::reference).collect();
        match self
            .store
            .create_message(&session.id, NewMessage::user(message, references))
            .await
        {
            Ok(saved) => {
                if let Err(e) = self.audit.append_message(&session.id, &saved).await {
                    metrics::record_error("audit_message");
                    tracing::warn!(session_id = %session.id, error = %e, "Failed to audit user message");
                }
            }
            Err(e) => {
                metrics::record_error("save_user_message");
                tracing::warn!(session_id = %session.id, error = %e, "Failed to save user message");
            }
        }
    }

    async fn maybe_retitle(&self, session: &ChatSession, message: &str) {
        if session.title != DEFAULT_SESSION_TITLE {
            return;
        }
        let Some(title) = title_from_message(message) else {
            return;
        };
        let patch = SessionPatch {
            title: Some(title.clone()),
            ..Default::default()
        };
        match self.store.update_session(&session.id, patch).await {
            Ok(()) => tracing::debug!(session_id = %session.id, title = %title, "Session retitled"),
            Err(e) => tracing::warn!(session_id = %session.id, error = %e, "Failed to retitle session"),
        }
    }
}

/// First line of the message, cut to a title-sized length
pub fn title_from_message(message: &str) -> Option<String> {
    let line = message.lines().map(str::trim).find(|l| !l.is_empty())?;
    if line.chars().count() <= MAX_TITLE_CHARS {
        return Some(line.to_string());
    }
    let cut: String = line.chars().take(MAX_TITLE_CHARS).collect();
    Some(format!("{}...", cut.trim_end()))
}
