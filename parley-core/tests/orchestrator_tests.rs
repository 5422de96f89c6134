// ABOUTME: End-to-end turn tests driving the orchestrator with the mock engine.
// ABOUTME: Covers terminal events, persistence rules, cancellation and request building.

use anyhow::Result;
use async_trait::async_trait;
use parley_core::audit::AuditSink;
use parley_core::model::{MessageRole, SessionPatch};
use parley_core::policy::{ToolPermissionPolicy, UnmatchedToolFallback};
use parley_core::resolver::{ResolverDefaults, PLAN_INSTRUCTIONS};
use parley_core::stream::TURN_EVENT_BUFFER;
use parley_core::{
    AgentProfile, Attachment, ChatMessage, NewSession, Orchestrator, PermissionMode, SqliteStore,
    TurnError, TurnEvent, TurnOverrides, TurnRequest,
};
use parley_engine::backends::mock::{MockEngine, MockStep, RequestLog};
use parley_engine::{
    ContentBlock, EngineEvent, ErrorCode, PermissionDecision, PromptContent, Usage,
};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

#[derive(Default)]
struct MemoryAudit {
    events: Mutex<Vec<(String, String, EngineEvent)>>,
    messages: Mutex<Vec<ChatMessage>>,
}

impl MemoryAudit {
    fn events(&self) -> Vec<(String, String, EngineEvent)> {
        self.events.lock().unwrap().clone()
    }

    fn messages(&self) -> Vec<ChatMessage> {
        self.messages.lock().unwrap().clone()
    }
}

#[async_trait]
impl AuditSink for MemoryAudit {
    async fn append_event(&self, session_id: &str, turn_id: &str, event: &EngineEvent) -> Result<()> {
        self.events.lock().unwrap().push((
            session_id.to_string(),
            turn_id.to_string(),
            event.clone(),
        ));
        Ok(())
    }

    async fn append_message(&self, _session_id: &str, message: &ChatMessage) -> Result<()> {
        self.messages.lock().unwrap().push(message.clone());
        Ok(())
    }
}

struct Harness {
    orchestrator: Orchestrator,
    store: Arc<SqliteStore>,
    audit: Arc<MemoryAudit>,
    requests: RequestLog,
    _dir: TempDir,
}

fn harness(mock: MockEngine) -> Harness {
    harness_with_policy(mock, ToolPermissionPolicy::default())
}

fn harness_with_policy(mock: MockEngine, policy: ToolPermissionPolicy) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let audit = Arc::new(MemoryAudit::default());
    let requests = mock.request_log();
    let orchestrator = Orchestrator::new(store.clone(), mock.into_handle())
        .with_audit(audit.clone())
        .with_policy(policy)
        .with_defaults(ResolverDefaults {
            sessions_root: dir.path().join("sessions"),
            ..Default::default()
        });
    Harness {
        orchestrator,
        store,
        audit,
        requests,
        _dir: dir,
    }
}

fn init(token: &str) -> EngineEvent {
    EngineEvent::Init {
        session_id: token.to_string(),
        model: None,
        tools: vec![],
    }
}

fn result(cost: f64) -> EngineEvent {
    EngineEvent::Result {
        text: None,
        usage: Some(Usage {
            input_tokens: 12,
            output_tokens: 3,
            cost_usd: Some(cost),
            ..Default::default()
        }),
        duration_ms: Some(40),
        num_turns: Some(1),
    }
}

fn terminal_count(events: &[TurnEvent]) -> usize {
    events.iter().filter(|e| e.is_terminal()).count()
}

async fn wait_until_idle(orchestrator: &Orchestrator) {
    for _ in 0..200 {
        if orchestrator.list_active_streams().is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("Streams never finished: {:?}", orchestrator.list_active_streams());
}

#[tokio::test]
async fn test_completed_turn_streams_and_persists() {
    let h = harness(MockEngine::new().on_prompt("greet").respond_events(vec![
        init("provider-1"),
        EngineEvent::text("Hel"),
        EngineEvent::text("lo"),
        result(0.002),
    ]));
    let session = h.store.create_session(NewSession::default()).unwrap();

    let stream = h
        .orchestrator
        .start_turn(TurnRequest::new(&session.id, "greet me"))
        .await
        .unwrap();
    let stream_id = stream.stream_id().to_string();
    let events = stream.collect().await;

    assert_eq!(
        events[0],
        TurnEvent::Stream {
            stream_id: stream_id.clone()
        }
    );
    assert_eq!(events[1], TurnEvent::TurnStarted);
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, TurnEvent::TurnStarted))
            .count(),
        1
    );
    let text: String = events
        .iter()
        .filter_map(|e| match e {
            TurnEvent::TextDelta { text } => Some(text.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(text, "Hello");
    assert_eq!(terminal_count(&events), 1);
    match events.last().unwrap() {
        TurnEvent::Done { cost_usd, usage } => {
            assert_eq!(*cost_usd, Some(0.002));
            assert_eq!(usage.as_ref().map(|u| u.input_tokens), Some(12));
        }
        other => panic!("Expected done, got {:?}", other),
    }

    let messages = h.store.list_messages(&session.id).unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, MessageRole::User);
    assert_eq!(messages[0].content, "greet me");
    assert_eq!(messages[1].role, MessageRole::Assistant);
    assert_eq!(messages[1].content, "Hello");
    let metadata = messages[1].metadata.as_ref().unwrap();
    assert_eq!(metadata.cost_usd, Some(0.002));
    assert_eq!(metadata.stream_id.as_deref(), Some(stream_id.as_str()));

    let session = h.store.session(&session.id).unwrap().unwrap();
    assert_eq!(session.provider_session_id.as_deref(), Some("provider-1"));
    assert!(h.orchestrator.list_active_streams().is_empty());
}

#[tokio::test]
async fn test_turn_without_content_persists_no_assistant_message() {
    let h = harness(
        MockEngine::new()
            .on_prompt("quiet")
            .respond_events(vec![init("p"), result(0.0)]),
    );
    let session = h.store.create_session(NewSession::default()).unwrap();

    let events = h
        .orchestrator
        .start_turn(TurnRequest::new(&session.id, "quiet please"))
        .await
        .unwrap()
        .collect()
        .await;

    assert!(matches!(events.last(), Some(TurnEvent::Done { .. })));
    assert!(!events.iter().any(|e| matches!(e, TurnEvent::TurnStarted)));
    let messages = h.store.list_messages(&session.id).unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].role, MessageRole::User);
}

#[tokio::test]
async fn test_cancelled_turn_never_completes() {
    let h = harness(
        MockEngine::new()
            .on_prompt("long")
            .respond_then_hang(vec![init("p"), EngineEvent::text("partial")]),
    );
    let session = h.store.create_session(NewSession::default()).unwrap();

    let mut stream = h
        .orchestrator
        .start_turn(TurnRequest::new(&session.id, "long task"))
        .await
        .unwrap();
    let stream_id = stream.stream_id().to_string();

    loop {
        match stream.recv().await {
            Some(TurnEvent::TextDelta { .. }) => break,
            Some(_) => continue,
            None => panic!("Stream ended before any text"),
        }
    }
    assert_eq!(h.orchestrator.list_active_streams(), vec![stream_id.clone()]);

    assert!(h.orchestrator.cancel(&stream_id));
    assert!(!h.orchestrator.cancel(&stream_id));

    let rest = stream.collect().await;
    assert_eq!(terminal_count(&rest), 1);
    match rest.last().unwrap() {
        TurnEvent::Cancelled { reason, .. } => assert_eq!(reason, "cancelled by user"),
        other => panic!("Expected cancelled, got {:?}", other),
    }
    assert!(!rest.iter().any(|e| matches!(e, TurnEvent::Done { .. })));

    let messages = h.store.list_messages(&session.id).unwrap();
    assert_eq!(messages.len(), 1, "cancelled turn must not persist a reply");
    assert!(h.orchestrator.list_active_streams().is_empty());
    assert!(!h.orchestrator.cancel(&stream_id));
}

#[tokio::test]
async fn test_cancel_reaches_turn_blocked_on_stalled_caller() {
    let mut events = vec![init("p")];
    events.extend((0..TURN_EVENT_BUFFER + 144).map(|i| EngineEvent::text(format!("{} ", i))));
    let h = harness(MockEngine::new().on_prompt("flood").respond_then_hang(events));
    let session = h.store.create_session(NewSession::default()).unwrap();

    // Held but never read, so the event buffer fills up
    let stream = h
        .orchestrator
        .start_turn(TurnRequest::new(&session.id, "flood the caller"))
        .await
        .unwrap();
    let stream_id = stream.stream_id().to_string();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.orchestrator.list_active_streams(), vec![stream_id.clone()]);

    assert!(h.orchestrator.cancel(&stream_id));
    wait_until_idle(&h.orchestrator).await;

    let shutdown = tokio::time::timeout(Duration::from_secs(2), h.orchestrator.shutdown()).await;
    assert!(shutdown.is_ok(), "shutdown hung on a stalled caller");

    let received = stream.collect().await;
    assert!(received.len() <= TURN_EVENT_BUFFER);
    assert!(!received.iter().any(|e| matches!(e, TurnEvent::Done { .. })));
    assert_eq!(h.store.list_messages(&session.id).unwrap().len(), 1);
}

#[tokio::test]
async fn test_shutdown_ends_turn_blocked_on_stalled_caller() {
    let events: Vec<EngineEvent> = (0..TURN_EVENT_BUFFER * 2)
        .map(|i| EngineEvent::text(format!("{} ", i)))
        .collect();
    let h = harness(MockEngine::new().on_prompt("flood").respond_then_hang(events));
    let session = h.store.create_session(NewSession::default()).unwrap();

    let _stream = h
        .orchestrator
        .start_turn(TurnRequest::new(&session.id, "flood again"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let cancelled = tokio::time::timeout(Duration::from_secs(2), h.orchestrator.shutdown())
        .await
        .expect("shutdown hung on a stalled caller");
    assert_eq!(cancelled, 1);
    assert!(h.orchestrator.registry().is_empty());
}

#[tokio::test]
async fn test_cancel_unknown_stream_is_false() {
    let h = harness(MockEngine::new());
    assert!(!h.orchestrator.cancel("no-such-stream"));
}

#[tokio::test]
async fn test_engine_error_is_terminal_error() {
    let h = harness(
        MockEngine::new()
            .on_prompt("fail")
            .respond_error(ErrorCode::RateLimited, "rate limit exceeded"),
    );
    let session = h.store.create_session(NewSession::default()).unwrap();

    let events = h
        .orchestrator
        .start_turn(TurnRequest::new(&session.id, "fail now"))
        .await
        .unwrap()
        .collect()
        .await;

    assert_eq!(terminal_count(&events), 1);
    assert_eq!(
        events.last(),
        Some(&TurnEvent::Error {
            message: "rate limit exceeded".to_string()
        })
    );
    assert_eq!(h.store.list_messages(&session.id).unwrap().len(), 1);
}

#[tokio::test]
async fn test_registry_returns_to_baseline_after_many_turns() {
    let mut mock = MockEngine::new();
    for i in 0..3 {
        mock = mock
            .on_prompt(&format!("midway {}", i))
            .respond_then_hang(vec![init("p"), EngineEvent::text("partial")]);
    }
    for i in 0..3 {
        mock = mock
            .on_prompt(&format!("early {}", i))
            .respond_then_hang(vec![init("p")]);
    }
    let h = harness(mock);
    let session = h.store.create_session(NewSession::default()).unwrap();
    let baseline = h.orchestrator.list_active_streams().len();

    let mut midway = Vec::new();
    let mut early = Vec::new();
    let mut completed = Vec::new();
    for i in 0..3 {
        midway.push(
            h.orchestrator
                .start_turn(TurnRequest::new(&session.id, format!("midway {}", i)))
                .await
                .unwrap(),
        );
        early.push(
            h.orchestrator
                .start_turn(TurnRequest::new(&session.id, format!("early {}", i)))
                .await
                .unwrap(),
        );
        completed.push(
            h.orchestrator
                .start_turn(TurnRequest::new(&session.id, format!("finish {}", i)))
                .await
                .unwrap(),
        );
    }
    assert_eq!(h.orchestrator.list_active_streams().len(), baseline + 9);

    // Cancelled before anything was read
    for stream in &early {
        assert!(h.orchestrator.cancel(stream.stream_id()));
    }

    // Cancelled after the engine started streaming text
    for stream in &mut midway {
        loop {
            match stream.recv().await {
                Some(TurnEvent::TextDelta { .. }) => break,
                Some(_) => continue,
                None => panic!("Stream ended before any text"),
            }
        }
        assert!(h.orchestrator.cancel(stream.stream_id()));
    }

    for stream in early.into_iter().chain(midway) {
        let events = stream.collect().await;
        assert_eq!(terminal_count(&events), 1);
        assert!(matches!(events.last(), Some(TurnEvent::Cancelled { .. })));
    }
    for stream in completed {
        let events = stream.collect().await;
        assert_eq!(terminal_count(&events), 1);
        assert!(matches!(events.last(), Some(TurnEvent::Done { .. })));
    }

    wait_until_idle(&h.orchestrator).await;
    assert_eq!(h.orchestrator.list_active_streams().len(), baseline);
    assert!(h.orchestrator.registry().is_empty());
}

#[tokio::test]
async fn test_resume_token_is_sent_and_never_overwritten() {
    let h = harness(
        MockEngine::new()
            .on_prompt("again")
            .respond_events(vec![init("fresh-token"), EngineEvent::text("ok")]),
    );
    let session = h.store.create_session(NewSession::default()).unwrap();
    h.store
        .apply_patch(
            &session.id,
            &SessionPatch {
                provider_session_id: Some("original-token".to_string()),
                ..Default::default()
            },
        )
        .unwrap();

    h.orchestrator
        .start_turn(TurnRequest::new(&session.id, "again"))
        .await
        .unwrap()
        .collect()
        .await;

    assert_eq!(
        h.requests.last().unwrap().resume.as_deref(),
        Some("original-token")
    );
    let session = h.store.session(&session.id).unwrap().unwrap();
    assert_eq!(session.provider_session_id.as_deref(), Some("original-token"));
}

#[tokio::test]
async fn test_unknown_session_is_rejected() {
    let h = harness(MockEngine::new());
    let err = h
        .orchestrator
        .start_turn(TurnRequest::new("missing", "hello"))
        .await
        .unwrap_err();
    assert!(matches!(err, TurnError::SessionNotFound(id) if id == "missing"));
    assert!(h.requests.is_empty());
}

#[tokio::test]
async fn test_empty_message_is_rejected() {
    let h = harness(MockEngine::new());
    let session = h.store.create_session(NewSession::default()).unwrap();
    let err = h
        .orchestrator
        .start_turn(TurnRequest::new(&session.id, "   "))
        .await
        .unwrap_err();
    assert!(matches!(err, TurnError::InvalidRequest(_)));
    assert!(h.store.list_messages(&session.id).unwrap().is_empty());
}

#[tokio::test]
async fn test_plan_flag_restricts_tools_and_appends_instructions() {
    let h = harness(MockEngine::new());
    let session = h
        .store
        .create_session(NewSession {
            plan_mode: true,
            custom_system_prompt: Some("Be terse.".to_string()),
            ..Default::default()
        })
        .unwrap();

    h.orchestrator
        .start_turn(TurnRequest::new(&session.id, "how would you refactor this?"))
        .await
        .unwrap()
        .collect()
        .await;

    let request = h.requests.last().unwrap();
    assert_eq!(request.allowed_tools, vec!["Read", "Glob", "Grep", "Skill"]);
    let prompt = request.system_prompt.unwrap();
    assert!(prompt.starts_with("Be terse."));
    assert!(prompt.ends_with(PLAN_INSTRUCTIONS));
}

#[tokio::test]
async fn test_agent_override_selects_model_and_prompt() {
    let h = harness(MockEngine::new());
    h.store
        .upsert_agent(&AgentProfile {
            id: "reviewer".to_string(),
            name: "Reviewer".to_string(),
            system_prompt: Some("You review code.".to_string()),
            model: Some("claude-opus-4-1".to_string()),
            ..Default::default()
        })
        .unwrap();
    let session = h
        .store
        .create_session(NewSession {
            custom_system_prompt: Some("Custom prompt".to_string()),
            ..Default::default()
        })
        .unwrap();

    h.orchestrator
        .start_turn(TurnRequest::new(&session.id, "first").with_overrides(TurnOverrides {
            agent_id: Some("reviewer".to_string()),
            ..Default::default()
        }))
        .await
        .unwrap()
        .collect()
        .await;
    let request = h.requests.last().unwrap();
    assert_eq!(request.model, "claude-opus-4-1");
    assert_eq!(request.system_prompt.as_deref(), Some("You review code."));

    h.orchestrator
        .start_turn(TurnRequest::new(&session.id, "second"))
        .await
        .unwrap()
        .collect()
        .await;
    let request = h.requests.last().unwrap();
    assert_eq!(request.model, "claude-sonnet-4-5");
    assert_eq!(request.system_prompt.as_deref(), Some("Custom prompt"));
}

#[tokio::test]
async fn test_tool_uses_are_observed_and_persisted() {
    let h = harness(MockEngine::new().on_prompt("read").respond_events(vec![
        init("p"),
        EngineEvent::AssistantContent {
            message_id: Some("msg_1".to_string()),
            blocks: vec![
                ContentBlock::Text {
                    text: "Reading.".to_string(),
                },
                ContentBlock::ToolUse {
                    id: "toolu_1".to_string(),
                    name: "Read".to_string(),
                    input: json!({"file_path": "README.md"}),
                },
            ],
        },
    ]));
    let session = h.store.create_session(NewSession::default()).unwrap();

    let events = h
        .orchestrator
        .start_turn(TurnRequest::new(&session.id, "read the readme"))
        .await
        .unwrap()
        .collect()
        .await;

    assert!(events.iter().any(|e| matches!(
        e,
        TurnEvent::ToolObserved { id, name, .. } if id == "toolu_1" && name == "Read"
    )));
    let messages = h.store.list_messages(&session.id).unwrap();
    let metadata = messages[1].metadata.as_ref().unwrap();
    assert_eq!(messages[1].content, "Reading.");
    assert_eq!(metadata.tool_uses.len(), 1);
    assert_eq!(metadata.tool_uses[0].input, json!({"file_path": "README.md"}));
}

#[tokio::test]
async fn test_permission_policy_answers_tool_invocations() {
    let h = harness_with_policy(
        MockEngine::new().on_prompt("tidy").respond_with(vec![
            MockStep::Emit(init("p")),
            MockStep::permission("t1", "Bash", json!({"command": "mkdir out"})),
            MockStep::permission("t2", "Bash", json!({"command": "rm -rf out"})),
            MockStep::Emit(EngineEvent::text("done")),
        ]),
        ToolPermissionPolicy::new(UnmatchedToolFallback::Deny),
    );
    let session = h
        .store
        .create_session(NewSession {
            permission_mode: PermissionMode::Auto,
            ..Default::default()
        })
        .unwrap();

    let events = h
        .orchestrator
        .start_turn(TurnRequest::new(&session.id, "tidy up"))
        .await
        .unwrap()
        .collect()
        .await;
    assert!(matches!(events.last(), Some(TurnEvent::Done { .. })));

    let decisions: Vec<(String, PermissionDecision)> = h
        .audit
        .events()
        .into_iter()
        .filter_map(|(_, _, event)| match event {
            EngineEvent::ToolInvocation { id, decision, .. } => Some((id, decision)),
            _ => None,
        })
        .collect();
    assert_eq!(decisions.len(), 2);
    assert_eq!(decisions[0], ("t1".to_string(), PermissionDecision::Allow));
    assert!(!decisions[1].1.is_allowed());
}

#[tokio::test]
async fn test_every_engine_event_is_mirrored_to_audit() {
    let h = harness(MockEngine::new().on_prompt("audit").respond_events(vec![
        init("p"),
        EngineEvent::text("a"),
        EngineEvent::Other {
            kind: "rate_limit_event".to_string(),
            payload: json!({"remaining": 3}),
        },
        result(0.0),
    ]));
    let session = h.store.create_session(NewSession::default()).unwrap();

    let stream = h
        .orchestrator
        .start_turn(TurnRequest::new(&session.id, "audit this"))
        .await
        .unwrap();
    let stream_id = stream.stream_id().to_string();
    let events = stream.collect().await;

    let mirrored = h.audit.events();
    assert_eq!(mirrored.len(), 4);
    assert!(mirrored
        .iter()
        .all(|(sid, turn, _)| sid == &session.id && turn == &stream_id));
    assert_eq!(mirrored[2].2.kind(), "rate_limit_event");
    // Unclassified payloads stay out of the caller stream
    assert_eq!(events.len(), 4);

    let audited_roles: Vec<MessageRole> = h.audit.messages().iter().map(|m| m.role).collect();
    assert_eq!(audited_roles, vec![MessageRole::User, MessageRole::Assistant]);
}

#[tokio::test]
async fn test_dropped_receiver_still_persists_reply() {
    let h = harness(MockEngine::new().on_prompt("bg").respond_with(vec![
        MockStep::Emit(init("p")),
        MockStep::Delay(Duration::from_millis(20)),
        MockStep::Emit(EngineEvent::text("finished in background")),
    ]));
    let session = h.store.create_session(NewSession::default()).unwrap();

    let stream = h
        .orchestrator
        .start_turn(TurnRequest::new(&session.id, "bg job"))
        .await
        .unwrap();
    drop(stream);

    wait_until_idle(&h.orchestrator).await;
    let messages = h.store.list_messages(&session.id).unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].content, "finished in background");
}

#[tokio::test]
async fn test_first_message_retitles_session() {
    let h = harness(MockEngine::new());
    let session = h.store.create_session(NewSession::default()).unwrap();

    h.orchestrator
        .start_turn(TurnRequest::new(&session.id, "Summarize the quarterly report\nThanks"))
        .await
        .unwrap()
        .collect()
        .await;
    h.orchestrator
        .start_turn(TurnRequest::new(&session.id, "Another question"))
        .await
        .unwrap()
        .collect()
        .await;

    let session = h.store.session(&session.id).unwrap().unwrap();
    assert_eq!(session.title, "Summarize the quarterly report");
}

#[tokio::test]
async fn test_attachments_are_sent_and_referenced() {
    let h = harness(MockEngine::new());
    let session = h.store.create_session(NewSession::default()).unwrap();

    h.orchestrator
        .start_turn(
            TurnRequest::new(&session.id, "what is in this file?").with_attachment(Attachment {
                file_name: "notes.txt".to_string(),
                mime_type: "text/plain".to_string(),
                data: b"buy milk".to_vec(),
            }),
        )
        .await
        .unwrap()
        .collect()
        .await;

    match h.requests.last().unwrap().content {
        PromptContent::Blocks(blocks) => assert_eq!(blocks.len(), 2),
        other => panic!("Expected blocks, got {:?}", other),
    }
    let messages = h.store.list_messages(&session.id).unwrap();
    assert_eq!(messages[0].attachments.len(), 1);
    assert_eq!(messages[0].attachments[0].size, 8);
}

#[tokio::test]
async fn test_shutdown_cancels_live_turns() {
    let h = harness(
        MockEngine::new()
            .on_prompt("forever")
            .respond_then_hang(vec![init("p")]),
    );
    let session = h.store.create_session(NewSession::default()).unwrap();
    let stream = h
        .orchestrator
        .start_turn(TurnRequest::new(&session.id, "forever"))
        .await
        .unwrap();

    assert_eq!(h.orchestrator.shutdown().await, 1);
    let events = stream.collect().await;
    match events.last().unwrap() {
        TurnEvent::Cancelled { reason, .. } => assert_eq!(reason, "server shutting down"),
        other => panic!("Expected cancelled, got {:?}", other),
    }
    assert!(h.orchestrator.registry().is_empty());
}
