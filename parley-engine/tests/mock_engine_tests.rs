// ABOUTME: Tests for the scripted mock engine.
// ABOUTME: Covers expectation matching, permission steps, cancellation and request logging.

use parley_engine::backends::mock::{MockEngine, MockStep};
use parley_engine::permission::{AllowAll, PermissionDecision};
use parley_engine::{
    CancellationToken, EngineEvent, EngineHandle, EngineRequest, ErrorCode, EventReceiver,
    PromptContent,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

fn request(text: &str) -> EngineRequest {
    EngineRequest::new("claude-sonnet-4-5", PromptContent::Text(text.to_string()))
}

async fn start(handle: &EngineHandle, text: &str, cancel: CancellationToken) -> EventReceiver {
    handle
        .run(request(text), cancel, Arc::new(AllowAll))
        .await
        .unwrap()
}

async fn drain(mut receiver: EventReceiver) -> Vec<EngineEvent> {
    let mut events = Vec::new();
    while let Some(event) = receiver.recv().await {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn test_mock_returns_configured_text_response() {
    let handle = MockEngine::new()
        .on_prompt("hello")
        .respond_text("Hi there!")
        .into_handle();

    let events = drain(start(&handle, "hello", CancellationToken::new()).await).await;

    assert_eq!(events.len(), 3);
    assert_eq!(events[0].kind(), "init");
    assert_eq!(events[1], EngineEvent::text("Hi there!"));
    assert_eq!(events[2].kind(), "result");
}

#[tokio::test]
async fn test_mock_prefers_fifo_but_finds_out_of_order_matches() {
    let handle = MockEngine::new()
        .on_prompt("first")
        .respond_events(vec![EngineEvent::text("one")])
        .on_prompt("second")
        .respond_events(vec![EngineEvent::text("two")])
        .into_handle();

    let second = drain(start(&handle, "second", CancellationToken::new()).await).await;
    let first = drain(start(&handle, "first", CancellationToken::new()).await).await;

    assert_eq!(second, vec![EngineEvent::text("two")]);
    assert_eq!(first, vec![EngineEvent::text("one")]);
}

#[tokio::test]
async fn test_mock_without_expectation_echoes_prompt() {
    let handle = MockEngine::new().into_handle();
    let events = drain(start(&handle, "anything", CancellationToken::new()).await).await;
    assert!(events.iter().any(|e| matches!(
        e,
        EngineEvent::TextDelta { text, .. } if text.contains("no expectation for 'anything'")
    )));
}

#[tokio::test]
async fn test_mock_permission_step_consults_handler() {
    let handle = MockEngine::new()
        .on_prompt("shell")
        .respond_with(vec![MockStep::permission(
            "t1",
            "Bash",
            json!({"command": "rm -rf /"}),
        )])
        .into_handle();

    let deny_bash = |tool: &str, _input: &Value| {
        if tool == "Bash" {
            PermissionDecision::Deny {
                message: "shell disabled".to_string(),
            }
        } else {
            PermissionDecision::Allow
        }
    };
    let receiver = handle
        .run(request("shell"), CancellationToken::new(), Arc::new(deny_bash))
        .await
        .unwrap();
    let events = drain(receiver).await;

    match &events[0] {
        EngineEvent::ToolInvocation { name, decision, .. } => {
            assert_eq!(name, "Bash");
            assert!(!decision.is_allowed());
        }
        other => panic!("Expected ToolInvocation, got {:?}", other),
    }
}

#[tokio::test]
async fn test_mock_error_response() {
    let handle = MockEngine::new()
        .on_prompt("fail")
        .respond_error(ErrorCode::RateLimited, "slow down")
        .into_handle();
    let events = drain(start(&handle, "fail", CancellationToken::new()).await).await;
    assert_eq!(
        events,
        vec![EngineEvent::Error {
            code: ErrorCode::RateLimited,
            message: "slow down".to_string(),
        }]
    );
}

#[tokio::test]
async fn test_mock_hang_ends_when_cancelled() {
    let handle = MockEngine::new()
        .on_prompt("wait")
        .respond_then_hang(vec![EngineEvent::text("partial")])
        .into_handle();
    let cancel = CancellationToken::new();
    let mut receiver = start(&handle, "wait", cancel.clone()).await;

    assert_eq!(receiver.recv().await, Some(EngineEvent::text("partial")));
    cancel.cancel();

    let closed = tokio::time::timeout(Duration::from_secs(2), receiver.recv())
        .await
        .expect("stream should close after cancel");
    assert!(closed.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_mock_delay_is_interrupted_by_cancel() {
    let handle = MockEngine::new()
        .on_prompt("slow")
        .respond_with(vec![
            MockStep::Delay(Duration::from_secs(3600)),
            MockStep::Emit(EngineEvent::text("never")),
        ])
        .into_handle();
    let cancel = CancellationToken::new();
    let receiver = start(&handle, "slow", cancel.clone()).await;
    cancel.cancel();

    assert!(drain(receiver).await.is_empty());
}

#[tokio::test]
async fn test_mock_logs_requests() {
    let mock = MockEngine::new();
    let log = mock.request_log();
    let handle = mock.into_handle();

    let mut req = request("logged");
    req.resume = Some("sess-9".to_string());
    let receiver = handle
        .run(req, CancellationToken::new(), Arc::new(AllowAll))
        .await
        .unwrap();
    let events = drain(receiver).await;

    assert_eq!(log.len(), 1);
    assert_eq!(log.last().unwrap().resume.as_deref(), Some("sess-9"));
    // Unmatched prompts reuse the resume token as the session id
    assert!(matches!(&events[0], EngineEvent::Init { session_id, .. } if session_id == "sess-9"));
}

#[tokio::test]
async fn test_mock_runs_turns_concurrently() {
    let handle = MockEngine::new()
        .on_prompt("hang")
        .respond_then_hang(vec![])
        .on_prompt("quick")
        .respond_text("fast")
        .into_handle();

    let hang_cancel = CancellationToken::new();
    let _hanging = start(&handle, "hang", hang_cancel.clone()).await;

    let quick = tokio::time::timeout(
        Duration::from_secs(2),
        drain(start(&handle, "quick", CancellationToken::new()).await),
    )
    .await
    .expect("a hanging turn must not block other turns");
    assert_eq!(quick.len(), 3);
    hang_cancel.cancel();
}
