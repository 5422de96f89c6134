// ABOUTME: Mock engine for testing - plays back pre-configured scripts.
// ABOUTME: Honors cancellation between steps and records every request it receives.
//!
//! # Example
//!
//! ```no_run
//! use parley_engine::backends::mock::{MockEngine, MockStep};
//! use parley_engine::permission::AllowAll;
//! use parley_engine::{CancellationToken, EngineEvent, EngineRequest, PromptContent};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # async fn example() {
//! let mock = MockEngine::new()
//!     .on_prompt("hello").respond_text("Hi there!")
//!     .on_prompt("make a dir").respond_with(vec![
//!         MockStep::permission("t1", "Bash", json!({"command": "mkdir out"})),
//!         MockStep::Emit(EngineEvent::text("Done")),
//!     ]);
//!
//! let handle = mock.into_handle();
//! let request = EngineRequest::new("claude-sonnet-4-5", PromptContent::Text("hello".into()));
//! let mut events = handle
//!     .run(request, CancellationToken::new(), Arc::new(AllowAll))
//!     .await
//!     .unwrap();
//! while let Some(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//! # }
//! ```

use crate::event::{EngineEvent, ErrorCode, Usage};
use crate::handle::{Command, EngineHandle};
use crate::permission::PermissionHandler;
use crate::request::EngineRequest;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// One step of a scripted response
#[derive(Debug, Clone)]
pub enum MockStep {
    /// Send an event
    Emit(EngineEvent),
    /// Ask the permission handler about a tool and emit the resulting ToolInvocation
    RequestPermission {
        id: String,
        name: String,
        input: Value,
    },
    /// Pause before the next step
    Delay(Duration),
    /// Block until the turn is cancelled
    WaitForCancel,
}

impl MockStep {
    pub fn permission(id: &str, name: &str, input: Value) -> Self {
        MockStep::RequestPermission {
            id: id.to_string(),
            name: name.to_string(),
            input,
        }
    }
}

/// Mock engine for testing
pub struct MockEngine {
    expectations: Arc<Mutex<VecDeque<Expectation>>>,
    requests: Arc<Mutex<Vec<EngineRequest>>>,
}

struct Expectation {
    pattern: String,
    steps: Vec<MockStep>,
}

impl MockEngine {
    /// Create a new mock engine with no expectations
    pub fn new() -> Self {
        Self {
            expectations: Arc::new(Mutex::new(VecDeque::new())),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Set up an expectation for a prompt whose text contains `pattern`
    pub fn on_prompt(self, pattern: &str) -> ExpectationBuilder {
        ExpectationBuilder {
            engine: self,
            pattern: pattern.to_string(),
        }
    }

    /// Shared log of every request this engine has been asked to run
    pub fn request_log(&self) -> RequestLog {
        RequestLog {
            requests: Arc::clone(&self.requests),
        }
    }

    /// Convert this engine into an EngineHandle
    pub fn into_handle(self) -> EngineHandle {
        let (tx, mut rx) = mpsc::channel::<Command>(32);
        let expectations = self.expectations;
        let requests = self.requests;

        tokio::spawn(async move {
            let mut turn_counter = 0u64;

            while let Some(cmd) = rx.recv().await {
                match cmd {
                    Command::Run {
                        request,
                        cancel,
                        permissions,
                        event_tx,
                        reply,
                    } => {
                        turn_counter += 1;
                        let prompt = request.content.text();
                        requests
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .push(request.clone());

                        // FIFO preference: take the front if it matches, otherwise
                        // the first matching expectation anywhere in the queue.
                        let steps = {
                            let mut exp = expectations.lock().unwrap_or_else(|e| e.into_inner());
                            let index = match exp.front() {
                                Some(front) if prompt.contains(&front.pattern) => Some(0),
                                _ => exp.iter().position(|e| prompt.contains(&e.pattern)),
                            };
                            index.and_then(|i| exp.remove(i)).map(|e| e.steps)
                        };
                        let steps = steps.unwrap_or_else(|| {
                            let session_id = request
                                .resume
                                .clone()
                                .unwrap_or_else(|| format!("mock-session-{}", turn_counter));
                            unmatched_script(&session_id, &prompt)
                        });

                        let _ = reply.send(Ok(()));
                        tokio::spawn(play(steps, cancel, permissions, event_tx));
                    }
                }
            }
        });

        EngineHandle::new(tx, "mock")
    }

    /// Factory function for the registry
    pub fn factory() -> crate::registry::EngineFactory {
        Box::new(|_config| Ok(MockEngine::new().into_handle()))
    }
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn unmatched_script(session_id: &str, prompt: &str) -> Vec<MockStep> {
    vec![
        MockStep::Emit(EngineEvent::Init {
            session_id: session_id.to_string(),
            model: Some("mock".to_string()),
            tools: Vec::new(),
        }),
        MockStep::Emit(EngineEvent::text(format!(
            "Mock: no expectation for '{}'",
            prompt
        ))),
        MockStep::Emit(EngineEvent::Result {
            text: None,
            usage: Some(Usage::default()),
            duration_ms: None,
            num_turns: Some(1),
        }),
    ]
}

async fn play(
    steps: Vec<MockStep>,
    cancel: CancellationToken,
    permissions: Arc<dyn PermissionHandler>,
    event_tx: mpsc::Sender<EngineEvent>,
) {
    for step in steps {
        if cancel.is_cancelled() {
            tracing::debug!("Mock turn cancelled between steps");
            return;
        }
        let event = match step {
            MockStep::Emit(event) => event,
            MockStep::RequestPermission { id, name, input } => {
                let decision = permissions.decide(&name, &input);
                EngineEvent::ToolInvocation {
                    id,
                    name,
                    input,
                    decision,
                }
            }
            MockStep::Delay(duration) => {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(duration) => continue,
                }
            }
            MockStep::WaitForCancel => {
                cancel.cancelled().await;
                return;
            }
        };
        if event_tx.send(event).await.is_err() {
            tracing::debug!("Event receiver closed, stopping mock turn");
            return;
        }
    }
}

/// Handle onto the requests a MockEngine has received
#[derive(Clone)]
pub struct RequestLog {
    requests: Arc<Mutex<Vec<EngineRequest>>>,
}

impl RequestLog {
    pub fn all(&self) -> Vec<EngineRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn last(&self) -> Option<EngineRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .last()
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Builder for setting up mock expectations with a fluent API
pub struct ExpectationBuilder {
    engine: MockEngine,
    pattern: String,
}

impl ExpectationBuilder {
    /// Respond with a script of steps
    pub fn respond_with(self, steps: Vec<MockStep>) -> MockEngine {
        self.engine
            .expectations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(Expectation {
                pattern: self.pattern,
                steps,
            });
        self.engine
    }

    /// Respond with a list of events and nothing else
    pub fn respond_events(self, events: Vec<EngineEvent>) -> MockEngine {
        self.respond_with(events.into_iter().map(MockStep::Emit).collect())
    }

    /// Respond with init, one text delta and a result
    pub fn respond_text(self, text: &str) -> MockEngine {
        self.respond_events(vec![
            EngineEvent::Init {
                session_id: format!("mock-{}", uuid::Uuid::new_v4()),
                model: Some("mock".to_string()),
                tools: Vec::new(),
            },
            EngineEvent::text(text),
            EngineEvent::Result {
                text: Some(text.to_string()),
                usage: Some(Usage::default()),
                duration_ms: None,
                num_turns: Some(1),
            },
        ])
    }

    /// Respond with an error
    pub fn respond_error(self, code: ErrorCode, message: &str) -> MockEngine {
        self.respond_events(vec![EngineEvent::Error {
            code,
            message: message.to_string(),
        }])
    }

    /// Emit the given events, then hang until the turn is cancelled
    pub fn respond_then_hang(self, events: Vec<EngineEvent>) -> MockEngine {
        let mut steps: Vec<MockStep> = events.into_iter().map(MockStep::Emit).collect();
        steps.push(MockStep::WaitForCancel);
        self.respond_with(steps)
    }
}
