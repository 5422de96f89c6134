// ABOUTME: One streamed turn end to end: relays engine events, persists the reply, emits the terminal event.
// ABOUTME: Runs in its own task; the caller holds a TurnStream receiving events in engine order.

use crate::accumulator::{TurnAccumulator, TurnOutcome};
use crate::audit::AuditSink;
use crate::event::TurnEvent;
use crate::metrics;
use crate::model::{NewMessage, SessionPatch};
use crate::registry::{CancellationRegistry, RegistrationGuard};
use crate::store::ContentStore;
use chrono::Utc;
use parley_engine::{EngineEvent, EventReceiver};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

/// Capacity of the caller event channel
pub const TURN_EVENT_BUFFER: usize = 256;

/// Caller side of a running turn
#[derive(Debug)]
pub struct TurnStream {
    stream_id: String,
    events: mpsc::Receiver<TurnEvent>,
}

impl TurnStream {
    pub(crate) fn new(stream_id: String, events: mpsc::Receiver<TurnEvent>) -> Self {
        Self { stream_id, events }
    }

    /// Id to pass to `Orchestrator::cancel`
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Next caller event; None once the turn has finished and cleaned up
    pub async fn recv(&mut self) -> Option<TurnEvent> {
        self.events.recv().await
    }

    pub fn into_stream(self) -> ReceiverStream<TurnEvent> {
        ReceiverStream::new(self.events)
    }

    /// Drain every remaining event
    pub async fn collect(mut self) -> Vec<TurnEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.events.recv().await {
            events.push(event);
        }
        events
    }
}

/// State owned by the task driving one turn
pub(crate) struct StreamSession {
    pub stream_id: String,
    pub session_id: String,
    pub had_resume_token: bool,
    pub cancel: CancellationToken,
    pub registry: Arc<CancellationRegistry>,
    pub guard: RegistrationGuard,
    pub store: Arc<dyn ContentStore>,
    pub audit: Arc<dyn AuditSink>,
    pub events: mpsc::Sender<TurnEvent>,
}

impl StreamSession {
    pub async fn run(self, mut engine_events: EventReceiver) {
        let started = Instant::now();
        let mut caller_connected = true;
        let mut accumulator = TurnAccumulator::new();
        let mut resume_token_saved = self.had_resume_token;

        self.emit(
            &mut caller_connected,
            TurnEvent::Stream {
                stream_id: self.stream_id.clone(),
            },
        )
        .await;

        loop {
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                event = engine_events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            self.mirror_event(&event).await;

            for out in accumulator.apply(&event) {
                if let TurnEvent::ToolObserved { name, .. } = &out {
                    metrics::record_tool_used(name);
                }
                self.emit(&mut caller_connected, out).await;
            }

            if !resume_token_saved {
                if let Some(token) = accumulator.provider_session_id() {
                    self.save_resume_token(token).await;
                    resume_token_saved = true;
                }
            }
        }

        let terminal = match accumulator.finish(self.cancel.is_cancelled()) {
            TurnOutcome::Completed(draft) => {
                if let Some(mut draft) = draft {
                    draft.metadata.stream_id = Some(self.stream_id.clone());
                    self.save_assistant_message(NewMessage::assistant(draft.content, draft.metadata))
                        .await;
                }
                accumulator.mark_completed();
                if let Some(usage) = accumulator.usage() {
                    metrics::record_usage(
                        usage.input_tokens,
                        usage.output_tokens,
                        accumulator.cost_usd(),
                    );
                }
                metrics::record_turn_finished("completed", started.elapsed());
                tracing::info!(
                    stream_id = %self.stream_id,
                    session_id = %self.session_id,
                    tool_uses = accumulator.tool_uses().len(),
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Turn completed"
                );
                accumulator.done_event()
            }
            TurnOutcome::Cancelled => {
                metrics::record_turn_finished("cancelled", started.elapsed());
                let reason = self
                    .registry
                    .cancel_reason(&self.stream_id)
                    .unwrap_or_else(|| "cancelled".to_string());
                tracing::info!(
                    stream_id = %self.stream_id,
                    session_id = %self.session_id,
                    reason = %reason,
                    "Turn cancelled"
                );
                TurnEvent::Cancelled {
                    reason,
                    timestamp: Utc::now(),
                }
            }
            TurnOutcome::Errored { message } => {
                metrics::record_turn_finished("errored", started.elapsed());
                tracing::warn!(
                    stream_id = %self.stream_id,
                    session_id = %self.session_id,
                    error = %message,
                    "Turn failed"
                );
                TurnEvent::Error { message }
            }
        };
        self.emit(&mut caller_connected, terminal).await;

        // Leave the registry before the caller sees the channel close
        let StreamSession { guard, events, .. } = self;
        drop(guard);
        drop(events);
    }

    /// Relay one event, never blocking past cancellation.
    ///
    /// Once the turn is cancelled a stalled caller only gets what fits in the buffer.
    async fn emit(&self, caller_connected: &mut bool, event: TurnEvent) {
        if !*caller_connected {
            return;
        }
        let permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            permit = self.events.reserve() => Some(permit),
        };
        match permit {
            Some(Ok(permit)) => permit.send(event),
            Some(Err(_)) => self.caller_gone(caller_connected),
            None => match self.events.try_send(event) {
                Ok(()) => {}
                Err(TrySendError::Full(event)) => tracing::debug!(
                    stream_id = %self.stream_id,
                    event = event.name(),
                    "Caller not reading, dropping event after cancellation"
                ),
                Err(TrySendError::Closed(_)) => self.caller_gone(caller_connected),
            },
        }
    }

    fn caller_gone(&self, caller_connected: &mut bool) {
        *caller_connected = false;
        tracing::debug!(
            stream_id = %self.stream_id,
            "Caller dropped the stream, continuing turn without it"
        );
    }

    async fn mirror_event(&self, event: &EngineEvent) {
        if let Err(e) = self
            .audit
            .append_event(&self.session_id, &self.stream_id, event)
            .await
        {
            metrics::record_error("audit_event");
            tracing::warn!(
                stream_id = %self.stream_id,
                kind = %event.kind(),
                error = %e,
                "Failed to mirror engine event to audit log"
            );
        }
    }

    async fn save_resume_token(&self, token: &str) {
        let patch = SessionPatch {
            provider_session_id: Some(token.to_string()),
            ..Default::default()
        };
        match self.store.update_session(&self.session_id, patch).await {
            Ok(()) => tracing::debug!(
                session_id = %self.session_id,
                provider_session_id = %token,
                "Saved resume token"
            ),
            Err(e) => {
                metrics::record_error("save_resume_token");
                tracing::warn!(session_id = %self.session_id, error = %e, "Failed to save resume token");
            }
        }
    }

    async fn save_assistant_message(&self, message: NewMessage) {
        match self.store.create_message(&self.session_id, message).await {
            Ok(saved) => {
                if let Err(e) = self.audit.append_message(&self.session_id, &saved).await {
                    metrics::record_error("audit_message");
                    tracing::warn!(session_id = %self.session_id, error = %e, "Failed to audit assistant message");
                }
            }
            Err(e) => {
                metrics::record_error("save_assistant_message");
                tracing::error!(
                    stream_id = %self.stream_id,
                    session_id = %self.session_id,
                    error = %e,
                    "Failed to save assistant message"
                );
            }
        }
    }
}
