// ABOUTME: Classifies engine events for one turn and accumulates the assistant reply.
// ABOUTME: Produces the caller-visible events in order and decides the terminal outcome.

use crate::event::TurnEvent;
use crate::model::{MessageMetadata, ToolUseRecord};
use parley_engine::{ContentBlock, EngineEvent, Usage};
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    AwaitingInit,
    Streaming,
    Finalizing,
    Completed,
    Cancelled,
    Errored,
}

/// Assistant message content assembled from a completed turn
#[derive(Debug, Clone, PartialEq)]
pub struct AssistantDraft {
    pub content: String,
    pub metadata: MessageMetadata,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    /// Natural end; `None` when there was nothing worth persisting
    Completed(Option<AssistantDraft>),
    Cancelled,
    Errored { message: String },
}

#[derive(Debug)]
pub struct TurnAccumulator {
    phase: TurnPhase,
    text: String,
    tool_uses: Vec<ToolUseRecord>,
    turn_started: bool,
    /// Messages whose text already reached the caller as deltas
    streamed_message_ids: HashSet<String>,
    /// Unattributed deltas seen since the last content block
    unattributed_deltas: bool,
    last_text_message_id: Option<String>,
    provider_session_id: Option<String>,
    usage: Option<Usage>,
    cost_usd: Option<f64>,
    result_text: Option<String>,
    error: Option<String>,
}

impl Default for TurnAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl TurnAccumulator {
    pub fn new() -> Self {
        Self {
            phase: TurnPhase::AwaitingInit,
            text: String::new(),
            tool_uses: Vec::new(),
            turn_started: false,
            streamed_message_ids: HashSet::new(),
            unattributed_deltas: false,
            last_text_message_id: None,
            provider_session_id: None,
            usage: None,
            cost_usd: None,
            result_text: None,
            error: None,
        }
    }

    pub fn phase(&self) -> TurnPhase {
        self.phase
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn tool_uses(&self) -> &[ToolUseRecord] {
        &self.tool_uses
    }

    /// Resume token from the first Init event
    pub fn provider_session_id(&self) -> Option<&str> {
        self.provider_session_id.as_deref()
    }

    pub fn usage(&self) -> Option<&Usage> {
        self.usage.as_ref()
    }

    pub fn cost_usd(&self) -> Option<f64> {
        self.cost_usd
    }

    /// Fold one engine event into the turn and return the caller events it produces
    pub fn apply(&mut self, event: &EngineEvent) -> Vec<TurnEvent> {
        let mut out = Vec::new();
        match event {
            EngineEvent::Init { session_id, .. } => {
                if self.provider_session_id.is_none() {
                    self.provider_session_id = Some(session_id.clone());
                }
                if self.phase == TurnPhase::AwaitingInit {
                    self.phase = TurnPhase::Streaming;
                }
            }
            EngineEvent::TextDelta { message_id, text } => {
                self.phase = TurnPhase::Streaming;
                match message_id {
                    Some(id) => {
                        self.streamed_message_ids.insert(id.clone());
                    }
                    None => self.unattributed_deltas = true,
                }
                self.push_text(message_id.as_deref(), text, false, &mut out);
            }
            EngineEvent::AssistantContent { message_id, blocks } => {
                self.phase = TurnPhase::Streaming;
                let already_streamed = match message_id {
                    Some(id) => self.streamed_message_ids.contains(id),
                    None => self.unattributed_deltas,
                };
                for block in blocks {
                    match block {
                        ContentBlock::Text { text } if !already_streamed => {
                            self.push_text(message_id.as_deref(), text, true, &mut out);
                        }
                        ContentBlock::Text { .. } | ContentBlock::Thinking { .. } => {}
                        ContentBlock::ToolUse { id, name, input } => {
                            self.tool_uses.push(ToolUseRecord {
                                id: id.clone(),
                                name: name.clone(),
                                input: input.clone(),
                            });
                            out.push(TurnEvent::ToolObserved {
                                id: id.clone(),
                                name: name.clone(),
                                input: input.clone(),
                            });
                        }
                    }
                }
                self.unattributed_deltas = false;
            }
            EngineEvent::Result { text, usage, .. } => {
                if let Some(usage) = usage {
                    if usage.cost_usd.is_some() {
                        self.cost_usd = usage.cost_usd;
                    }
                    self.usage = Some(usage.clone());
                }
                if text.is_some() {
                    self.result_text = text.clone();
                }
            }
            EngineEvent::Error { code, message } => {
                tracing::warn!(code = ?code, error = %message, "Engine reported an error");
                if self.error.is_none() {
                    self.error = Some(message.clone());
                }
            }
            EngineEvent::ToolInvocation { name, decision, .. } => {
                tracing::debug!(
                    tool = %name,
                    allowed = decision.is_allowed(),
                    "Engine applied tool permission decision"
                );
            }
            EngineEvent::Other { kind, .. } => {
                tracing::trace!(kind = %kind, "Unclassified engine event");
            }
        }
        out
    }

    /// `whole_block` marks text that arrived as a complete content block rather than a delta
    fn push_text(
        &mut self,
        message_id: Option<&str>,
        text: &str,
        whole_block: bool,
        out: &mut Vec<TurnEvent>,
    ) {
        if text.is_empty() {
            return;
        }
        if !self.turn_started {
            self.turn_started = true;
            out.push(TurnEvent::TurnStarted);
        }

        // Separate consecutive assistant messages and consecutive text blocks
        let new_message = match (message_id, self.last_text_message_id.as_deref()) {
            (Some(id), Some(last)) => id != last,
            _ => false,
        };
        let mut chunk = String::new();
        if (new_message || whole_block)
            && !self.text.is_empty()
            && !self.text.ends_with(char::is_whitespace)
            && !text.starts_with(char::is_whitespace)
        {
            chunk.push_str("\n\n");
        }
        chunk.push_str(text);
        if let Some(id) = message_id {
            self.last_text_message_id = Some(id.to_string());
        }

        self.text.push_str(&chunk);
        out.push(TurnEvent::TextDelta { text: chunk });
    }

    /// Decide the terminal outcome once the engine stream has stopped
    pub fn finish(&mut self, cancelled: bool) -> TurnOutcome {
        if cancelled {
            self.phase = TurnPhase::Cancelled;
            return TurnOutcome::Cancelled;
        }
        if let Some(message) = self.error.clone() {
            self.phase = TurnPhase::Errored;
            return TurnOutcome::Errored { message };
        }

        self.phase = TurnPhase::Finalizing;
        if self.text.is_empty() {
            if let Some(text) = self.result_text.take() {
                self.text = text;
            }
        }
        if self.text.trim().is_empty() && self.tool_uses.is_empty() {
            return TurnOutcome::Completed(None);
        }
        TurnOutcome::Completed(Some(AssistantDraft {
            content: self.text.clone(),
            metadata: MessageMetadata {
                tool_uses: self.tool_uses.clone(),
                cost_usd: self.cost_usd,
                usage: self.usage.clone(),
                stream_id: None,
            },
        }))
    }

    /// Called after the assistant message has been dealt with
    pub fn mark_completed(&mut self) {
        if self.phase == TurnPhase::Finalizing {
            self.phase = TurnPhase::Completed;
        }
    }

    /// The terminal caller event for a completed turn
    pub fn done_event(&self) -> TurnEvent {
        TurnEvent::Done {
            cost_usd: self.cost_usd,
            usage: self.usage.clone(),
        }
    }
}
