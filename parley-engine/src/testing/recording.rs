// ABOUTME: Recording wrapper that captures every turn an engine runs.
// ABOUTME: Stores the request and the full event sequence for later assertions or replay.

use crate::event::EngineEvent;
use crate::handle::{Command, EngineHandle};
use crate::request::EngineRequest;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// One recorded turn
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interaction {
    pub timestamp: std::time::SystemTime,
    pub request: EngineRequest,
    pub events: Vec<EngineEvent>,
}

/// Shared transcript filled in by a recording engine
#[derive(Clone, Default)]
pub struct Transcript {
    interactions: Arc<Mutex<Vec<Interaction>>>,
}

impl Transcript {
    /// Copy of the interactions recorded so far
    pub fn interactions(&self) -> Vec<Interaction> {
        self.interactions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Save transcript to a JSON file
    pub async fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.interactions())?;
        tokio::fs::write(path, json).await?;
        Ok(())
    }

    fn push(&self, interaction: Interaction) {
        self.interactions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(interaction);
    }
}

/// Wraps an engine so every turn is recorded.
///
/// Events are forwarded unchanged; the interaction is stored once the inner
/// stream ends.
pub fn record(inner: EngineHandle) -> (EngineHandle, Transcript) {
    let (tx, mut rx) = mpsc::channel::<Command>(32);
    let transcript = Transcript::default();
    let sink = transcript.clone();

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
                    let mut receiver = match inner.run(request.clone(), cancel, permissions).await
                    {
                        Ok(receiver) => receiver,
                        Err(e) => {
                            let _ = reply.send(Err(e));
                            continue;
                        }
                    };
                    let _ = reply.send(Ok(()));

                    let sink = sink.clone();
                    tokio::spawn(async move {
                        let mut events = Vec::new();
                        while let Some(event) = receiver.recv().await {
                            events.push(event.clone());
                            if event_tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        sink.push(Interaction {
                            timestamp: std::time::SystemTime::now(),
                            request,
                            events,
                        });
                    });
                }
            }
        }
    });

    (EngineHandle::new(tx, "recording"), transcript)
}
