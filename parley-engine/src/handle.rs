// ABOUTME: EngineHandle provides a Send+Sync front for engine worker tasks.
// ABOUTME: Uses channels to hand turn requests to the worker and stream events back.

use crate::permission::PermissionHandler;
use crate::request::EngineRequest;
use crate::EngineEvent;
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Capacity of the per-turn event channel
const EVENT_BUFFER: usize = 2048;

/// Commands sent from EngineHandle to the engine worker
pub enum Command {
    Run {
        request: EngineRequest,
        cancel: CancellationToken,
        permissions: Arc<dyn PermissionHandler>,
        event_tx: mpsc::Sender<EngineEvent>,
        reply: oneshot::Sender<Result<()>>,
    },
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Run { request, .. } => f
                .debug_struct("Run")
                .field("model", &request.model)
                .finish_non_exhaustive(),
        }
    }
}

/// Send + Sync handle the orchestrator talks to.
///
/// Each `run` call starts an independent turn on the worker; turns do not
/// queue behind each other.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<Command>,
    name: &'static str,
}

impl EngineHandle {
    /// Create a new EngineHandle with the given command channel and engine name
    pub fn new(tx: mpsc::Sender<Command>, name: &'static str) -> Self {
        Self { tx, name }
    }

    /// Get the engine name
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Start a turn and receive its events via EventReceiver.
    ///
    /// The engine stops at its next event boundary once `cancel` fires. The
    /// receiver yields `None` when the turn's event stream has ended.
    pub async fn run(
        &self,
        request: EngineRequest,
        cancel: CancellationToken,
        permissions: Arc<dyn PermissionHandler>,
    ) -> Result<EventReceiver> {
        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
        let (reply_tx, reply_rx) = oneshot::channel();

        self.tx
            .send(Command::Run {
                request,
                cancel,
                permissions,
                event_tx,
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("Engine worker closed"))?;

        // Wait for the engine to acknowledge the turn started
        reply_rx
            .await
            .map_err(|_| anyhow::anyhow!("Engine worker dropped reply channel"))??;

        Ok(EventReceiver::new(event_rx))
    }
}

/// Receiver for streaming events from a turn.
///
/// This is `Send` so it can be passed across async task boundaries.
pub struct EventReceiver {
    rx: mpsc::Receiver<EngineEvent>,
}

impl EventReceiver {
    /// Create a new EventReceiver wrapping the given channel
    pub fn new(rx: mpsc::Receiver<EngineEvent>) -> Self {
        Self { rx }
    }

    /// Receive the next event, or None if the stream is closed
    pub async fn recv(&mut self) -> Option<EngineEvent> {
        self.rx.recv().await
    }

    /// Try to receive an event without blocking
    pub fn try_recv(&mut self) -> Option<EngineEvent> {
        self.rx.try_recv().ok()
    }
}
