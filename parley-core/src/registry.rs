// ABOUTME: Process-wide table of in-flight turns and their cancellation tokens.
// ABOUTME: Allows out-of-band cancel by stream id; entries are removed by a drop guard.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

pub const CANCEL_REASON_USER: &str = "cancelled by user";
pub const CANCEL_REASON_SHUTDOWN: &str = "server shutting down";

struct Entry {
    token: CancellationToken,
    session_id: String,
    started_at: DateTime<Utc>,
    cancel_reason: Option<String>,
}

/// A live stream as reported to operators
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ActiveStream {
    pub stream_id: String,
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub cancel_requested: bool,
}

#[derive(Default)]
pub struct CancellationRegistry {
    streams: Mutex<HashMap<String, Entry>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn streams(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.streams.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Allocate a fresh stream id and its cancellation token
    pub fn register(&self, session_id: &str) -> (String, CancellationToken) {
        let stream_id = uuid::Uuid::new_v4().to_string();
        let token = CancellationToken::new();
        self.streams().insert(
            stream_id.clone(),
            Entry {
                token: token.clone(),
                session_id: session_id.to_string(),
                started_at: Utc::now(),
                cancel_reason: None,
            },
        );
        tracing::debug!(stream_id = %stream_id, session_id = %session_id, "Stream registered");
        (stream_id, token)
    }

    /// Signal a stream's token. True only on the first call for a live stream.
    pub fn cancel(&self, stream_id: &str) -> bool {
        self.cancel_with_reason(stream_id, CANCEL_REASON_USER)
    }

    pub fn cancel_with_reason(&self, stream_id: &str, reason: &str) -> bool {
        let mut streams = self.streams();
        let Some(entry) = streams.get_mut(stream_id) else {
            return false;
        };
        if entry.cancel_reason.is_some() {
            return false;
        }
        entry.cancel_reason = Some(reason.to_string());
        entry.token.cancel();
        tracing::info!(
            stream_id = %stream_id,
            session_id = %entry.session_id,
            reason = %reason,
            "Stream cancel requested"
        );
        true
    }

    /// Cancel every live stream, returning how many were newly signalled
    pub fn cancel_all(&self, reason: &str) -> usize {
        let mut streams = self.streams();
        let mut count = 0;
        for entry in streams.values_mut() {
            if entry.cancel_reason.is_none() {
                entry.cancel_reason = Some(reason.to_string());
                entry.token.cancel();
                count += 1;
            }
        }
        count
    }

    /// Reason recorded by the cancel call, if any
    pub fn cancel_reason(&self, stream_id: &str) -> Option<String> {
        self.streams()
            .get(stream_id)
            .and_then(|e| e.cancel_reason.clone())
    }

    pub fn unregister(&self, stream_id: &str) {
        if self.streams().remove(stream_id).is_some() {
            tracing::debug!(stream_id = %stream_id, "Stream unregistered");
        }
    }

    pub fn list(&self) -> Vec<String> {
        self.streams().keys().cloned().collect()
    }

    /// Live streams, oldest first
    pub fn snapshot(&self) -> Vec<ActiveStream> {
        let mut active: Vec<ActiveStream> = self
            .streams()
            .iter()
            .map(|(id, entry)| ActiveStream {
                stream_id: id.clone(),
                session_id: entry.session_id.clone(),
                started_at: entry.started_at,
                cancel_requested: entry.cancel_reason.is_some(),
            })
            .collect();
        active.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        active
    }

    pub fn len(&self) -> usize {
        self.streams().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Unregisters its stream when dropped
pub struct RegistrationGuard {
    registry: Arc<CancellationRegistry>,
    stream_id: String,
}

impl RegistrationGuard {
    pub fn new(registry: Arc<CancellationRegistry>, stream_id: String) -> Self {
        Self {
            registry,
            stream_id,
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        self.registry.unregister(&self.stream_id);
    }
}
