// ABOUTME: Typed errors returned when a turn cannot start.
// ABOUTME: Failures after the turn starts are reported as terminal stream events instead.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TurnError {
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Invalid turn request: {0}")]
    InvalidRequest(String),

    #[error("Engine failed to start turn: {0}")]
    Engine(String),

    #[error("Storage failure: {0:#}")]
    Store(#[source] anyhow::Error),
}
