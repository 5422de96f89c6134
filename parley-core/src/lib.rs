// ABOUTME: Streaming conversation orchestration for AI agent turns.
// ABOUTME: Resolves session config, builds engine requests, and runs cancellable streamed turns.

pub mod accumulator;
pub mod audit;
pub mod config;
pub mod error;
pub mod event;
pub mod mcp;
pub mod metrics;
pub mod model;
pub mod orchestrator;
pub mod policy;
pub mod registry;
pub mod request;
pub mod resolver;
pub mod skills;
pub mod store;
pub mod stream;

pub use error::TurnError;
pub use event::TurnEvent;
pub use model::{
    AgentProfile, Attachment, AttachmentRef, ChatMessage, ChatSession, MessageRole, NewSession,
    PermissionMode, SessionStatus, ToolUseRecord,
};
pub use orchestrator::{Orchestrator, TurnRequest};
pub use registry::{ActiveStream, CancellationRegistry};
pub use resolver::TurnOverrides;
pub use store::{ContentStore, SqliteStore};
pub use stream::TurnStream;

// Re-export engine types used across the public API
pub use parley_engine::{EngineHandle, EngineRegistry, Usage};
