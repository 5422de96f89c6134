// ABOUTME: Execution engine abstraction for parley conversation turns.
// ABOUTME: Provides the request descriptor, typed engine events, and Send+Sync engine handles.

pub mod event;
pub mod handle;
pub mod permission;
pub mod registry;
pub mod request;

pub mod backends;
pub mod testing;

pub use event::{ContentBlock, EngineEvent, ErrorCode, Usage};
pub use handle::{EngineHandle, EventReceiver};
pub use permission::{PermissionDecision, PermissionHandler};
pub use registry::{EngineFactory, EngineRegistry};
pub use request::{
    BinarySource, EnginePermissionMode, EngineRequest, InputBlock, McpServerSpec, PromptContent,
};
pub use tokio_util::sync::CancellationToken;
