// ABOUTME: parley binary support: config-to-orchestrator wiring, HTTP/SSE server, CLI commands.
// ABOUTME: Turn semantics live in parley-core; engines live in parley-engine.

pub mod app;
pub mod cli;
pub mod logging;
pub mod server;
