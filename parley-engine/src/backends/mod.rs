// ABOUTME: Engine implementations (direct Claude CLI, scripted mock).
// ABOUTME: Each engine exposes itself through an EngineHandle worker.

pub mod direct_cli;
pub mod mock;
