// ABOUTME: Test helpers shared by parley crates.
// ABOUTME: Recording wrapper for engines and replay of captured Claude CLI transcripts.

pub mod cli_transcript;
pub mod recording;
