// ABOUTME: Replays captured Claude CLI stream-json output as engine events.
// ABOUTME: Lets tests drive the orchestrator with real provider transcripts through the mock engine.

use crate::backends::direct_cli::StreamParser;
use crate::backends::mock::MockStep;
use crate::event::EngineEvent;
use anyhow::{Context, Result};
use serde_json::Value;
use std::path::Path;

/// Parse stream-json text (one JSON document per line) into engine events.
///
/// Control requests are skipped; they only make sense against a live process.
pub fn parse_transcript(text: &str) -> Result<Vec<EngineEvent>> {
    let mut parser = StreamParser::default();
    let mut events = Vec::new();
    for (index, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let json: Value = serde_json::from_str(line)
            .with_context(|| format!("Invalid JSON on transcript line {}", index + 1))?;
        if json.get("type").and_then(|t| t.as_str()) == Some("control_request") {
            continue;
        }
        events.extend(parser.parse(&json));
    }
    Ok(events)
}

/// Load a transcript file and turn it into mock steps
pub async fn load_steps(path: &Path) -> Result<Vec<MockStep>> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read transcript {}", path.display()))?;
    Ok(parse_transcript(&text)?
        .into_iter()
        .map(MockStep::Emit)
        .collect())
}
