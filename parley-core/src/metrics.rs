// ABOUTME: Prometheus metrics for streamed turns: counts, tokens, cost and durations.
// ABOUTME: Recording is a no-op until init_metrics installs the exporter recorder.

use anyhow::Result;
use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Install the global Prometheus recorder and describe every metric
pub fn init_metrics() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus recorder: {}", e))?;

    describe_counter!("parley_turns_started_total", "Turns dispatched to the engine");
    describe_counter!(
        "parley_turns_finished_total",
        "Turns that reached a terminal outcome, by outcome"
    );
    describe_counter!("parley_tool_uses_total", "Tool uses observed, by tool");
    describe_counter!("parley_tokens_total", Unit::Count, "Tokens consumed, by direction");
    describe_counter!(
        "parley_cost_microdollars_total",
        "Provider-reported cost in millionths of a USD"
    );
    describe_counter!("parley_errors_total", "Non-fatal failures, by kind");
    describe_histogram!(
        "parley_turn_duration_seconds",
        Unit::Seconds,
        "Wall time from dispatch to terminal event"
    );

    Ok(handle)
}

pub fn record_turn_started(engine: &str) {
    counter!("parley_turns_started_total", "engine" => engine.to_string()).increment(1);
}

/// `outcome` is one of completed, cancelled, errored
pub fn record_turn_finished(outcome: &'static str, duration: Duration) {
    counter!("parley_turns_finished_total", "outcome" => outcome).increment(1);
    histogram!("parley_turn_duration_seconds", "outcome" => outcome).record(duration.as_secs_f64());
}

pub fn record_tool_used(tool: &str) {
    counter!("parley_tool_uses_total", "tool" => tool.to_string()).increment(1);
}

pub fn record_usage(input_tokens: u64, output_tokens: u64, cost_usd: Option<f64>) {
    counter!("parley_tokens_total", "direction" => "input").increment(input_tokens);
    counter!("parley_tokens_total", "direction" => "output").increment(output_tokens);
    if let Some(cost) = cost_usd.filter(|c| c.is_finite() && *c > 0.0) {
        counter!("parley_cost_microdollars_total").increment((cost * 1_000_000.0).round() as u64);
    }
}

pub fn record_error(kind: &'static str) {
    counter!("parley_errors_total", "kind" => kind).increment(1);
}
