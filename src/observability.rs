//! Structured logging initialization and the Prometheus metrics surface.
//!
//! Logging follows `tracing` + `tracing-subscriber` with an `EnvFilter`
//! driven by `RUST_LOG`, defaulting to `resonance_rail=info`. Metrics are
//! recorded through the `metrics` facade and rendered for the `/metrics`
//! HTTP endpoint by a `PrometheusHandle`, matching the pack's use of
//! `metrics::{counter, gauge, histogram}` macros.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

static PROCESS_START: OnceLock<Instant> = OnceLock::new();

/// Installs the global tracing subscriber. Call once, at process startup.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("resonance_rail=info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

/// Installs the global metrics recorder and returns a handle that renders
/// the current state in Prometheus text exposition format.
#[must_use]
pub fn install_metrics_recorder() -> PrometheusHandle {
    PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install prometheus recorder")
}

/// Increments `rail_messages_processed_total`.
pub fn record_message_processed() {
    metrics::counter!("rail_messages_processed_total").increment(1);
}

/// Sets `rail_connections_active` to `count`.
pub fn set_connections_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    metrics::gauge!("rail_connections_active").set(count as f64);
}

/// Sets `rail_order_parameter` to the latest tick's `r`.
pub fn set_order_parameter(r: f64) {
    metrics::gauge!("rail_order_parameter").set(r);
}

/// Records one tick's wall-clock duration in
/// `rail_tick_duration_seconds`.
pub fn record_tick_duration(duration: Duration) {
    metrics::histogram!("rail_tick_duration_seconds").record(duration);
}

/// Increments `rail_firewall_blocks_total`.
pub fn record_firewall_block() {
    metrics::counter!("rail_firewall_blocks_total").increment(1);
}

/// Increments `rail_absorption_stage_total{stage=...}`.
pub fn record_absorption_stage(stage: &'static str) {
    metrics::counter!("rail_absorption_stage_total", "stage" => stage).increment(1);
}

/// Marks the process start time. Call once, at process startup; later
/// calls are no-ops so tests that build multiple `RailCore`s don't reset
/// it.
pub fn mark_process_start() {
    let _ = PROCESS_START.set(Instant::now());
}

/// Sets `rail_uptime_seconds` to the elapsed time since
/// [`mark_process_start`]. A no-op if the process start was never marked.
pub fn set_uptime_seconds() {
    if let Some(start) = PROCESS_START.get() {
        metrics::gauge!("rail_uptime_seconds").set(start.elapsed().as_secs_f64());
    }
}
