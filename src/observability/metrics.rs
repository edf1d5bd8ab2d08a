//! Metrics collection and exposition.
//!
//! # Metrics
//! - `bulwark_breaker_state` (gauge): 0=closed, 1=open, 2=half-open, by breaker
//! - `bulwark_breaker_transitions_total` (counter): by breaker, from, to
//! - `bulwark_breaker_rejections_total` (counter): by breaker
//! - `bulwark_boundary_calls_total` (counter): by channel, outcome
//! - `bulwark_boundary_call_duration_seconds` (histogram): by channel
//! - `bulwark_boundary_fallbacks_total` (counter): by channel
//! - `bulwark_connections_active` (gauge)
//! - `bulwark_connections_admitted_total` (counter)
//! - `bulwark_connections_rejected_total` (counter): by scope
//! - `bulwark_connections_released_total` (counter): by reason
//! - `bulwark_connection_failures_total` (counter): by kind
//! - `bulwark_startup_state` (gauge): 0=initializing, 1=ready, 2=degraded, 3=failed
//! - `bulwark_component_init_duration_seconds` (histogram): by component, outcome
//!
//! # Design Decisions
//! - Every emission goes through a helper here so names and labels stay consistent
//! - Owner keys are never used as labels
//! - Without an installed recorder the helpers are no-ops

use std::net::SocketAddr;
use std::time::Duration;

use metrics_exporter_prometheus::PrometheusBuilder;

use crate::lifecycle::startup::{ComponentOutcome, StartupState};
use crate::resilience::circuit_breaker::CircuitState;

/// Install the Prometheus recorder and its scrape listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

fn breaker_state_value(state: CircuitState) -> f64 {
    match state {
        CircuitState::Closed => 0.0,
        CircuitState::Open => 1.0,
        CircuitState::HalfOpen => 2.0,
    }
}

pub fn record_breaker_state(name: &str, state: CircuitState) {
    ::metrics::gauge!("bulwark_breaker_state", "breaker" => name.to_string())
        .set(breaker_state_value(state));
}

pub fn record_breaker_transition(name: &str, from: CircuitState, to: CircuitState) {
    ::metrics::counter!(
        "bulwark_breaker_transitions_total",
        "breaker" => name.to_string(),
        "from" => from.as_str(),
        "to" => to.as_str()
    )
    .increment(1);
    record_breaker_state(name, to);
}

pub fn record_breaker_rejection(name: &str) {
    ::metrics::counter!("bulwark_breaker_rejections_total", "breaker" => name.to_string())
        .increment(1);
}

pub fn record_boundary_outcome(channel: &str, outcome: &'static str) {
    ::metrics::counter!(
        "bulwark_boundary_calls_total",
        "channel" => channel.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

pub fn record_boundary_latency(channel: &str, elapsed: Duration) {
    ::metrics::histogram!(
        "bulwark_boundary_call_duration_seconds",
        "channel" => channel.to_string()
    )
    .record(elapsed.as_secs_f64());
}

pub fn record_boundary_fallback(channel: &str) {
    ::metrics::counter!("bulwark_boundary_fallbacks_total", "channel" => channel.to_string())
        .increment(1);
}

pub fn record_active_connections(count: usize) {
    ::metrics::gauge!("bulwark_connections_active").set(count as f64);
}

pub fn record_connection_admitted() {
    ::metrics::counter!("bulwark_connections_admitted_total").increment(1);
}

pub fn record_connection_rejected(scope: &'static str) {
    ::metrics::counter!("bulwark_connections_rejected_total", "scope" => scope).increment(1);
}

pub fn record_connection_released(reason: &'static str) {
    ::metrics::counter!("bulwark_connections_released_total", "reason" => reason).increment(1);
}

pub fn record_connection_failure(kind: &'static str) {
    ::metrics::counter!("bulwark_connection_failures_total", "kind" => kind).increment(1);
}

pub fn record_startup_state(state: StartupState) {
    let value = match state {
        StartupState::Initializing => 0.0,
        StartupState::Ready => 1.0,
        StartupState::Degraded => 2.0,
        StartupState::Failed => 3.0,
    };
    ::metrics::gauge!("bulwark_startup_state").set(value);
}

pub fn record_component_init(name: &str, outcome: ComponentOutcome, duration_ms: u64) {
    ::metrics::histogram!(
        "bulwark_component_init_duration_seconds",
        "component" => name.to_string(),
        "outcome" => outcome.as_str()
    )
    .record(duration_ms as f64 / 1000.0);
}
