//! Metrics collection and exposition.
//!
//! # Metrics
//! - `relay_requests_total` (counter): relayed requests by method and outcome
//! - `relay_request_duration_seconds` (histogram): time to response head
//! - `broker_connections` (gauge): registered tunnel channels
//! - `filter_denials_total` (counter): denials by side (server/client)
//! - `tunnel_reconnects_total` (counter): client reconnect attempts

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus exporter listening on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_relay(method: &str, outcome: &'static str, start: Instant) {
    counter!("relay_requests_total", "method" => method.to_string(), "outcome" => outcome).increment(1);
    histogram!("relay_request_duration_seconds", "outcome" => outcome).record(start.elapsed().as_secs_f64());
}

pub fn record_connections(count: usize) {
    gauge!("broker_connections").set(count as f64);
}

pub fn record_filter_denial(side: &'static str) {
    counter!("filter_denials_total", "side" => side).increment(1);
}

pub fn record_reconnect() {
    counter!("tunnel_reconnects_total").increment(1);
}
