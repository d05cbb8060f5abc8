//! Metrics collection and exposition.
//!
//! # Metrics
//! - `broker_requests_total` (counter): gateway requests by method, status
//! - `broker_request_duration_seconds` (histogram): gateway latency by method
//! - `broker_connected_agents` (gauge): agents currently registered
//! - `broker_exchange_outcomes_total` (counter): reply, timeout, no_agent, send_failed
//! - `broker_late_replies_total` (counter): replies with no waiting exchange
//! - `broker_relay_sessions_total` (counter): relay sessions that ran and closed
//! - `broker_relay_bytes_total` (counter): relayed payload bytes by sending side
//!
//! Recording goes through the `metrics` facade and is a no-op until
//! `init_metrics` installs the Prometheus exporter.

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus exporter with an HTTP scrape listener on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

/// Record a completed gateway request.
pub fn record_request(method: &str, status: u16, start: Instant) {
    counter!(
        "broker_requests_total",
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!("broker_request_duration_seconds", "method" => method.to_string())
        .record(start.elapsed().as_secs_f64());
}

pub fn record_exchange_outcome(outcome: &'static str) {
    counter!("broker_exchange_outcomes_total", "outcome" => outcome).increment(1);
}

pub fn record_late_reply() {
    counter!("broker_late_replies_total").increment(1);
}

pub fn set_connected_agents(count: usize) {
    gauge!("broker_connected_agents").set(count as f64);
}

/// Record a finished relay session and the bytes each side sent.
pub fn record_relay_session(client_bytes: u64, host_bytes: u64) {
    counter!("broker_relay_sessions_total").increment(1);
    counter!("broker_relay_bytes_total", "from" => "client").increment(client_bytes);
    counter!("broker_relay_bytes_total", "from" => "host").increment(host_bytes);
}
