//! Metrics collection and exposition.
//!
//! # Metrics
//! - `proxy_requests_total` (counter): HTTP requests by status and outcome
//! - `proxy_request_duration_seconds` (histogram): HTTP latency distribution
//! - `proxy_routes` (gauge): registered host keys
//! - `proxy_listeners` (gauge): open dynamic listeners
//! - `proxy_watch_errors_total` (counter): failed discovery fetches
//! - `proxy_tcp_bytes_total` (counter): raw passthrough bytes by direction
//!
//! Recording is a no-op until a recorder is installed.

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Install the Prometheus recorder and its scrape endpoint.
///
/// Must be called from within a Tokio runtime.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

/// Record one proxied HTTP request.
pub fn record_request(status: u16, outcome: &'static str, start: Instant) {
    counter!(
        "proxy_requests_total",
        "status" => status.to_string(),
        "outcome" => outcome
    )
    .increment(1);
    histogram!("proxy_request_duration_seconds", "outcome" => outcome)
        .record(start.elapsed().as_secs_f64());
}

pub fn set_routes(count: usize) {
    gauge!("proxy_routes").set(count as f64);
}

pub fn set_listeners(count: usize) {
    gauge!("proxy_listeners").set(count as f64);
}

pub fn record_watch_error() {
    counter!("proxy_watch_errors_total").increment(1);
}

/// Bytes relayed by raw TCP passthrough.
pub fn record_tcp_bytes(upstream: u64, downstream: u64) {
    counter!("proxy_tcp_bytes_total", "direction" => "upstream").increment(upstream);
    counter!("proxy_tcp_bytes_total", "direction" => "downstream").increment(downstream);
}
