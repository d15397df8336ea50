//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define server metrics (requests, latency, cache efficiency, restarts)
//! - Expose Prometheus-compatible metrics endpoint
//!
//! # Metrics
//! - `gracehttp_requests_total` (counter): requests by server, status
//! - `gracehttp_request_duration_seconds` (histogram): latency distribution
//! - `gracehttp_route_cache_total` (counter): resolution cache hits and misses
//! - `gracehttp_restarts_total` (counter): restart/reload attempts by outcome
//! - `gracehttp_listeners_running` (gauge): listeners currently accepting
//!
//! # Design Decisions
//! - Recording without an installed exporter is a no-op, so the facade is
//!   always safe to call
//! - Labels are low-cardinality: server name, status code, outcome

use std::net::SocketAddr;
use std::time::Instant;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Start the Prometheus scrape endpoint on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_request(server: &str, status: u16, start: Instant) {
    metrics::counter!(
        "gracehttp_requests_total",
        "server" => server.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    metrics::histogram!("gracehttp_request_duration_seconds", "server" => server.to_string())
        .record(start.elapsed().as_secs_f64());
}

/// `cache` names the tree the cache belongs to (routes or hooks).
pub fn record_cache_lookup(cache: &'static str, hit: bool) {
    let result = if hit { "hit" } else { "miss" };
    metrics::counter!("gracehttp_route_cache_total", "cache" => cache, "result" => result).increment(1);
}

/// `outcome` is one of `restarted`, `reloaded`, `failed`.
pub fn record_restart(outcome: &'static str) {
    metrics::counter!("gracehttp_restarts_total", "outcome" => outcome).increment(1);
}

pub fn listener_started() {
    metrics::gauge!("gracehttp_listeners_running").increment(1.0);
}

pub fn listener_stopped() {
    metrics::gauge!("gracehttp_listeners_running").decrement(1.0);
}
