//! Metrics collection and exposition.
//!
//! # Metrics
//! - `stackserve_requests_total` (counter): finished requests by status
//! - `stackserve_request_duration_seconds` (histogram): arrival to finish
//! - `stackserve_active_connections` (gauge): open client connections
//! - `stackserve_async_tasks_in_flight` (gauge): unfinished background tasks
//! - `stackserve_gate_denials_total` (counter): rejections by gate name
//!
//! # Design Decisions
//! - Facade macros everywhere; the Prometheus exporter is installed only
//!   when enabled in config

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Install the Prometheus recorder and its scrape endpoint on `addr`.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

pub fn record_request(status: u16, received_at: Instant) {
    counter!("stackserve_requests_total", "status" => status.to_string()).increment(1);
    histogram!("stackserve_request_duration_seconds").record(received_at.elapsed().as_secs_f64());
}

pub fn set_active_connections(count: u64) {
    gauge!("stackserve_active_connections").set(count as f64);
}

pub fn set_async_tasks_in_flight(count: usize) {
    gauge!("stackserve_async_tasks_in_flight").set(count as f64);
}

pub fn record_gate_denial(gate: &'static str) {
    counter!("stackserve_gate_denials_total", "gate" => gate).increment(1);
}
