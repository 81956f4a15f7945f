//! Metrics collection and export for Courier.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use anyhow::{Context, Result};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "courier_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "courier_connections_active";
    pub const MESSAGES_TOTAL: &str = "courier_messages_total";
    pub const MESSAGES_BYTES: &str = "courier_messages_bytes";
    pub const ROOMS_ACTIVE: &str = "courier_rooms_active";
    pub const DISPATCH_SECONDS: &str = "courier_dispatch_seconds";
    pub const DISPATCH_ERRORS_TOTAL: &str = "courier_dispatch_errors_total";
    pub const ERRORS_TOTAL: &str = "courier_errors_total";
    pub const BUS_PUBLISHED_TOTAL: &str = "courier_bus_published_total";
    pub const BUS_MESSAGES_TOTAL: &str = "courier_bus_messages_total";
    pub const BUS_RETRIES_TOTAL: &str = "courier_bus_retries_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    // Describe metrics
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of socket connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of joined socket connections"
    );
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Total number of socket frames processed");
    metrics::describe_counter!(names::MESSAGES_BYTES, "Total bytes of socket frames processed");
    metrics::describe_gauge!(names::ROOMS_ACTIVE, "Current number of rooms");
    metrics::describe_histogram!(
        names::DISPATCH_SECONDS,
        "Socket frame dispatch latency in seconds"
    );
    metrics::describe_counter!(
        names::DISPATCH_ERRORS_TOTAL,
        "Socket frames with at least one failed handler"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");
    metrics::describe_counter!(names::BUS_PUBLISHED_TOTAL, "Commands and events published");
    metrics::describe_counter!(names::BUS_MESSAGES_TOTAL, "Bus messages settled, by outcome");
    metrics::describe_counter!(names::BUS_RETRIES_TOTAL, "Bus handler retries");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a socket frame.
pub fn record_message(bytes: usize, direction: &'static str) {
    counter!(names::MESSAGES_TOTAL, "direction" => direction).increment(1);
    counter!(names::MESSAGES_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record dispatch latency.
pub fn record_dispatch(seconds: f64) {
    histogram!(names::DISPATCH_SECONDS).record(seconds);
}

/// Record a dispatch with failed handlers.
pub fn record_dispatch_error(topic: &str) {
    counter!(names::DISPATCH_ERRORS_TOTAL, "topic" => topic.to_string()).increment(1);
}

/// Update active room count.
pub fn set_active_rooms(count: usize) {
    gauge!(names::ROOMS_ACTIVE).set(count as f64);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}
