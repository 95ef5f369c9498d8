//! Metrics collection and export for Chatwire.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use chatwire_core::{CallState, Delivery};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "chatwire_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "chatwire_connections_active";
    pub const EVENTS_TOTAL: &str = "chatwire_events_total";
    pub const EVENTS_BYTES: &str = "chatwire_events_bytes";
    pub const EVENTS_DROPPED: &str = "chatwire_events_dropped_total";
    pub const EVICTIONS_TOTAL: &str = "chatwire_evictions_total";
    pub const ROOMS_ACTIVE: &str = "chatwire_rooms_active";
    pub const CALLS_TOTAL: &str = "chatwire_calls_total";
    pub const STORE_ERRORS_TOTAL: &str = "chatwire_store_errors_total";
    pub const LATENCY_SECONDS: &str = "chatwire_latency_seconds";
    pub const ERRORS_TOTAL: &str = "chatwire_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(names::EVENTS_TOTAL, "Frames and events by direction");
    metrics::describe_counter!(names::EVENTS_BYTES, "Bytes of frames by direction");
    metrics::describe_counter!(
        names::EVENTS_DROPPED,
        "Events dropped on full outbound queues"
    );
    metrics::describe_counter!(
        names::EVICTIONS_TOTAL,
        "Connections closed for outbound queue overflow"
    );
    metrics::describe_gauge!(names::ROOMS_ACTIVE, "Rooms with at least one member");
    metrics::describe_counter!(names::CALLS_TOTAL, "Finished calls by outcome");
    metrics::describe_counter!(names::STORE_ERRORS_TOTAL, "Failed store writes");
    metrics::describe_histogram!(
        names::LATENCY_SECONDS,
        "Inbound frame handling latency in seconds"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

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

/// Record a frame crossing the socket.
pub fn record_frame(bytes: usize, direction: &'static str) {
    counter!(names::EVENTS_TOTAL, "direction" => direction).increment(1);
    counter!(names::EVENTS_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record the result of a fan-out.
pub fn record_fanout(delivery: Delivery) {
    counter!(names::EVENTS_TOTAL, "direction" => "fanout").increment(delivery.delivered as u64);
    if delivery.dropped > 0 {
        counter!(names::EVENTS_DROPPED).increment(delivery.dropped as u64);
    }
}

/// Record a connection evicted for overflowing its queue.
pub fn record_eviction() {
    counter!(names::EVICTIONS_TOTAL).increment(1);
}

/// Record inbound frame latency.
pub fn record_latency(seconds: f64) {
    histogram!(names::LATENCY_SECONDS).record(seconds);
}

/// Update active room count.
pub fn set_active_rooms(count: usize) {
    gauge!(names::ROOMS_ACTIVE).set(count as f64);
}

/// Record a call reaching a terminal state.
pub fn record_call(state: CallState) {
    let outcome = match state {
        CallState::Ended => "ended",
        CallState::Declined => "declined",
        CallState::Missed => "missed",
        CallState::Ringing | CallState::Active => "live",
    };
    counter!(names::CALLS_TOTAL, "outcome" => outcome).increment(1);
}

/// Record a failed store write.
pub fn record_store_error(operation: &'static str) {
    counter!(names::STORE_ERRORS_TOTAL, "operation" => operation).increment(1);
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

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}
