//! Metrics collection and export.
//!
//! Uses the `metrics` crate for instrumentation and exports to Prometheus
//! format when enabled in the configuration.

use metrics::{counter, gauge};
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "ember_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "ember_connections_active";
    pub const EVENTS_TOTAL: &str = "ember_events_total";
    pub const EVENTS_DROPPED: &str = "ember_events_dropped_total";
    pub const PLUGIN_ERRORS: &str = "ember_plugin_errors_total";
    pub const STORE_ERRORS: &str = "ember_store_errors_total";
    pub const HISTORY_LEN: &str = "ember_history_events";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of websocket connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of registered clients across all rooms"
    );
    metrics::describe_counter!(
        names::EVENTS_TOTAL,
        "Total number of events entering the pipeline, by kind"
    );
    metrics::describe_counter!(
        names::EVENTS_DROPPED,
        "Events denied delivery by a failing filter"
    );
    metrics::describe_counter!(names::PLUGIN_ERRORS, "Plugin RPC failures, by plugin");
    metrics::describe_counter!(names::STORE_ERRORS, "Durable store failures");
    metrics::describe_gauge!(names::HISTORY_LEN, "Events currently held in history rings");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the exporter cannot bind.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{port}").parse()?;

    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

pub fn record_events(kind: &str, count: usize) {
    counter!(names::EVENTS_TOTAL, "kind" => kind.to_string()).increment(count as u64);
}

pub fn record_plugin_error(plugin: &str) {
    counter!(names::PLUGIN_ERRORS, "plugin" => plugin.to_string()).increment(1);
}

pub fn record_store_error() {
    counter!(names::STORE_ERRORS).increment(1);
}

pub fn set_history_len(len: usize) {
    gauge!(names::HISTORY_LEN).set(len as f64);
}
