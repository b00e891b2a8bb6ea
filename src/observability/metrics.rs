//! Metrics collection and exposition.
//!
//! # Metrics
//! - `operator_source_events_total` (counter): control-plane events by kind, operation, outcome
//! - `operator_conversions_total` (counter): fetched resources by kind, outcome
//! - `operator_diff_resources` (histogram): put/delete set sizes by category
//! - `operator_writes_total` (counter): data-plane writes by category, operation, outcome
//! - `operator_commit_duration_seconds` (histogram): commit latency by target type, outcome
//! - `operator_commit_retries_total` / `operator_commit_dropped_total` (counters)
//! - `operator_replica_resources` (gauge): cached data-plane resources
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade and never blocks
//! - Without an installed recorder every call is a no-op

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder and its scrape endpoint.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint started"),
        Err(e) => tracing::error!(error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_source_event(kind: &str, operation: &'static str, outcome: &'static str) {
    counter!(
        "operator_source_events_total",
        "kind" => kind.to_string(),
        "operation" => operation,
        "outcome" => outcome
    )
    .increment(1);
}

pub fn record_conversion(kind: &'static str, outcome: &'static str) {
    counter!("operator_conversions_total", "kind" => kind, "outcome" => outcome).increment(1);
}

pub fn record_diff(category: &'static str, puts: usize, deletes: usize) {
    histogram!("operator_diff_resources", "category" => category, "action" => "put")
        .record(puts as f64);
    histogram!("operator_diff_resources", "category" => category, "action" => "delete")
        .record(deletes as f64);
}

pub fn record_write(category: &'static str, operation: &'static str, success: bool) {
    let outcome = if success { "success" } else { "fail" };
    counter!(
        "operator_writes_total",
        "category" => category,
        "operation" => operation,
        "outcome" => outcome
    )
    .increment(1);
}

pub fn record_commit(target_type: &'static str, success: bool, start: Instant) {
    let outcome = if success { "success" } else { "fail" };
    histogram!(
        "operator_commit_duration_seconds",
        "target" => target_type,
        "outcome" => outcome
    )
    .record(start.elapsed().as_secs_f64());
}

pub fn record_retry(target_type: &'static str) {
    counter!("operator_commit_retries_total", "target" => target_type).increment(1);
}

pub fn record_dropped(target_type: &'static str) {
    counter!("operator_commit_dropped_total", "target" => target_type).increment(1);
}

pub fn record_replica_size(size: usize) {
    gauge!("operator_replica_resources").set(size as f64);
}
