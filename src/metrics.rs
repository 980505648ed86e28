// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for the payload mesh.
//!
//! Uses the `metrics` crate for backend-agnostic collection. The host process
//! chooses the exporter (Prometheus, OTEL, etc.).
//!
//! # Metric Naming Convention
//! - `payload_mesh_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `cache`: cache name
//! - `layer`: local, remote
//! - `operation`: get, save, remove, query, ...
//! - `status` / `outcome`: success, error, or a protocol outcome

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record a store operation
pub fn record_operation(cache: &str, layer: &str, operation: &str, status: &str) {
    counter!(
        "payload_mesh_operations_total",
        "cache" => cache.to_string(),
        "layer" => layer.to_string(),
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record store operation latency
pub fn record_latency(cache: &str, layer: &str, operation: &str, duration: Duration) {
    histogram!(
        "payload_mesh_operation_seconds",
        "cache" => cache.to_string(),
        "layer" => layer.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Set the number of payloads resident in a cache
pub fn set_cached_items(cache: &str, count: usize) {
    gauge!(
        "payload_mesh_cached_items",
        "cache" => cache.to_string()
    )
    .set(count as f64);
}

/// Set the number of live controllers in a cache
pub fn set_controllers(cache: &str, count: usize) {
    gauge!(
        "payload_mesh_controllers",
        "cache" => cache.to_string()
    )
    .set(count as f64);
}

/// Record a durable load performed by a controller
pub fn record_load(cache: &str, source: &str) {
    counter!(
        "payload_mesh_loads_total",
        "cache" => cache.to_string(),
        "source" => source.to_string()
    )
    .increment(1);
}

/// Record an update notification, sent or received
pub fn record_update_message(cache: &str, direction: &str, outcome: &str) {
    counter!(
        "payload_mesh_update_messages_total",
        "cache" => cache.to_string(),
        "direction" => direction.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a handoff outcome
pub fn record_handoff(cache: &str, outcome: &str) {
    counter!(
        "payload_mesh_handoffs_total",
        "cache" => cache.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record handoff wait latency
pub fn record_handoff_latency(cache: &str, duration: Duration) {
    histogram!(
        "payload_mesh_handoff_seconds",
        "cache" => cache.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Set the number of sibling nodes considered online
pub fn set_nodes_online(count: usize) {
    gauge!("payload_mesh_nodes_online").set(count as f64);
}

/// Record a node lifecycle message
pub fn record_node_message(kind: &str) {
    counter!(
        "payload_mesh_node_messages_total",
        "kind" => kind.to_string()
    )
    .increment(1);
}

/// Record an error reported through a sink
pub fn record_error(scope: &str, error_type: &str) {
    counter!(
        "payload_mesh_errors_total",
        "scope" => scope.to_string(),
        "error_type" => error_type.to_string()
    )
    .increment(1);
}

/// Record the failure count of a save-all pass
pub fn record_save_failures(cache: &str, failures: usize) {
    counter!(
        "payload_mesh_save_failures_total",
        "cache" => cache.to_string()
    )
    .increment(failures as u64);
}

/// Record a lifecycle transition
pub fn set_cache_state(cache: &str, state: &str) {
    counter!(
        "payload_mesh_state_transitions_total",
        "cache" => cache.to_string(),
        "state" => state.to_string()
    )
    .increment(1);
}

/// Guard that records latency on drop.
pub struct LatencyTimer {
    cache: String,
    layer: &'static str,
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    pub fn new(cache: &str, layer: &'static str, operation: &'static str) -> Self {
        Self {
            cache: cache.to_string(),
            layer,
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(&self.cache, self.layer, self.operation, self.start.elapsed());
    }
}
