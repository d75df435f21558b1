//! Client observability metrics
//!
//! Provides Prometheus-compatible metrics for routing and remote operations:
//! - Operation duration and errors per kind and target node
//! - Topology updates applied or ignored
//! - Retries by cause
//! - Fan-out batch counts
//! - Channel release and discard counts
//! - Scan duplicates filtered

use std::time::{Duration, Instant};

/// Record operation duration
pub fn record_operation_duration(op: &str, target_node: &str, duration: Duration) {
    metrics::histogram!(
        "hotrod_operation_duration_seconds",
        "op" => op.to_string(),
        "target_node" => target_node.to_string(),
    )
    .record(duration.as_secs_f64());
}

/// Record operation success
pub fn record_operation_success(op: &str, target_node: &str) {
    metrics::counter!(
        "hotrod_operations_total",
        "op" => op.to_string(),
        "target_node" => target_node.to_string(),
        "status" => "ok",
    )
    .increment(1);
}

/// Record operation error
pub fn record_operation_error(op: &str, target_node: &str, error_type: &str) {
    metrics::counter!(
        "hotrod_operations_total",
        "op" => op.to_string(),
        "target_node" => target_node.to_string(),
        "status" => "error",
    )
    .increment(1);

    metrics::counter!(
        "hotrod_operation_errors_total",
        "op" => op.to_string(),
        "error_type" => error_type.to_string(),
    )
    .increment(1);
}

/// Record a topology update offered to the registry
pub fn record_topology_update(cache: &str, epoch: i32, applied: bool) {
    let outcome = if applied { "applied" } else { "ignored" };
    metrics::counter!(
        "hotrod_topology_updates_total",
        "cache" => cache.to_string(),
        "outcome" => outcome,
    )
    .increment(1);

    if applied {
        metrics::gauge!("hotrod_topology_epoch", "cache" => cache.to_string()).set(epoch as f64);
    }
}

/// Record a retry of a logical call
pub fn record_retry(op: &str, cause: &str) {
    metrics::counter!(
        "hotrod_retries_total",
        "op" => op.to_string(),
        "cause" => cause.to_string(),
    )
    .increment(1);
}

/// Record the number of sub-batches a bulk call was split into
pub fn record_fanout_batches(op: &str, batches: usize) {
    metrics::histogram!("hotrod_fanout_batches", "op" => op.to_string()).record(batches as f64);
}

/// Record a channel returned to the pool
pub fn record_channel_released(target_node: &str) {
    metrics::counter!(
        "hotrod_channels_returned_total",
        "target_node" => target_node.to_string(),
        "outcome" => "released",
    )
    .increment(1);
}

/// Record a channel dropped from the pool
pub fn record_channel_discarded(target_node: &str, reason: &str) {
    metrics::counter!(
        "hotrod_channels_returned_total",
        "target_node" => target_node.to_string(),
        "outcome" => "discarded",
    )
    .increment(1);

    metrics::counter!(
        "hotrod_channels_discarded_total",
        "reason" => reason.to_string(),
    )
    .increment(1);
}

/// Record an operation abandoned at its deadline
pub fn record_abandoned(op: &str) {
    metrics::counter!("hotrod_operations_abandoned_total", "op" => op.to_string()).increment(1);
}

/// Record scan entries dropped as already delivered
pub fn record_scan_duplicates(count: usize) {
    metrics::counter!("hotrod_scan_duplicates_filtered_total").increment(count as u64);
}

/// Timer helper for measuring operation duration
pub struct OperationTimer {
    start: Instant,
    op: String,
    target_node: String,
}

impl OperationTimer {
    /// Start a new timer
    pub fn new(op: &str, target_node: &str) -> Self {
        Self {
            start: Instant::now(),
            op: op.to_string(),
            target_node: target_node.to_string(),
        }
    }

    /// Record success and duration
    pub fn success(self) {
        let duration = self.start.elapsed();
        record_operation_duration(&self.op, &self.target_node, duration);
        record_operation_success(&self.op, &self.target_node);
    }

    /// Record error and duration
    pub fn error(self, error_type: &str) {
        let duration = self.start.elapsed();
        record_operation_duration(&self.op, &self.target_node, duration);
        record_operation_error(&self.op, &self.target_node, error_type);
    }
}
