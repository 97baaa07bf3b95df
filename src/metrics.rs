// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation.
//!
//! Uses the `metrics` crate for backend-agnostic collection; the embedding
//! application chooses the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `medsync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `operation`: create, update, delete, read, write, refresh
//! - `status`: enqueued, done, retried, abandoned, requeued, ...
//! - `outcome`: completed, transient, permanent, auth, unreachable

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record a cache-level operation and its status.
pub fn record_cache_op(operation: &str, status: &str) {
    counter!(
        "medsync_cache_operations_total",
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record a queue item transition.
pub fn record_queue_op(operation: &str, status: &str) {
    counter!(
        "medsync_queue_items_total",
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record one remote call made by the reconciler.
pub fn record_remote_call(operation: &str, outcome: &str) {
    counter!(
        "medsync_remote_calls_total",
        "operation" => operation.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a completed drain cycle and how long it took.
pub fn record_drain(duration: Duration) {
    counter!("medsync_drains_total").increment(1);
    histogram!("medsync_drain_seconds").record(duration.as_secs_f64());
}

/// Update queue depth gauges (call after each drain or enqueue burst).
pub fn set_queue_depth(pending: usize, abandoned: usize) {
    gauge!("medsync_queue_pending").set(pending as f64);
    gauge!("medsync_queue_abandoned").set(abandoned as f64);
}

/// Record that the store fell back to memory-only operation.
pub fn record_degraded_start() {
    counter!("medsync_degraded_starts_total").increment(1);
}

/// Record an orphan repaired (or discarded) at startup reconciliation.
pub fn record_orphan(action: &str) {
    counter!(
        "medsync_orphans_total",
        "action" => action.to_string()
    )
    .increment(1);
}
