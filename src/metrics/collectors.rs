//! Recording helpers over the raw Prometheus metrics.
//!
//! Every method is a no-op until [`init_metrics`](super::init_metrics) has
//! been called, so library code can record unconditionally.

use super::prometheus::{
    CONSUMER_RUNS_TOTAL, ITEMS_CONSUMED_TOTAL, ITEMS_PRODUCED_TOTAL, POLL_MISSES_TOTAL,
    POLL_WAIT, QUEUE_DEPTH,
};

/// Metrics collector for producer and consumer loops.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    /// Create a new MetricsCollector instance.
    pub fn new() -> Self {
        Self
    }

    /// Record one item pushed to `queue`.
    pub fn record_produced(&self, queue: &str) {
        if let Some(produced) = ITEMS_PRODUCED_TOTAL.get() {
            produced.with_label_values(&[queue]).inc();
        }
    }

    /// Record one item popped from `queue`, after waiting `wait_secs` in the pop.
    pub fn record_consumed(&self, queue: &str, wait_secs: f64) {
        if let Some(consumed) = ITEMS_CONSUMED_TOTAL.get() {
            consumed.with_label_values(&[queue]).inc();
        }

        if let Some(poll_wait) = POLL_WAIT.get() {
            poll_wait
                .with_label_values(&[queue, "item"])
                .observe(wait_secs);
        }

        tracing::trace!(queue = queue, wait_secs = wait_secs, "Recorded consumed item");
    }

    /// Record one blocking pop on `queue` that timed out after `wait_secs`.
    pub fn record_miss(&self, queue: &str, wait_secs: f64) {
        if let Some(misses) = POLL_MISSES_TOTAL.get() {
            misses.with_label_values(&[queue]).inc();
        }

        if let Some(poll_wait) = POLL_WAIT.get() {
            poll_wait
                .with_label_values(&[queue, "miss"])
                .observe(wait_secs);
        }

        tracing::trace!(queue = queue, wait_secs = wait_secs, "Recorded poll miss");
    }

    /// Record how a consumer loop ended ("exhausted", "drained", "stopped", "failed").
    pub fn record_outcome(&self, outcome: &str) {
        if let Some(runs) = CONSUMER_RUNS_TOTAL.get() {
            runs.with_label_values(&[outcome]).inc();
        }
    }

    /// Update the observed length of `queue`.
    pub fn update_queue_depth(&self, queue: &str, depth: usize) {
        if let Some(queue_depth) = QUEUE_DEPTH.get() {
            queue_depth.with_label_values(&[queue]).set(depth as f64);
        }
    }
}
