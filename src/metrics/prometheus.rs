//! Prometheus metrics registration and export.

use prometheus::{CounterVec, Encoder, GaugeVec, HistogramVec, Opts, Registry, TextEncoder};
use std::sync::{Mutex, OnceLock, PoisonError};

/// Global Prometheus registry for all blockq metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Items pushed by producers, labeled by queue.
pub static ITEMS_PRODUCED_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Items popped and handled by consumers, labeled by queue.
pub static ITEMS_CONSUMED_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Blocking pops that timed out without an item, labeled by queue.
pub static POLL_MISSES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Time spent inside blocking pops in seconds, labeled by queue and result.
pub static POLL_WAIT: OnceLock<HistogramVec> = OnceLock::new();

/// Finished consumer loops, labeled by outcome.
pub static CONSUMER_RUNS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Last observed list length, labeled by queue.
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Serializes initialization so every metric lands in the same registry.
static INIT_LOCK: Mutex<()> = Mutex::new(());

/// Initialize all metrics and register them with the registry.
///
/// Calling this more than once keeps the metrics from the first call.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let _guard = INIT_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    let items_produced = CounterVec::new(
        Opts::new("blockq_items_produced_total", "Items pushed by producers"),
        &["queue"],
    )?;

    let items_consumed = CounterVec::new(
        Opts::new("blockq_items_consumed_total", "Items handled by consumers"),
        &["queue"],
    )?;

    let poll_misses = CounterVec::new(
        Opts::new(
            "blockq_poll_misses_total",
            "Blocking pops that timed out without an item",
        ),
        &["queue"],
    )?;

    let poll_wait = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "blockq_poll_wait_seconds",
            "Time spent inside blocking pops",
        )
        .buckets(vec![0.001, 0.01, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 30.0]),
        &["queue", "result"],
    )?;

    let consumer_runs = CounterVec::new(
        Opts::new("blockq_consumer_runs_total", "Finished consumer loops"),
        &["outcome"],
    )?;

    let queue_depth = GaugeVec::new(
        Opts::new("blockq_queue_depth", "Last observed list length"),
        &["queue"],
    )?;

    registry.register(Box::new(items_produced.clone()))?;
    registry.register(Box::new(items_consumed.clone()))?;
    registry.register(Box::new(poll_misses.clone()))?;
    registry.register(Box::new(poll_wait.clone()))?;
    registry.register(Box::new(consumer_runs.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;

    let _ = ITEMS_PRODUCED_TOTAL.set(items_produced);
    let _ = ITEMS_CONSUMED_TOTAL.set(items_consumed);
    let _ = POLL_MISSES_TOTAL.set(poll_misses);
    let _ = POLL_WAIT.set(poll_wait);
    let _ = CONSUMER_RUNS_TOTAL.set(consumer_runs);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = REGISTRY.set(registry);

    tracing::debug!("Prometheus metrics initialized");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns a comment line instead when the registry is not initialized or
/// encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
