//! Timed producer.
//!
//! Pushes a fixed number of labeled items to the left end of a list, one per
//! interval, then stops. Items are labeled with a decreasing counter
//! (`Item 10`, `Item 9`, ..., `Item 1`) so the consumed sequence can be
//! checked exactly.

use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::config::ConfigError;
use crate::metrics::MetricsCollector;
use crate::store::ListStore;

use super::stop::StopSignal;
use super::QueueError;

/// Default label prefix for produced items.
const DEFAULT_LABEL_PREFIX: &str = "Item";

/// Configuration for a producer run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerConfig {
    /// Number of items to push.
    pub count: u64,
    /// Delay between two pushes; the first push happens one interval in.
    pub interval: Duration,
    /// Text placed before the counter in each label.
    pub label_prefix: String,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self::new(10, Duration::from_millis(500))
    }
}

impl ProducerConfig {
    pub fn new(count: u64, interval: Duration) -> Self {
        Self {
            count,
            interval,
            label_prefix: DEFAULT_LABEL_PREFIX.to_string(),
        }
    }

    /// Sets the label prefix.
    pub fn with_label_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.label_prefix = prefix.into();
        self
    }

    /// Label of the item pushed while `remaining` items are left to push.
    pub fn label(&self, remaining: u64) -> String {
        format!("{} {}", self.label_prefix, remaining)
    }

    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` for a zero interval.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "producer interval must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Summary of a finished producer run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProduceReport {
    /// Queue the items were pushed to.
    pub queue: String,
    /// Number of items pushed.
    pub pushed: u64,
    /// Whether the stop signal ended the run before `count` was reached.
    pub stopped_early: bool,
}

/// Pushes labeled items to a queue at a fixed cadence.
pub struct Producer<S> {
    store: S,
    queue: String,
    config: ProducerConfig,
    stop: StopSignal,
    metrics: MetricsCollector,
}

impl<S: ListStore> Producer<S> {
    pub fn new(store: S, queue: impl Into<String>, config: ProducerConfig) -> Self {
        Self {
            store,
            queue: queue.into(),
            config,
            stop: StopSignal::never(),
            metrics: MetricsCollector::new(),
        }
    }

    /// Lets `stop` end the run between two pushes.
    pub fn with_stop_signal(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    /// Runs until `count` items are pushed or the stop signal is raised.
    ///
    /// # Errors
    ///
    /// - `QueueError::Config` if the configuration is invalid
    /// - `QueueError::PushFailed` on the first failed push; no further push
    ///   is attempted
    pub async fn run(mut self) -> Result<ProduceReport, QueueError> {
        self.config.validate()?;

        let interval = self.config.interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            queue = %self.queue,
            count = self.config.count,
            interval_ms = interval.as_millis() as u64,
            "Producer started"
        );

        let mut remaining = self.config.count;
        let mut pushed = 0u64;

        while remaining > 0 {
            tokio::select! {
                biased;
                _ = self.stop.raised() => {
                    info!(queue = %self.queue, pushed, remaining, "Producer received stop signal");
                    return Ok(self.report(pushed, true));
                }
                _ = ticker.tick() => {}
            }

            let label = self.config.label(remaining);
            debug!(queue = %self.queue, item = %label, "Pushing item");

            if let Err(source) = self.store.push_left(&self.queue, &label).await {
                error!(
                    queue = %self.queue,
                    item = %label,
                    pushed,
                    error = %source,
                    "Push failed, aborting producer"
                );
                return Err(QueueError::PushFailed {
                    item: label,
                    pushed,
                    source,
                });
            }

            self.metrics.record_produced(&self.queue);
            pushed += 1;
            remaining -= 1;
        }

        info!(queue = %self.queue, pushed, "No more items to push");
        Ok(self.report(pushed, false))
    }

    fn report(&self, pushed: u64, stopped_early: bool) -> ProduceReport {
        ProduceReport {
            queue: self.queue.clone(),
            pushed,
            stopped_early,
        }
    }
}

/// Pushes `count` items to `queue`, one per `interval`.
///
/// # Errors
///
/// See [`Producer::run`].
pub async fn produce<S: ListStore>(
    store: S,
    queue: &str,
    count: u64,
    interval: Duration,
) -> Result<ProduceReport, QueueError> {
    Producer::new(store, queue, ProducerConfig::new(count, interval))
        .run()
        .await
}
