//! Blocking consumer with a miss/backoff policy.
//!
//! The consumer repeatedly issues a blocking pop with a short timeout:
//!
//! ```text
//!   Polling ──item──▶ ItemFound ──(miss_count = 0)──▶ Polling
//!      │
//!      └──timeout──▶ Miss ──(miss_count < max_miss)──▶ backoff ──▶ Polling
//!                      │
//!                      └──(miss_count == max_miss)──▶ Exhausted (stop)
//! ```
//!
//! Only consecutive misses count; any item resets the counter. A miss is not
//! proof that the queue is empty: on a shared connection a push can be held
//! back behind the pending pop and only show up on the next poll.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::config::ConfigError;
use crate::metrics::MetricsCollector;
use crate::store::{Item, ListStore, PollTimeout};

use super::stop::StopSignal;
use super::QueueError;

/// Default blocking pop timeout.
const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(700);

/// Default wait after a miss.
const DEFAULT_BACKOFF_DELAY: Duration = Duration::from_secs(2);

/// Default number of consecutive misses tolerated.
const DEFAULT_MAX_MISS: u32 = 3;

/// Configuration for a consumer run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerConfig {
    /// How long each blocking pop may wait.
    pub poll_timeout: PollTimeout,
    /// Wait after a miss before polling again.
    pub backoff_delay: Duration,
    /// Consecutive misses tolerated; the next one ends the run.
    pub max_miss: u32,
    /// Stop after handling this many items, before polling again.
    pub max_items: Option<u64>,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self::new(PollTimeout::Bounded(DEFAULT_POLL_TIMEOUT))
    }
}

impl ConsumerConfig {
    pub fn new(poll_timeout: PollTimeout) -> Self {
        Self {
            poll_timeout,
            backoff_delay: DEFAULT_BACKOFF_DELAY,
            max_miss: DEFAULT_MAX_MISS,
            max_items: None,
        }
    }

    /// Sets the backoff delay.
    pub fn with_backoff_delay(mut self, delay: Duration) -> Self {
        self.backoff_delay = delay;
        self
    }

    /// Sets the miss budget.
    pub fn with_max_miss(mut self, max_miss: u32) -> Self {
        self.max_miss = max_miss;
        self
    }

    /// Sets the item budget.
    pub fn with_max_items(mut self, max_items: u64) -> Self {
        self.max_items = Some(max_items);
        self
    }

    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` for a bounded zero timeout,
    /// which the store would read as an indefinite wait.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if matches!(self.poll_timeout, PollTimeout::Bounded(d) if d.is_zero()) {
            return Err(ConfigError::ValidationFailed(
                "bounded poll timeout must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Why a consumer loop ended. All variants are normal completions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// The miss budget ran out: no more work is expected.
    Exhausted,
    /// The item budget was reached.
    Drained,
    /// The stop signal was raised.
    Stopped,
}

impl ConsumeOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exhausted => "exhausted",
            Self::Drained => "drained",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for ConsumeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Summary of a finished consumer run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumeReport {
    pub queue: String,
    pub outcome: ConsumeOutcome,
    /// Items popped and handled.
    pub items: u64,
    /// Blocking pops that timed out.
    pub misses: u64,
    /// Blocking pops issued.
    pub polls: u64,
}

/// What to do after a miss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissDecision {
    /// Wait this long, then poll again.
    Backoff(Duration),
    /// Give up: the miss budget is spent.
    Exhausted,
}

/// Miss bookkeeping for one consumer run.
#[derive(Debug, Clone)]
pub struct ConsumerSession {
    miss_count: u32,
    max_miss: u32,
    backoff_delay: Duration,
}

impl ConsumerSession {
    pub fn new(config: &ConsumerConfig) -> Self {
        Self {
            miss_count: 0,
            max_miss: config.max_miss,
            backoff_delay: config.backoff_delay,
        }
    }

    /// Consecutive misses so far.
    pub fn miss_count(&self) -> u32 {
        self.miss_count
    }

    /// An item was popped.
    pub fn record_item(&mut self) {
        self.miss_count = 0;
    }

    /// A pop timed out.
    pub fn record_miss(&mut self) -> MissDecision {
        if self.miss_count == self.max_miss {
            return MissDecision::Exhausted;
        }
        self.miss_count += 1;
        MissDecision::Backoff(self.backoff_delay)
    }
}

/// Processes popped items.
#[async_trait]
pub trait ItemHandler: Send + Sync {
    async fn handle(&self, queue: &str, item: Item);
}

/// Logs every item.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogHandler;

#[async_trait]
impl ItemHandler for LogHandler {
    async fn handle(&self, queue: &str, item: Item) {
        info!(queue = %queue, item = %item, "Next item");
    }
}

/// Pops items from a queue until the miss budget runs out.
pub struct Consumer<S, H = LogHandler> {
    store: S,
    queue: String,
    config: ConsumerConfig,
    handler: H,
    stop: StopSignal,
    metrics: MetricsCollector,
}

impl<S: ListStore> Consumer<S, LogHandler> {
    pub fn new(store: S, queue: impl Into<String>, config: ConsumerConfig) -> Self {
        Self {
            store,
            queue: queue.into(),
            config,
            handler: LogHandler,
            stop: StopSignal::never(),
            metrics: MetricsCollector::new(),
        }
    }
}

impl<S: ListStore, H: ItemHandler> Consumer<S, H> {
    /// Replaces the item handler.
    pub fn with_handler<H2: ItemHandler>(self, handler: H2) -> Consumer<S, H2> {
        Consumer {
            store: self.store,
            queue: self.queue,
            config: self.config,
            handler,
            stop: self.stop,
            metrics: self.metrics,
        }
    }

    /// Lets `stop` end the run at the top of an iteration or during a backoff.
    pub fn with_stop_signal(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    /// Runs the consumer loop.
    ///
    /// # Errors
    ///
    /// - `QueueError::Config` if the configuration is invalid
    /// - `QueueError::Transport` if a blocking pop fails; the loop is not
    ///   restarted
    pub async fn run(mut self) -> Result<ConsumeReport, QueueError> {
        self.config.validate()?;

        let mut session = ConsumerSession::new(&self.config);
        let mut items = 0u64;
        let mut misses = 0u64;
        let mut polls = 0u64;

        info!(
            queue = %self.queue,
            poll_timeout = %self.config.poll_timeout,
            backoff_ms = self.config.backoff_delay.as_millis() as u64,
            max_miss = self.config.max_miss,
            "Consumer started"
        );

        let outcome = loop {
            if self.stop.is_raised() {
                info!(queue = %self.queue, "Consumer received stop signal");
                break ConsumeOutcome::Stopped;
            }

            if self.config.max_items.is_some_and(|max| items >= max) {
                break ConsumeOutcome::Drained;
            }

            debug!(queue = %self.queue, "Waiting for next item");
            polls += 1;
            let started = Instant::now();

            let popped = match self
                .store
                .blocking_pop_right(&self.queue, self.config.poll_timeout)
                .await
            {
                Ok(popped) => popped,
                Err(e) => {
                    error!(queue = %self.queue, error = %e, "Blocking pop failed");
                    self.metrics.record_outcome("failed");
                    return Err(QueueError::Transport(e));
                }
            };
            let waited = started.elapsed().as_secs_f64();

            match popped {
                Some(item) => {
                    session.record_item();
                    items += 1;
                    self.metrics.record_consumed(&self.queue, waited);
                    self.handler.handle(&self.queue, item).await;
                }
                None => {
                    misses += 1;
                    self.metrics.record_miss(&self.queue, waited);

                    match session.record_miss() {
                        MissDecision::Exhausted => {
                            info!(
                                queue = %self.queue,
                                max_miss = self.config.max_miss,
                                "Miss budget exhausted, no more work expected"
                            );
                            break ConsumeOutcome::Exhausted;
                        }
                        MissDecision::Backoff(delay) => {
                            info!(
                                queue = %self.queue,
                                miss_count = session.miss_count(),
                                max_miss = self.config.max_miss,
                                backoff_ms = delay.as_millis() as u64,
                                "Poll timed out"
                            );
                            tokio::select! {
                                biased;
                                _ = self.stop.raised() => {
                                    info!(queue = %self.queue, "Consumer stopped during backoff");
                                    break ConsumeOutcome::Stopped;
                                }
                                _ = tokio::time::sleep(delay) => {}
                            }
                        }
                    }
                }
            }
        };

        self.metrics.record_outcome(outcome.as_str());
        info!(
            queue = %self.queue,
            outcome = %outcome,
            items,
            misses,
            polls,
            "Consumer finished"
        );

        Ok(ConsumeReport {
            queue: self.queue,
            outcome,
            items,
            misses,
            polls,
        })
    }
}

/// Consumes `queue` with the default backoff until `max_miss` is exceeded.
///
/// # Errors
///
/// See [`Consumer::run`].
pub async fn consume<S: ListStore>(
    store: S,
    queue: &str,
    poll_timeout: PollTimeout,
    max_miss: u32,
) -> Result<ConsumeReport, QueueError> {
    let config = ConsumerConfig::new(poll_timeout).with_max_miss(max_miss);
    Consumer::new(store, queue, config).run().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::StopHandle;
    use crate::store::{MemoryServer, MemoryStore, StoreError};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Mutex};

    const POLL: Duration = Duration::from_millis(700);

    #[derive(Clone, Default)]
    struct Collect(Arc<Mutex<Vec<String>>>);

    impl Collect {
        fn items(&self) -> Vec<String> {
            self.0.lock().expect("lock").clone()
        }
    }

    #[async_trait]
    impl ItemHandler for Collect {
        async fn handle(&self, _queue: &str, item: Item) {
            self.0.lock().expect("lock").push(item.into_inner());
        }
    }

    /// Answers blocking pops from a fixed script; an exhausted script misses.
    #[derive(Clone, Default)]
    struct ScriptedStore {
        script: Arc<Mutex<VecDeque<Option<&'static str>>>>,
        polls: Arc<AtomicU64>,
    }

    impl ScriptedStore {
        fn new(script: &[Option<&'static str>]) -> Self {
            Self {
                script: Arc::new(Mutex::new(script.iter().copied().collect())),
                polls: Arc::new(AtomicU64::new(0)),
            }
        }

        fn polls(&self) -> u64 {
            self.polls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ListStore for ScriptedStore {
        async fn push_left(&self, _key: &str, _value: &str) -> Result<(), StoreError> {
            Ok(())
        }

        async fn pop_left(&self, _key: &str) -> Result<Option<Item>, StoreError> {
            Ok(None)
        }

        async fn pop_right(&self, _key: &str) -> Result<Option<Item>, StoreError> {
            Ok(None)
        }

        async fn blocking_pop_left(
            &self,
            key: &str,
            timeout: PollTimeout,
        ) -> Result<Option<Item>, StoreError> {
            self.blocking_pop_right(key, timeout).await
        }

        async fn blocking_pop_right(
            &self,
            _key: &str,
            _timeout: PollTimeout,
        ) -> Result<Option<Item>, StoreError> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            let next = self.script.lock().expect("lock").pop_front().flatten();
            Ok(next.map(Item::from))
        }

        async fn delete_key(&self, _key: &str) -> Result<(), StoreError> {
            Ok(())
        }

        async fn len(&self, _key: &str) -> Result<usize, StoreError> {
            Ok(0)
        }
    }

    fn config(max_miss: u32) -> ConsumerConfig {
        ConsumerConfig::new(PollTimeout::Bounded(POLL))
            .with_backoff_delay(Duration::from_secs(2))
            .with_max_miss(max_miss)
    }

    #[test]
    fn test_session_counts_consecutive_misses() {
        let mut session = ConsumerSession::new(&config(2));

        assert_eq!(
            session.record_miss(),
            MissDecision::Backoff(Duration::from_secs(2))
        );
        assert_eq!(session.miss_count(), 1);

        session.record_item();
        assert_eq!(session.miss_count(), 0);

        assert!(matches!(session.record_miss(), MissDecision::Backoff(_)));
        assert!(matches!(session.record_miss(), MissDecision::Backoff(_)));
        assert_eq!(session.record_miss(), MissDecision::Exhausted);
        assert_eq!(session.miss_count(), 2);
    }

    #[test]
    fn test_zero_max_miss_exhausts_on_first_miss() {
        let mut session = ConsumerSession::new(&config(0));
        assert_eq!(session.record_miss(), MissDecision::Exhausted);
    }

    #[test]
    fn test_outcome_labels() {
        assert_eq!(ConsumeOutcome::Exhausted.to_string(), "exhausted");
        assert_eq!(ConsumeOutcome::Drained.as_str(), "drained");
        assert_eq!(ConsumeOutcome::Stopped.as_str(), "stopped");
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_queue_exhausts_after_max_miss_plus_one_polls() {
        let store = MemoryStore::new();

        let report = consume(store.clone(), "items", PollTimeout::Bounded(POLL), 3)
            .await
            .expect("consume should succeed");

        assert_eq!(report.outcome, ConsumeOutcome::Exhausted);
        assert_eq!(report.polls, 4);
        assert_eq!(report.misses, 4);
        assert_eq!(report.items, 0);
        assert_eq!(store.blocking_pops(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_item_resets_miss_count() {
        let store = ScriptedStore::new(&[None, None, Some("Item 1")]);
        let handler = Collect::default();

        let report = Consumer::new(store.clone(), "items", config(3))
            .with_handler(handler.clone())
            .run()
            .await
            .expect("consume should succeed");

        // 2 misses, 1 item, then 3 tolerated misses and the one that ends it
        assert_eq!(report.outcome, ConsumeOutcome::Exhausted);
        assert_eq!(store.polls(), 7);
        assert_eq!(report.polls, 7);
        assert_eq!(report.misses, 6);
        assert_eq!(handler.items(), vec!["Item 1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_is_applied_between_misses() {
        let store = ScriptedStore::new(&[]);
        let start = Instant::now();

        let report = Consumer::new(store, "items", config(2))
            .run()
            .await
            .expect("consume should succeed");

        // The scripted store answers instantly, so only backoffs take time
        assert_eq!(report.polls, 3);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(4));
        assert!(elapsed < Duration::from_millis(4100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pushed_sequence_is_consumed_in_order() {
        let store = MemoryStore::new();
        let labels: Vec<String> = (1..=10).rev().map(|n| format!("Item {}", n)).collect();
        for label in &labels {
            store.push_left("items", label).await.expect("push");
        }

        let handler = Collect::default();
        let report = Consumer::new(store, "items", config(0))
            .with_handler(handler.clone())
            .run()
            .await
            .expect("consume should succeed");

        assert_eq!(handler.items(), labels);
        assert_eq!(report.items, 10);
        assert_eq!(report.misses, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_item_budget_drains_without_extra_poll() {
        let store = MemoryStore::new();
        for n in 1..=3 {
            store
                .push_left("items", &format!("Item {}", n))
                .await
                .expect("push");
        }

        let report = Consumer::new(
            store.clone(),
            "items",
            ConsumerConfig::new(PollTimeout::Indefinite).with_max_items(2),
        )
        .run()
        .await
        .expect("consume should succeed");

        assert_eq!(report.outcome, ConsumeOutcome::Drained);
        assert_eq!(report.items, 2);
        assert_eq!(store.blocking_pops(), 2);
        assert_eq!(store.len("items").await.expect("len"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_item_budget_drains_immediately() {
        let store = MemoryStore::new();
        let report = Consumer::new(
            store.clone(),
            "items",
            ConsumerConfig::new(PollTimeout::Indefinite).with_max_items(0),
        )
        .run()
        .await
        .expect("consume should succeed");

        assert_eq!(report.outcome, ConsumeOutcome::Drained);
        assert_eq!(report.polls, 0);
        assert_eq!(store.blocking_pops(), 0);
    }

    #[tokio::test]
    async fn test_bounded_zero_timeout_is_rejected() {
        let result = Consumer::new(
            MemoryStore::new(),
            "items",
            ConsumerConfig::new(PollTimeout::Bounded(Duration::ZERO)),
        )
        .run()
        .await;
        assert!(matches!(result, Err(QueueError::Config(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_signal_checked_before_polling() {
        let store = MemoryStore::new();
        let handle = StopHandle::new();
        handle.stop();

        let report = Consumer::new(store.clone(), "items", config(3))
            .with_stop_signal(handle.signal())
            .run()
            .await
            .expect("consume should succeed");

        assert_eq!(report.outcome, ConsumeOutcome::Stopped);
        assert_eq!(store.blocking_pops(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_signal_interrupts_backoff() {
        let store = MemoryStore::new();
        let handle = StopHandle::new();

        let consumer = Consumer::new(store.clone(), "items", config(3))
            .with_stop_signal(handle.signal());
        let task = tokio::spawn(consumer.run());

        // First pop times out at 700ms, backoff runs until 2700ms
        tokio::time::sleep(Duration::from_millis(1000)).await;
        handle.stop();

        let report = task.await.expect("task").expect("run");
        assert_eq!(report.outcome, ConsumeOutcome::Stopped);
        assert_eq!(report.polls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_error_after_items_is_fatal() {
        let store = MemoryStore::new();
        for n in 1..=2 {
            store
                .push_left("items", &format!("Item {}", n))
                .await
                .expect("push");
        }

        // Both items are taken at once; the session closes during the first backoff
        let closer = store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1000)).await;
            closer.disconnect();
        });

        let handler = Collect::default();
        let result = Consumer::new(store.clone(), "items", config(3))
            .with_handler(handler.clone())
            .run()
            .await;

        assert!(matches!(
            result,
            Err(QueueError::Transport(StoreError::Closed))
        ));
        assert_eq!(handler.items(), vec!["Item 1", "Item 2"]);
        assert_eq!(store.blocking_pops(), 4);
    }

    #[tokio::test]
    async fn test_transport_error_is_fatal() {
        let server = MemoryServer::new();
        let store = server.connect();
        server.shutdown();

        let result = consume(store.clone(), "items", PollTimeout::Bounded(POLL), 3).await;

        assert!(matches!(
            result,
            Err(QueueError::Transport(StoreError::Closed))
        ));
        assert_eq!(store.blocking_pops(), 1);
    }
}
