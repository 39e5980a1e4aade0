//! Runs a producer and a consumer side by side.
//!
//! The runner resolves the poll timeout through the topology policy, opens
//! the task pair on the given [`Connections`] and waits for both. When the
//! consumer waits indefinitely it is given an item budget equal to the
//! producer count, so it finishes once every item has been handled instead of
//! blocking forever on the last pop. If the producer is stopped before that
//! budget can be met, the consumer task is aborted while it waits on its own
//! connection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::{JoinError, JoinHandle};
use tracing::{error, info};

use crate::config::{ConfigError, QueueConfig};
use crate::store::{
    Item, ListStore, MemoryServer, MemoryStore, PollTimeout, RedisStore, StoreError,
};

use super::consumer::{ConsumeOutcome, ConsumeReport, Consumer, ItemHandler, LogHandler};
use super::producer::{ProduceReport, Producer};
use super::stop::StopSignal;
use super::topology::Topology;
use super::QueueError;

/// Store sessions for a producer/consumer pair.
#[derive(Clone)]
pub enum Connections<S> {
    /// Both sides issue commands on the same session.
    Shared(S),
    /// Each side owns a session.
    Dual { producer: S, consumer: S },
}

impl<S: Clone> Connections<S> {
    pub fn topology(&self) -> Topology {
        match self {
            Self::Shared(_) => Topology::Shared,
            Self::Dual { .. } => Topology::Dual,
        }
    }

    /// Returns the producer and consumer sessions.
    pub fn split(self) -> (S, S) {
        match self {
            Self::Shared(store) => (store.clone(), store),
            Self::Dual { producer, consumer } => (producer, consumer),
        }
    }
}

impl Connections<RedisStore> {
    /// Opens as many Redis sessions as `topology` needs.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::ConnectionFailed` if a session cannot be opened.
    pub async fn open_redis(redis_url: &str, topology: Topology) -> Result<Self, StoreError> {
        match topology {
            Topology::Shared => Ok(Self::Shared(RedisStore::connect(redis_url).await?)),
            Topology::Dual => Ok(Self::Dual {
                producer: RedisStore::connect(redis_url).await?,
                consumer: RedisStore::connect(redis_url).await?,
            }),
        }
    }
}

impl Connections<MemoryStore> {
    /// Opens as many sessions on `server` as `topology` needs.
    pub fn open_memory(server: &MemoryServer, topology: Topology) -> Self {
        match topology {
            Topology::Shared => Self::Shared(server.connect()),
            Topology::Dual => Self::Dual {
                producer: server.connect(),
                consumer: server.connect(),
            },
        }
    }
}

/// Combined result of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub topology: Topology,
    pub poll_timeout: PollTimeout,
    pub produced: ProduceReport,
    pub consumed: ConsumeReport,
}

impl RunReport {
    /// Whether every pushed item was consumed.
    pub fn is_complete(&self) -> bool {
        self.produced.pushed == self.consumed.items
    }
}

/// Wires a producer and a consumer over one or two connections.
pub struct Runner {
    config: QueueConfig,
    stop: StopSignal,
}

impl Runner {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            stop: StopSignal::never(),
        }
    }

    /// Stops both tasks when `stop` is raised.
    pub fn with_stop_signal(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Runs with the default logging handler.
    ///
    /// # Errors
    ///
    /// See [`Runner::run_with_handler`].
    pub async fn run<S>(&self, connections: Connections<S>) -> Result<RunReport, QueueError>
    where
        S: ListStore + Clone + 'static,
    {
        self.run_with_handler(connections, LogHandler).await
    }

    /// Runs producer and consumer until both finish.
    ///
    /// # Errors
    ///
    /// - `QueueError::Config` if the configuration is invalid or does not
    ///   match the topology of `connections`
    /// - the first error of either task; the other task is aborted
    pub async fn run_with_handler<S, H>(
        &self,
        connections: Connections<S>,
        handler: H,
    ) -> Result<RunReport, QueueError>
    where
        S: ListStore + Clone + 'static,
        H: ItemHandler + 'static,
    {
        self.config.validate()?;

        let topology = connections.topology();
        if topology != self.config.topology {
            return Err(ConfigError::ValidationFailed(format!(
                "configured topology {} does not match {} connections",
                self.config.topology, topology
            ))
            .into());
        }

        let poll_timeout = self.config.resolve_poll_timeout()?;
        let mut consumer_config = self.config.consumer_config(poll_timeout);
        if poll_timeout.is_indefinite() {
            consumer_config = consumer_config.with_max_items(self.config.count);
        }

        info!(
            topology = %topology,
            connections = topology.connections(),
            queue = %self.config.queue_name,
            poll_timeout = %poll_timeout,
            "Starting producer and consumer"
        );

        let (producer_store, consumer_store) = connections.split();

        let producer = Producer::new(
            producer_store,
            self.config.queue_name.clone(),
            self.config.producer_config(),
        )
        .with_stop_signal(self.stop.clone());

        let handled = Arc::new(AtomicU64::new(0));
        let consumer = Consumer::new(consumer_store, self.config.queue_name.clone(), consumer_config)
            .with_handler(Counted {
                inner: handler,
                handled: Arc::clone(&handled),
            })
            .with_stop_signal(self.stop.clone());

        let mut producer_task = tokio::spawn(producer.run());
        let mut consumer_task = tokio::spawn(consumer.run());

        let (produced, consumed) = tokio::select! {
            joined = &mut producer_task => {
                let produced = match flatten(joined) {
                    Ok(report) => report,
                    Err(e) => {
                        error!(error = %e, "Producer failed, aborting consumer");
                        consumer_task.abort();
                        return Err(e);
                    }
                };
                let consumed = if produced.stopped_early && poll_timeout.is_indefinite() {
                    self.abandon_consumer(consumer_task, &handled).await?
                } else {
                    flatten(consumer_task.await)?
                };
                (produced, consumed)
            }
            joined = &mut consumer_task => {
                let consumed = match flatten(joined) {
                    Ok(report) => report,
                    Err(e) => {
                        error!(error = %e, "Consumer failed, aborting producer");
                        producer_task.abort();
                        return Err(e);
                    }
                };
                (flatten(producer_task.await)?, consumed)
            }
        };

        let report = RunReport {
            topology,
            poll_timeout,
            produced,
            consumed,
        };

        info!(
            topology = %topology,
            produced = report.produced.pushed,
            consumed = report.consumed.items,
            misses = report.consumed.misses,
            outcome = %report.consumed.outcome,
            "Run finished"
        );

        Ok(report)
    }

    /// Ends a consumer left waiting indefinitely after the producer stopped.
    ///
    /// Its item budget can no longer be met and the pending pop only returns
    /// on a new item, so the task is aborted. The pop is on the consumer's own
    /// connection, which is dropped with the task.
    async fn abandon_consumer(
        &self,
        consumer_task: JoinHandle<Result<ConsumeReport, QueueError>>,
        handled: &AtomicU64,
    ) -> Result<ConsumeReport, QueueError> {
        if consumer_task.is_finished() {
            return flatten(consumer_task.await);
        }

        consumer_task.abort();
        match consumer_task.await {
            Err(e) if e.is_cancelled() => {
                let items = handled.load(Ordering::SeqCst);
                info!(
                    queue = %self.config.queue_name,
                    items,
                    "Producer stopped, abandoned the consumer's pending pop"
                );
                // An indefinite pop never misses; the last one was still pending
                Ok(ConsumeReport {
                    queue: self.config.queue_name.clone(),
                    outcome: ConsumeOutcome::Stopped,
                    items,
                    misses: 0,
                    polls: items + 1,
                })
            }
            joined => flatten(joined),
        }
    }
}

/// Counts items once the wrapped handler is done with them.
struct Counted<H> {
    inner: H,
    handled: Arc<AtomicU64>,
}

#[async_trait]
impl<H: ItemHandler> ItemHandler for Counted<H> {
    async fn handle(&self, queue: &str, item: Item) {
        self.inner.handle(queue, item).await;
        self.handled.fetch_add(1, Ordering::SeqCst);
    }
}

fn flatten<T>(joined: Result<Result<T, QueueError>, JoinError>) -> Result<T, QueueError> {
    joined.map_err(|e| QueueError::TaskFailed(e.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::StopHandle;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::time::Instant;

    /// Records each item with the time it was handled.
    #[derive(Clone)]
    struct Timeline {
        start: Instant,
        seen: Arc<Mutex<Vec<(String, Duration)>>>,
    }

    impl Timeline {
        fn new() -> Self {
            Self {
                start: Instant::now(),
                seen: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn items(&self) -> Vec<String> {
            self.seen
                .lock()
                .expect("lock")
                .iter()
                .map(|(item, _)| item.clone())
                .collect()
        }

        fn first_at(&self) -> Option<Duration> {
            self.seen.lock().expect("lock").first().map(|(_, at)| *at)
        }
    }

    #[async_trait]
    impl ItemHandler for Timeline {
        async fn handle(&self, _queue: &str, item: Item) {
            let at = self.start.elapsed();
            self.seen.lock().expect("lock").push((item.into_inner(), at));
        }
    }

    fn expected_labels(count: u64) -> Vec<String> {
        (1..=count).rev().map(|n| format!("Item {}", n)).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_connection_delivers_everything_late() {
        let server = MemoryServer::new();
        let config = QueueConfig::default()
            .with_topology(Topology::Shared)
            .with_poll_timeout(PollTimeout::from_millis(700));
        let timeline = Timeline::new();

        let report = Runner::new(config)
            .run_with_handler(
                Connections::open_memory(&server, Topology::Shared),
                timeline.clone(),
            )
            .await
            .expect("run should succeed");

        assert_eq!(report.topology, Topology::Shared);
        assert_eq!(report.produced.pushed, 10);
        assert_eq!(report.consumed.items, 10);
        assert!(report.is_complete());
        assert!(report.consumed.misses >= 1);
        assert_eq!(report.consumed.outcome, ConsumeOutcome::Exhausted);
        assert_eq!(timeline.items(), expected_labels(10));

        // The first pop misses the push queued behind it, then backs off
        let first = timeline.first_at().expect("an item was handled");
        assert!(first >= Duration::from_millis(2700));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dual_connections_deliver_promptly_and_drain() {
        let server = MemoryServer::new();
        let config = QueueConfig::default().with_topology(Topology::Dual);
        let timeline = Timeline::new();

        let report = Runner::new(config)
            .run_with_handler(
                Connections::open_memory(&server, Topology::Dual),
                timeline.clone(),
            )
            .await
            .expect("run should succeed");

        assert_eq!(report.poll_timeout, PollTimeout::Indefinite);
        assert_eq!(report.consumed.outcome, ConsumeOutcome::Drained);
        assert_eq!(report.consumed.misses, 0);
        assert_eq!(timeline.items(), expected_labels(10));

        let first = timeline.first_at().expect("an item was handled");
        assert!(first >= Duration::from_millis(500));
        assert!(first < Duration::from_millis(700));
    }

    #[tokio::test]
    async fn test_indefinite_poll_on_shared_connection_is_rejected() {
        let server = MemoryServer::new();
        let config = QueueConfig::default()
            .with_topology(Topology::Shared)
            .with_poll_timeout(PollTimeout::Indefinite);

        let result = Runner::new(config)
            .run(Connections::open_memory(&server, Topology::Shared))
            .await;

        assert!(matches!(
            result,
            Err(QueueError::Config(ConfigError::UnboundedSharedPoll(_)))
        ));
    }

    #[tokio::test]
    async fn test_topology_mismatch_is_rejected() {
        let server = MemoryServer::new();
        let config = QueueConfig::default().with_topology(Topology::Dual);

        let result = Runner::new(config)
            .run(Connections::open_memory(&server, Topology::Shared))
            .await;

        assert!(matches!(result, Err(QueueError::Config(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_store_fails_run() {
        let server = MemoryServer::new();
        let connections = Connections::open_memory(&server, Topology::Shared);
        server.shutdown();

        let result = Runner::new(QueueConfig::default()).run(connections).await;

        let err = result.expect_err("run should fail");
        assert!(err.is_transport());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_signal_ends_both_tasks() {
        let server = MemoryServer::new();
        let handle = StopHandle::new();
        let runner = Runner::new(QueueConfig::default().with_count(100))
            .with_stop_signal(handle.signal());

        let connections = Connections::open_memory(&server, Topology::Shared);
        let task = tokio::spawn(async move { runner.run(connections).await });

        tokio::time::sleep(Duration::from_secs(3)).await;
        handle.stop();

        let report = task.await.expect("task").expect("run");
        assert!(report.produced.stopped_early);
        assert_eq!(report.consumed.outcome, ConsumeOutcome::Stopped);
        assert!(report.produced.pushed < 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_signal_ends_dual_run() {
        let server = MemoryServer::new();
        let handle = StopHandle::new();
        let timeline = Timeline::new();
        let runner = Runner::new(QueueConfig::default().with_topology(Topology::Dual))
            .with_stop_signal(handle.signal());

        let connections = Connections::open_memory(&server, Topology::Dual);
        let handler = timeline.clone();
        let task =
            tokio::spawn(async move { runner.run_with_handler(connections, handler).await });

        // Pushes land at 500ms and 1000ms; the consumer then waits with no timeout
        tokio::time::sleep(Duration::from_millis(1200)).await;
        handle.stop();

        let report = tokio::time::timeout(Duration::from_secs(10), task)
            .await
            .expect("dual run should return after stop")
            .expect("task")
            .expect("run");

        assert!(report.produced.stopped_early);
        assert_eq!(report.produced.pushed, 2);
        assert_eq!(report.consumed.outcome, ConsumeOutcome::Stopped);
        assert_eq!(report.consumed.items, 2);
        assert_eq!(report.consumed.polls, 3);
        assert!(report.is_complete());
        assert_eq!(timeline.items(), vec!["Item 10", "Item 9"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_consumer_failure_aborts_producer() {
        let server = MemoryServer::new();
        let consumer_store = server.connect();
        let observer = server.connect();
        let connections = Connections::Dual {
            producer: server.connect(),
            consumer: consumer_store.clone(),
        };

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1200)).await;
            consumer_store.disconnect();
        });

        let timeline = Timeline::new();
        let result = Runner::new(QueueConfig::default().with_topology(Topology::Dual))
            .run_with_handler(connections, timeline.clone())
            .await;

        let err = result.expect_err("run should fail");
        assert!(err.is_transport());
        assert_eq!(timeline.items(), vec!["Item 10", "Item 9"]);

        // No push happens once the producer is aborted
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(observer.len("items").await.expect("len"), 0);
    }
}
