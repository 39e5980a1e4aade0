//! Queue configuration.
//!
//! Settings for a producer/consumer run: which Redis server and list to use,
//! how many items to produce and how fast, and how the consumer waits. Values
//! come from defaults, then `BLOCKQ_*` environment variables, then CLI flags.

use std::time::Duration;

use thiserror::Error;

use crate::queue::topology::{Topology, TopologyPolicy};
use crate::queue::{ConsumerConfig, ProducerConfig};
use crate::store::PollTimeout;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// A shared connection cannot serve an indefinite blocking pop.
    #[error("Poll timeout must be bounded on a shared connection, got {0}")]
    UnboundedSharedPoll(PollTimeout),

    /// Strict mode: the poll timeout would hide pushes on a shared connection.
    #[error(
        "Poll timeout {poll_timeout:?} must be shorter than the producer interval {interval:?} on a shared connection"
    )]
    SharedPollTooLong {
        poll_timeout: Duration,
        interval: Duration,
    },
}

/// Configuration for a producer/consumer run.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Redis connection URL.
    pub redis_url: String,
    /// Name of the list used as the queue.
    pub queue_name: String,
    /// Number of items the producer pushes.
    pub count: u64,
    /// Delay between two pushes.
    pub interval: Duration,
    /// Blocking pop timeout; derived from the topology when `None`.
    pub poll_timeout: Option<PollTimeout>,
    /// Wait after a miss before polling again.
    pub backoff_delay: Duration,
    /// Consecutive misses tolerated before the consumer gives up.
    pub max_miss: u32,
    /// Whether producer and consumer share one connection.
    pub topology: Topology,
    /// Reject, instead of warn about, shared poll timeouts that reach the
    /// producer interval.
    pub strict_topology: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            queue_name: "items".to_string(),
            count: 10,
            interval: Duration::from_millis(500),
            poll_timeout: None,
            backoff_delay: Duration::from_secs(2),
            max_miss: 3,
            topology: Topology::Shared,
            strict_topology: false,
        }
    }
}

impl QueueConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `BLOCKQ_REDIS_URL`: Redis URL (default: redis://localhost:6379)
    /// - `BLOCKQ_QUEUE`: List name (default: items)
    /// - `BLOCKQ_COUNT`: Items to produce (default: 10)
    /// - `BLOCKQ_INTERVAL_MS`: Producer interval (default: 500)
    /// - `BLOCKQ_POLL_TIMEOUT_MS`: Blocking pop timeout, 0 = wait forever
    ///   (default: derived from the topology)
    /// - `BLOCKQ_BACKOFF_MS`: Wait after a miss (default: 2000)
    /// - `BLOCKQ_MAX_MISS`: Consecutive misses tolerated (default: 3)
    /// - `BLOCKQ_TOPOLOGY`: `shared` or `dual` (default: shared)
    /// - `BLOCKQ_STRICT_TOPOLOGY`: Reject risky shared timeouts (default: false)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value or the
    /// resulting configuration does not validate.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the environment like [`from_env`](Self::from_env) but leaves
    /// validation to the caller, so overrides can be applied first.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if a variable cannot be parsed.
    pub fn read_env() -> Result<Self, ConfigError> {
        Self::read_lookup(|key| std::env::var(key).ok())
    }

    /// Creates configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let config = Self::read_lookup(lookup)?;
        config.validate()?;
        Ok(config)
    }

    fn read_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(val) = lookup("BLOCKQ_REDIS_URL") {
            config.redis_url = val;
        }

        if let Some(val) = lookup("BLOCKQ_QUEUE") {
            config.queue_name = val;
        }

        if let Some(val) = lookup("BLOCKQ_COUNT") {
            config.count = parse_env_value(&val, "BLOCKQ_COUNT")?;
        }

        if let Some(val) = lookup("BLOCKQ_INTERVAL_MS") {
            let millis: u64 = parse_env_value(&val, "BLOCKQ_INTERVAL_MS")?;
            config.interval = Duration::from_millis(millis);
        }

        if let Some(val) = lookup("BLOCKQ_POLL_TIMEOUT_MS") {
            let millis: u64 = parse_env_value(&val, "BLOCKQ_POLL_TIMEOUT_MS")?;
            config.poll_timeout = Some(PollTimeout::from_millis(millis));
        }

        if let Some(val) = lookup("BLOCKQ_BACKOFF_MS") {
            let millis: u64 = parse_env_value(&val, "BLOCKQ_BACKOFF_MS")?;
            config.backoff_delay = Duration::from_millis(millis);
        }

        if let Some(val) = lookup("BLOCKQ_MAX_MISS") {
            config.max_miss = parse_env_value(&val, "BLOCKQ_MAX_MISS")?;
        }

        if let Some(val) = lookup("BLOCKQ_TOPOLOGY") {
            config.topology = parse_env_value(&val, "BLOCKQ_TOPOLOGY")?;
        }

        if let Some(val) = lookup("BLOCKQ_STRICT_TOPOLOGY") {
            config.strict_topology = parse_env_bool(&val, "BLOCKQ_STRICT_TOPOLOGY")?;
        }

        Ok(config)
    }

    /// Validates the configuration values, including the topology policy.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if any value is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_name.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "queue_name cannot be empty".to_string(),
            ));
        }

        if self.redis_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "redis_url cannot be empty".to_string(),
            ));
        }

        self.producer_config().validate()?;
        self.resolve_poll_timeout()?;

        Ok(())
    }

    /// Topology policy for this configuration.
    pub fn policy(&self) -> TopologyPolicy {
        TopologyPolicy::new(self.topology).with_strict(self.strict_topology)
    }

    /// Poll timeout to use: the configured one, or the topology default.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the topology policy rejects the timeout.
    pub fn resolve_poll_timeout(&self) -> Result<PollTimeout, ConfigError> {
        self.policy().resolve(self.poll_timeout, self.interval)
    }

    /// Producer settings.
    pub fn producer_config(&self) -> ProducerConfig {
        ProducerConfig::new(self.count, self.interval)
    }

    /// Consumer settings for the given poll timeout.
    pub fn consumer_config(&self, poll_timeout: PollTimeout) -> ConsumerConfig {
        ConsumerConfig::new(poll_timeout)
            .with_backoff_delay(self.backoff_delay)
            .with_max_miss(self.max_miss)
    }

    /// Sets the Redis URL.
    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    /// Sets the queue name.
    pub fn with_queue_name(mut self, name: impl Into<String>) -> Self {
        self.queue_name = name.into();
        self
    }

    /// Sets the number of items to produce.
    pub fn with_count(mut self, count: u64) -> Self {
        self.count = count;
        self
    }

    /// Sets the producer interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Sets an explicit poll timeout.
    pub fn with_poll_timeout(mut self, timeout: PollTimeout) -> Self {
        self.poll_timeout = Some(timeout);
        self
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

    /// Sets the connection topology.
    pub fn with_topology(mut self, topology: Topology) -> Self {
        self.topology = topology;
        self
    }

    /// Enables or disables strict topology checks.
    pub fn with_strict_topology(mut self, strict: bool) -> Self {
        self.strict_topology = strict;
        self
    }
}

/// Parse an environment variable value.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable as a boolean.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = QueueConfig::default();
        assert_eq!(config.redis_url, "redis://localhost:6379");
        assert_eq!(config.queue_name, "items");
        assert_eq!(config.count, 10);
        assert_eq!(config.interval, Duration::from_millis(500));
        assert_eq!(config.poll_timeout, None);
        assert_eq!(config.backoff_delay, Duration::from_secs(2));
        assert_eq!(config.max_miss, 3);
        assert_eq!(config.topology, Topology::Shared);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = QueueConfig::new()
            .with_redis_url("redis://custom:6380")
            .with_queue_name("tasks")
            .with_count(5)
            .with_interval(Duration::from_secs(1))
            .with_poll_timeout(PollTimeout::Indefinite)
            .with_backoff_delay(Duration::from_secs(3))
            .with_max_miss(1)
            .with_topology(Topology::Dual);

        assert_eq!(config.redis_url, "redis://custom:6380");
        assert_eq!(config.queue_name, "tasks");
        assert_eq!(config.count, 5);
        assert_eq!(config.poll_timeout, Some(PollTimeout::Indefinite));
        assert_eq!(config.resolve_poll_timeout().ok(), Some(PollTimeout::Indefinite));
    }

    #[test]
    fn test_from_lookup_reads_all_variables() {
        let config = QueueConfig::from_lookup(lookup_from(&[
            ("BLOCKQ_REDIS_URL", "redis://queue-host:6379"),
            ("BLOCKQ_QUEUE", "tasks"),
            ("BLOCKQ_COUNT", "20"),
            ("BLOCKQ_INTERVAL_MS", "250"),
            ("BLOCKQ_POLL_TIMEOUT_MS", "0"),
            ("BLOCKQ_BACKOFF_MS", "1000"),
            ("BLOCKQ_MAX_MISS", "5"),
            ("BLOCKQ_TOPOLOGY", "dual"),
            ("BLOCKQ_STRICT_TOPOLOGY", "yes"),
        ]))
        .expect("config should load");

        assert_eq!(config.redis_url, "redis://queue-host:6379");
        assert_eq!(config.queue_name, "tasks");
        assert_eq!(config.count, 20);
        assert_eq!(config.interval, Duration::from_millis(250));
        assert_eq!(config.poll_timeout, Some(PollTimeout::Indefinite));
        assert_eq!(config.backoff_delay, Duration::from_secs(1));
        assert_eq!(config.max_miss, 5);
        assert_eq!(config.topology, Topology::Dual);
        assert!(config.strict_topology);
    }

    #[test]
    fn test_from_lookup_rejects_bad_number() {
        let result = QueueConfig::from_lookup(lookup_from(&[("BLOCKQ_COUNT", "ten")]));
        match result {
            Err(ConfigError::InvalidValue { key, .. }) => assert_eq!(key, "BLOCKQ_COUNT"),
            other => panic!("expected InvalidValue, got {:?}", other),
        }
    }

    #[test]
    fn test_from_lookup_rejects_indefinite_shared_poll() {
        let result = QueueConfig::from_lookup(lookup_from(&[
            ("BLOCKQ_TOPOLOGY", "shared"),
            ("BLOCKQ_POLL_TIMEOUT_MS", "0"),
        ]));
        assert!(matches!(result, Err(ConfigError::UnboundedSharedPoll(_))));
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let config = QueueConfig::new().with_interval(Duration::ZERO);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationFailed(_))
        ));
    }

    #[test]
    fn test_validate_rejects_empty_queue_name() {
        let config = QueueConfig::new().with_queue_name("");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_strict_topology_rejects_long_shared_poll() {
        let config = QueueConfig::new()
            .with_poll_timeout(PollTimeout::from_millis(700))
            .with_strict_topology(true);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::SharedPollTooLong { .. })
        ));

        // Lenient mode only warns
        assert!(config.with_strict_topology(false).validate().is_ok());
    }

    #[test]
    fn test_consumer_config_carries_miss_policy() {
        let config = QueueConfig::new()
            .with_backoff_delay(Duration::from_millis(1500))
            .with_max_miss(7);
        let consumer = config.consumer_config(PollTimeout::from_millis(100));

        assert_eq!(consumer.poll_timeout, PollTimeout::from_millis(100));
        assert_eq!(consumer.backoff_delay, Duration::from_millis(1500));
        assert_eq!(consumer.max_miss, 7);
        assert_eq!(consumer.max_items, None);
    }
}
