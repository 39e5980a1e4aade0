//! blockq: a blocking work queue over a Redis list.
//!
//! Producers push items to the left end of a list at a fixed cadence;
//! consumers drain the right end with a bounded blocking pop, back off after
//! empty polls and stop once too many polls in a row come back empty. The
//! connection topology policy decides whether both sides may share one
//! connection and which poll timeouts are safe for that.

pub mod cache;
pub mod cli;
pub mod config;
pub mod metrics;
pub mod queue;
pub mod store;

// Re-export commonly used types
pub use cache::{CacheError, RecordCache};
pub use config::{ConfigError, QueueConfig};
pub use queue::{
    ConsumeOutcome, ConsumeReport, Consumer, ConsumerConfig, ProduceReport, Producer,
    ProducerConfig, QueueError, RunReport, Runner, Topology,
};
pub use store::{Item, ListStore, MemoryStore, PollTimeout, RedisStore, StoreError};
