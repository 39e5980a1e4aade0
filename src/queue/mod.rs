//! Blocking work queue over an ordered-list store.
//!
//! A [`Producer`] appends labeled items to the left end of a list at a fixed
//! cadence. A [`Consumer`] removes them from the right end with a blocking pop
//! and a bounded wait, backing off after each empty poll and finishing once a
//! number of consecutive misses is exceeded. [`topology`] decides whether the
//! two share one connection and which poll timeouts are acceptable for that.
//! [`Runner`] wires everything together.

pub mod consumer;
pub mod list;
pub mod producer;
pub mod runner;
pub mod stop;
pub mod topology;

pub use consumer::{
    consume, ConsumeOutcome, ConsumeReport, Consumer, ConsumerConfig, ConsumerSession,
    ItemHandler, LogHandler, MissDecision,
};
pub use producer::{produce, ProduceReport, Producer, ProducerConfig};
pub use runner::{Connections, RunReport, Runner};
pub use stop::{StopHandle, StopSignal};
pub use topology::{ConnectionRole, TimeoutCheck, Topology, TopologyPolicy};

use thiserror::Error;

use crate::config::ConfigError;
use crate::store::StoreError;

/// Errors that can occur while producing or consuming.
#[derive(Debug, Error)]
pub enum QueueError {
    /// A store command failed; the loop that issued it stopped.
    #[error("Store transport failed: {0}")]
    Transport(#[from] StoreError),

    /// A push failed; nothing after it was pushed.
    #[error("Failed to push '{item}' after {pushed} items: {source}")]
    PushFailed {
        item: String,
        pushed: u64,
        #[source]
        source: StoreError,
    },

    /// The run configuration was rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A producer or consumer task panicked or was cancelled.
    #[error("Task failed: {0}")]
    TaskFailed(String),
}

impl QueueError {
    /// Whether the error came from the store rather than from configuration.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::PushFailed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_failure_is_transport() {
        let err = QueueError::PushFailed {
            item: "Item 3".to_string(),
            pushed: 2,
            source: StoreError::Closed,
        };
        assert!(err.is_transport());
        assert!(err.to_string().contains("Item 3"));
        assert!(QueueError::Transport(StoreError::Closed).is_transport());
    }

    #[test]
    fn test_config_error_is_not_transport() {
        let err = QueueError::from(ConfigError::ValidationFailed("bad".to_string()));
        assert!(!err.is_transport());
        assert!(!QueueError::TaskFailed("panicked".to_string()).is_transport());
    }
}
