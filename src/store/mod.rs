//! Ordered-list store sessions.
//!
//! A store session is one logical connection to a list store. Commands issued
//! on the same session are executed one after another by the transport, so a
//! blocking pop that is waiting for data holds the session until it returns.
//! Cloning a session handle shares the connection; opening a second session
//! gives an independent one.
//!
//! Two implementations are provided:
//!
//! - [`RedisStore`]: a Redis connection (`LPUSH`, `BLPOP`, `BRPOP`, ...)
//! - [`MemoryStore`]: an in-process store with the same serialization rules,
//!   used for tests and for running the demos without a server

pub mod memory;
pub mod redis;

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use self::memory::{MemoryServer, MemoryStore};
pub use self::redis::RedisStore;

/// Errors raised by a store session.
///
/// Every variant is a transport failure: an empty list is never an error.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Failed to open the connection.
    #[error("Store connection failed: {0}")]
    ConnectionFailed(String),

    /// Redis command failed.
    #[error("Redis operation failed: {0}")]
    Redis(#[from] ::redis::RedisError),

    /// The session or the server it belongs to has been closed.
    #[error("Store connection closed")]
    Closed,
}

/// An opaque payload stored in a list.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Item(String);

impl Item {
    /// Creates an item from its payload.
    pub fn new(payload: impl Into<String>) -> Self {
        Self(payload.into())
    }

    /// Returns the payload.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consumes the item and returns the payload.
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for Item {
    fn from(payload: String) -> Self {
        Self(payload)
    }
}

impl From<&str> for Item {
    fn from(payload: &str) -> Self {
        Self(payload.to_string())
    }
}

/// How long a blocking pop may wait for an item.
///
/// On the wire a timeout of `0` means "wait forever"; a zero
/// [`PollTimeout::Bounded`] is therefore the same as
/// [`PollTimeout::Indefinite`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollTimeout {
    /// Block until an item arrives.
    Indefinite,
    /// Block for at most the given duration.
    Bounded(Duration),
}

impl PollTimeout {
    /// Builds a timeout from milliseconds, `0` meaning indefinite.
    pub fn from_millis(millis: u64) -> Self {
        Self::from(Duration::from_millis(millis))
    }

    /// Returns the bounded wait, or `None` when the pop waits forever.
    pub fn duration(&self) -> Option<Duration> {
        match self {
            Self::Bounded(d) if !d.is_zero() => Some(*d),
            _ => None,
        }
    }

    /// Returns whether the pop waits forever.
    pub fn is_indefinite(&self) -> bool {
        self.duration().is_none()
    }

    /// Timeout argument for `BLPOP`/`BRPOP`, in fractional seconds.
    pub fn as_wire_secs(&self) -> f64 {
        self.duration().map_or(0.0, |d| d.as_secs_f64())
    }
}

impl From<Duration> for PollTimeout {
    fn from(d: Duration) -> Self {
        if d.is_zero() {
            Self::Indefinite
        } else {
            Self::Bounded(d)
        }
    }
}

impl fmt::Display for PollTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.duration() {
            Some(d) => write!(f, "{}ms", d.as_millis()),
            None => f.write_str("indefinite"),
        }
    }
}

/// List commands of a store session.
#[async_trait]
pub trait ListStore: Send + Sync {
    /// Prepends `value` to the list at `key`, creating it if needed.
    async fn push_left(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Removes and returns the leftmost item, if any.
    async fn pop_left(&self, key: &str) -> Result<Option<Item>, StoreError>;

    /// Removes and returns the rightmost item, if any.
    async fn pop_right(&self, key: &str) -> Result<Option<Item>, StoreError>;

    /// Removes the leftmost item, waiting up to `timeout` for one to appear.
    ///
    /// Returns `Ok(None)` exactly when the timeout elapses with no item.
    async fn blocking_pop_left(
        &self,
        key: &str,
        timeout: PollTimeout,
    ) -> Result<Option<Item>, StoreError>;

    /// Removes the rightmost item, waiting up to `timeout` for one to appear.
    ///
    /// Returns `Ok(None)` exactly when the timeout elapses with no item.
    async fn blocking_pop_right(
        &self,
        key: &str,
        timeout: PollTimeout,
    ) -> Result<Option<Item>, StoreError>;

    /// Deletes `key`. Deleting an absent key is not an error.
    async fn delete_key(&self, key: &str) -> Result<(), StoreError>;

    /// Returns the length of the list at `key` (0 when absent).
    async fn len(&self, key: &str) -> Result<usize, StoreError>;
}

/// A flat field/value record, stored as a hash.
pub type Record = BTreeMap<String, String>;

/// Hash commands used by the record cache.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Reads the hash at `key`; an absent or empty hash yields `None`.
    async fn get_record(&self, key: &str) -> Result<Option<Record>, StoreError>;

    /// Writes `record` at `key` and expires it after `ttl`.
    ///
    /// Returns whether any new field was added. The expiry is only set when
    /// the write added fields.
    async fn put_record(&self, key: &str, record: &Record, ttl: Duration)
        -> Result<bool, StoreError>;
}

/// Plain string key/value commands.
#[async_trait]
pub trait ValueStore: Send + Sync {
    /// Sets `key` to `value`.
    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Reads `key`.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_timeout_zero_is_indefinite() {
        assert!(PollTimeout::from_millis(0).is_indefinite());
        assert!(PollTimeout::Bounded(Duration::ZERO).is_indefinite());
        assert_eq!(PollTimeout::Bounded(Duration::ZERO).as_wire_secs(), 0.0);
        assert_eq!(PollTimeout::Indefinite.to_string(), "indefinite");
    }

    #[test]
    fn test_poll_timeout_bounded() {
        let timeout = PollTimeout::from_millis(700);
        assert_eq!(timeout.duration(), Some(Duration::from_millis(700)));
        assert!((timeout.as_wire_secs() - 0.7).abs() < f64::EPSILON);
        assert_eq!(timeout.to_string(), "700ms");
    }

    #[test]
    fn test_item_is_transparent() {
        let item = Item::new("Item 3");
        assert_eq!(item.to_string(), "Item 3");
        assert_eq!(
            serde_json::to_string(&item).expect("item should serialize"),
            "\"Item 3\""
        );
        assert_eq!(item.into_inner(), "Item 3");
    }

    #[test]
    fn test_store_error_display() {
        let err = StoreError::ConnectionFailed("refused".to_string());
        assert!(err.to_string().contains("refused"));
        assert!(StoreError::Closed.to_string().contains("closed"));
    }
}
