//! Cache-aside record lookup.
//!
//! Records are cached as hashes under `user:{id}`. A lookup reads the hash
//! first; on a miss it loads the record from a [`RecordSource`], writes it to
//! the cache with an expiry, and returns it. Once the expiry elapses the next
//! lookup goes back to the source.
//!
//! # Usage
//!
//! ```ignore
//! use blockq::cache::{JsonRecordSource, RecordCache};
//!
//! let source = JsonRecordSource::load("users.json").await?;
//! let cache = RecordCache::new(store, source);
//!
//! if let Some(lookup) = cache.get(123).await? {
//!     println!("{:?} from {}", lookup.record, lookup.origin);
//! }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::store::{Record, RecordStore, StoreError};

/// Default time a cached record lives.
pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

/// Default cache key prefix.
const DEFAULT_KEY_PREFIX: &str = "user";

/// Errors that can occur during cache operations.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The cache store failed.
    #[error("Cache store error: {0}")]
    Store(#[from] StoreError),

    /// Writing a loaded record to the cache added no field.
    #[error("Failed to save '{key}' in cache")]
    SaveFailed { key: String },

    /// The record source could not be read.
    #[error("Failed to read record source: {0}")]
    Io(#[from] std::io::Error),

    /// The record source is not valid JSON.
    #[error("Failed to parse record source: {0}")]
    Parse(#[from] serde_json::Error),

    /// The record source has an unexpected shape.
    #[error("Invalid record source: {0}")]
    InvalidSource(String),
}

/// Where a lookup found its record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupOrigin {
    /// Served from the cache.
    Cache,
    /// Loaded from the record source and cached.
    Source,
}

impl fmt::Display for LookupOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cache => write!(f, "cache"),
            Self::Source => write!(f, "source"),
        }
    }
}

/// A record returned by [`RecordCache::get`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheLookup {
    pub record: Record,
    pub origin: LookupOrigin,
}

/// Authoritative record lookup behind the cache.
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Finds the record with `id`.
    async fn find(&self, id: u64) -> Result<Option<Record>, CacheError>;
}

/// Records loaded from a JSON array of objects, each with a numeric `id`.
///
/// Field values are stored as strings: JSON strings verbatim, anything else
/// as its JSON text.
#[derive(Debug, Clone, Default)]
pub struct JsonRecordSource {
    records: HashMap<u64, Record>,
}

impl JsonRecordSource {
    /// Reads and parses the file at `path`.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Io` if the file cannot be read, or a parse error
    /// from [`JsonRecordSource::from_json`].
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await?;
        let source = Self::from_json(&content)?;
        debug!(path = %path.display(), records = source.len(), "Loaded record source");
        Ok(source)
    }

    /// Parses a JSON array of records.
    ///
    /// # Errors
    ///
    /// - `CacheError::Parse` if `json` is not valid JSON
    /// - `CacheError::InvalidSource` if it is not an array of objects with a
    ///   non-negative integer `id`
    pub fn from_json(json: &str) -> Result<Self, CacheError> {
        let value: Value = serde_json::from_str(json)?;
        let Value::Array(entries) = value else {
            return Err(CacheError::InvalidSource(
                "expected a JSON array".to_string(),
            ));
        };

        let mut records = HashMap::with_capacity(entries.len());
        for (index, entry) in entries.into_iter().enumerate() {
            let Value::Object(fields) = entry else {
                return Err(CacheError::InvalidSource(format!(
                    "entry {} is not an object",
                    index
                )));
            };

            let id = fields.get("id").and_then(Value::as_u64).ok_or_else(|| {
                CacheError::InvalidSource(format!("entry {} has no integer id", index))
            })?;

            let record = fields
                .into_iter()
                .map(|(field, value)| (field, field_text(value)))
                .collect();
            records.insert(id, record);
        }

        Ok(Self { records })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

fn field_text(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

#[async_trait]
impl RecordSource for JsonRecordSource {
    async fn find(&self, id: u64) -> Result<Option<Record>, CacheError> {
        let record = self.records.get(&id).cloned();
        match record {
            Some(_) => debug!(id, "Record exists in source"),
            None => debug!(id, "No record in source"),
        }
        Ok(record)
    }
}

/// Read-through cache over a [`RecordStore`].
pub struct RecordCache<S, R> {
    store: S,
    source: R,
    ttl: Duration,
    key_prefix: String,
}

impl<S: RecordStore, R: RecordSource> RecordCache<S, R> {
    /// Creates a cache with the default TTL and key prefix.
    ///
    /// # Arguments
    ///
    /// * `store` - Hash store holding cached records
    /// * `source` - Lookup used on cache misses
    pub fn new(store: S, source: R) -> Self {
        Self {
            store,
            source,
            ttl: DEFAULT_TTL,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
        }
    }

    /// Sets the record TTL. A zero TTL falls back to [`DEFAULT_TTL`].
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = if ttl.is_zero() { DEFAULT_TTL } else { ttl };
        self
    }

    /// Sets the record TTL in whole seconds. Non-positive values fall back
    /// to [`DEFAULT_TTL`].
    pub fn with_ttl_secs(self, secs: i64) -> Self {
        let ttl = u64::try_from(secs).map_or(Duration::ZERO, Duration::from_secs);
        self.with_ttl(ttl)
    }

    /// Sets the cache key prefix.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// The store holding cached records.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Cache key of the record with `id`.
    pub fn key(&self, id: u64) -> String {
        format!("{}:{}", self.key_prefix, id)
    }

    /// Looks up the record with `id`, loading and caching it on a miss.
    ///
    /// # Returns
    ///
    /// `None` if neither the cache nor the source has the record.
    ///
    /// # Errors
    ///
    /// - `CacheError::Store` if the cache store fails
    /// - `CacheError::SaveFailed` if a loaded record could not be cached
    /// - errors of the record source
    pub async fn get(&self, id: u64) -> Result<Option<CacheLookup>, CacheError> {
        let key = self.key(id);

        if let Some(record) = self.store.get_record(&key).await? {
            info!(key = %key, "Record found in cache");
            return Ok(Some(CacheLookup {
                record,
                origin: LookupOrigin::Cache,
            }));
        }
        info!(key = %key, "Record not found in cache");

        let Some(record) = self.source.find(id).await? else {
            info!(id, "No record exists");
            return Ok(None);
        };

        if !self.store.put_record(&key, &record, self.ttl).await? {
            warn!(key = %key, "Record not cached");
            return Err(CacheError::SaveFailed { key });
        }
        info!(key = %key, ttl_secs = self.ttl.as_secs(), "Record cached");

        Ok(Some(CacheLookup {
            record,
            origin: LookupOrigin::Source,
        }))
    }
}
