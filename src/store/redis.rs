//! Redis-backed store session.
//!
//! A [`RedisStore`] wraps a [`ConnectionManager`], which multiplexes every
//! command over one TCP connection and reconnects automatically. Clones share
//! that connection, so a `BLPOP` issued through one clone delays every other
//! command issued through any clone until it returns. Use
//! [`RedisStore::connect`] twice to get two independent sessions.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::debug;

use super::{Item, ListStore, PollTimeout, Record, RecordStore, StoreError, ValueStore};

/// A Redis connection implementing the store traits.
#[derive(Clone)]
pub struct RedisStore {
    /// Redis connection manager (handles reconnection automatically).
    redis: ConnectionManager,
}

impl RedisStore {
    /// Opens a new session to the server at `redis_url`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::ConnectionFailed` if the URL is invalid or the
    /// server cannot be reached.
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        debug!(url = %redis_url, "Opened Redis session");

        Ok(Self { redis })
    }

    async fn blocking_pop(
        &self,
        command: &str,
        key: &str,
        timeout: PollTimeout,
    ) -> Result<Option<Item>, StoreError> {
        let mut conn = self.redis.clone();

        // Replies with [key, value] or nil once the timeout elapses
        let reply: Option<(String, String)> = redis::cmd(command)
            .arg(key)
            .arg(timeout.as_wire_secs())
            .query_async(&mut conn)
            .await?;

        Ok(reply.map(|(_, value)| Item::from(value)))
    }

    async fn pop(&self, command: &str, key: &str) -> Result<Option<Item>, StoreError> {
        let mut conn = self.redis.clone();
        let value: Option<String> = redis::cmd(command).arg(key).query_async(&mut conn).await?;
        Ok(value.map(Item::from))
    }
}

#[async_trait]
impl ListStore for RedisStore {
    async fn push_left(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        conn.lpush::<_, _, ()>(key, value).await?;
        Ok(())
    }

    async fn pop_left(&self, key: &str) -> Result<Option<Item>, StoreError> {
        self.pop("LPOP", key).await
    }

    async fn pop_right(&self, key: &str) -> Result<Option<Item>, StoreError> {
        self.pop("RPOP", key).await
    }

    async fn blocking_pop_left(
        &self,
        key: &str,
        timeout: PollTimeout,
    ) -> Result<Option<Item>, StoreError> {
        self.blocking_pop("BLPOP", key, timeout).await
    }

    async fn blocking_pop_right(
        &self,
        key: &str,
        timeout: PollTimeout,
    ) -> Result<Option<Item>, StoreError> {
        self.blocking_pop("BRPOP", key, timeout).await
    }

    async fn delete_key(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn len(&self, key: &str) -> Result<usize, StoreError> {
        let mut conn = self.redis.clone();
        let len: usize = conn.llen(key).await?;
        Ok(len)
    }
}

#[async_trait]
impl RecordStore for RedisStore {
    async fn get_record(&self, key: &str) -> Result<Option<Record>, StoreError> {
        let mut conn = self.redis.clone();
        let record: Record = conn.hgetall(key).await?;

        if record.is_empty() {
            return Ok(None);
        }
        Ok(Some(record))
    }

    async fn put_record(
        &self,
        key: &str,
        record: &Record,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        // HSET with no field/value pairs is a syntax error
        if record.is_empty() {
            return Ok(false);
        }

        let mut conn = self.redis.clone();

        let mut hset = redis::cmd("HSET");
        hset.arg(key);
        for (field, value) in record {
            hset.arg(field).arg(value);
        }
        let added: usize = hset.query_async(&mut conn).await?;

        if added == 0 {
            return Ok(false);
        }

        redis::cmd("EXPIRE")
            .arg(key)
            .arg(ttl.as_secs().max(1))
            .query_async::<_, ()>(&mut conn)
            .await?;

        Ok(true)
    }
}

#[async_trait]
impl ValueStore for RedisStore {
    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        conn.set::<_, _, ()>(key, value).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.redis.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }
}
