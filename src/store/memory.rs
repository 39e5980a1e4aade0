//! In-process store with per-session command serialization.
//!
//! A [`MemoryServer`] holds the data. Each call to [`MemoryServer::connect`]
//! opens a session ([`MemoryStore`]); clones of a session share it. A session
//! executes one command at a time, and a blocking pop keeps the session busy
//! until it returns, exactly like a single Redis connection. A push issued on
//! a session that is blocked in a pop waits behind that pop and is applied
//! only after the pop has timed out.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{Item, ListStore, PollTimeout, Record, RecordStore, StoreError, ValueStore};

#[derive(Debug, Clone, Copy)]
enum End {
    Left,
    Right,
}

#[derive(Default)]
struct ServerState {
    lists: HashMap<String, VecDeque<String>>,
    records: HashMap<String, (Record, Option<Instant>)>,
    values: HashMap<String, String>,
    shut_down: bool,
}

#[derive(Default)]
struct ServerInner {
    state: Mutex<ServerState>,
    /// Signalled on every push and on shutdown.
    changed: Notify,
}

impl ServerInner {
    fn state(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pop(&self, key: &str, end: End) -> Option<Item> {
        let mut state = self.state();
        let list = state.lists.get_mut(key)?;
        let value = match end {
            End::Left => list.pop_front(),
            End::Right => list.pop_back(),
        };
        if list.is_empty() {
            state.lists.remove(key);
        }
        value.map(Item::from)
    }
}

/// Shared data behind one or more [`MemoryStore`] sessions.
#[derive(Clone, Default)]
pub struct MemoryServer {
    inner: Arc<ServerInner>,
}

impl MemoryServer {
    /// Creates an empty server.
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a new, independent session.
    pub fn connect(&self) -> MemoryStore {
        MemoryStore {
            server: Arc::clone(&self.inner),
            session: Arc::new(Session::default()),
        }
    }

    /// Stops the server. Every command on every session fails afterwards,
    /// including blocking pops that are currently waiting.
    pub fn shutdown(&self) {
        self.inner.state().shut_down = true;
        self.inner.changed.notify_waiters();
    }
}

#[derive(Default)]
struct Session {
    /// Held for the duration of each command.
    turn: tokio::sync::Mutex<()>,
    disconnected: AtomicBool,
    blocking_pops: AtomicU64,
}

/// A session on a [`MemoryServer`].
#[derive(Clone)]
pub struct MemoryStore {
    server: Arc<ServerInner>,
    session: Arc<Session>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Creates a fresh server and opens one session on it.
    pub fn new() -> Self {
        MemoryServer::new().connect()
    }

    /// Closes this session. Other sessions on the same server are unaffected.
    pub fn disconnect(&self) {
        self.session.disconnected.store(true, Ordering::SeqCst);
        self.server.changed.notify_waiters();
    }

    /// Number of blocking pops issued on this session so far.
    pub fn blocking_pops(&self) -> u64 {
        self.session.blocking_pops.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.session.disconnected.load(Ordering::SeqCst) || self.server.state().shut_down {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    async fn pop(&self, key: &str, end: End) -> Result<Option<Item>, StoreError> {
        let _turn = self.session.turn.lock().await;
        self.ensure_open()?;
        Ok(self.server.pop(key, end))
    }

    async fn blocking_pop(
        &self,
        key: &str,
        end: End,
        timeout: PollTimeout,
    ) -> Result<Option<Item>, StoreError> {
        let _turn = self.session.turn.lock().await;
        self.session.blocking_pops.fetch_add(1, Ordering::SeqCst);

        let deadline = timeout.duration().map(|d| Instant::now() + d);

        loop {
            // Register before checking so a push between the check and the
            // wait is not missed
            let notified = self.server.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            self.ensure_open()?;
            if let Some(item) = self.server.pop(key, end) {
                return Ok(Some(item));
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified.as_mut())
                        .await
                        .is_err()
                    {
                        return Ok(None);
                    }
                }
                None => notified.as_mut().await,
            }
        }
    }
}

#[async_trait]
impl ListStore for MemoryStore {
    async fn push_left(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let _turn = self.session.turn.lock().await;
        self.ensure_open()?;
        self.server
            .state()
            .lists
            .entry(key.to_string())
            .or_default()
            .push_front(value.to_string());
        self.server.changed.notify_waiters();
        Ok(())
    }

    async fn pop_left(&self, key: &str) -> Result<Option<Item>, StoreError> {
        self.pop(key, End::Left).await
    }

    async fn pop_right(&self, key: &str) -> Result<Option<Item>, StoreError> {
        self.pop(key, End::Right).await
    }

    async fn blocking_pop_left(
        &self,
        key: &str,
        timeout: PollTimeout,
    ) -> Result<Option<Item>, StoreError> {
        self.blocking_pop(key, End::Left, timeout).await
    }

    async fn blocking_pop_right(
        &self,
        key: &str,
        timeout: PollTimeout,
    ) -> Result<Option<Item>, StoreError> {
        self.blocking_pop(key, End::Right, timeout).await
    }

    async fn delete_key(&self, key: &str) -> Result<(), StoreError> {
        let _turn = self.session.turn.lock().await;
        self.ensure_open()?;
        let mut state = self.server.state();
        state.lists.remove(key);
        state.records.remove(key);
        state.values.remove(key);
        Ok(())
    }

    async fn len(&self, key: &str) -> Result<usize, StoreError> {
        let _turn = self.session.turn.lock().await;
        self.ensure_open()?;
        Ok(self.server.state().lists.get(key).map_or(0, VecDeque::len))
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn get_record(&self, key: &str) -> Result<Option<Record>, StoreError> {
        let _turn = self.session.turn.lock().await;
        self.ensure_open()?;

        let mut state = self.server.state();
        let expired = match state.records.get(key) {
            Some((_, Some(expires_at))) => *expires_at <= Instant::now(),
            Some(_) => false,
            None => return Ok(None),
        };
        if expired {
            state.records.remove(key);
            return Ok(None);
        }
        Ok(state.records.get(key).map(|(record, _)| record.clone()))
    }

    async fn put_record(
        &self,
        key: &str,
        record: &Record,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let _turn = self.session.turn.lock().await;
        self.ensure_open()?;

        if record.is_empty() {
            return Ok(false);
        }

        let now = Instant::now();
        let mut state = self.server.state();
        let entry = state
            .records
            .entry(key.to_string())
            .or_insert_with(|| (Record::new(), None));

        if entry.1.is_some_and(|expires_at| expires_at <= now) {
            *entry = (Record::new(), None);
        }

        let mut added = 0usize;
        for (field, value) in record {
            if entry.0.insert(field.clone(), value.clone()).is_none() {
                added += 1;
            }
        }

        if added == 0 {
            return Ok(false);
        }
        entry.1 = Some(now + ttl.max(Duration::from_secs(1)));
        Ok(true)
    }
}

#[async_trait]
impl ValueStore for MemoryStore {
    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let _turn = self.session.turn.lock().await;
        self.ensure_open()?;
        self.server
            .state()
            .values
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let _turn = self.session.turn.lock().await;
        self.ensure_open()?;
        Ok(self.server.state().values.get(key).cloned())
    }
}
