//! TTL-keyed persistent store shared by all filters.
//!
//! A [`Store`] maps an opaque key (a fingerprint) to the unix time it was last
//! seen. Every read or write happens through a [`StoreGuard`] obtained from
//! [`Store::lock`], so a read-modify-write sequence on one store is always
//! serialized against other filter invocations and against [`Store::purge`].
//! Distinct stores have independent locks.
//!
//! Backends are selected once, at open time, from the configured kind:
//!
//! | kind       | persistence                      | binding |
//! |------------|----------------------------------|---------|
//! | `file`     | one JSON map per store in `path` | -       |
//! | `memory`   | none                             | -       |
//! | `sqlite`   | `path/mailgate.sqlite3`          | `?`     |
//! | `postgres` | one table per store              | `$n`    |
//! | `mysql`    | one table per store              | `?`     |

use async_trait::async_trait;
use miette::Diagnostic;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::config::CfgStore;

pub mod fs_storage;
pub mod memory;
#[cfg(feature = "mysql")]
pub mod mysql;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod sql;
#[cfg(feature = "sqlite")]
pub mod sqlite;

#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    #[error("failed to open store {name}: {reason}")]
    #[diagnostic(code(store::open_error))]
    Open { name: String, reason: String },

    #[error("unknown store backend {0:?}")]
    #[diagnostic(
        code(store::unknown_backend),
        help("supported backends are file, memory, sqlite, postgres and mysql, subject to enabled features")
    )]
    UnknownBackend(String),

    #[error("backend connection lost: {0}")]
    #[diagnostic(code(store::connection_lost))]
    ConnectionLost(String),

    #[error("backend error: {0}")]
    #[diagnostic(code(store::backend_error))]
    Backend(String),

    #[error("corrupt store data: {0}")]
    #[diagnostic(code(store::corrupt))]
    Corrupt(String),

    #[error("IO error: {0}")]
    #[diagnostic(code(store::io_error))]
    Io(#[from] std::io::Error),
}

impl StoreError {
    fn open(name: &str, reason: impl ToString) -> Self {
        StoreError::Open {
            name: name.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Storage engine behind a [`Store`]. Values are unix timestamps.
///
/// The owning store only ever hands out one `&mut` at a time, which covers
/// tasks in this process. Backends whose data can be shared with other
/// processes without a server to serialize them implement
/// [`Backend::acquire`] and [`Backend::release`] as well.
#[async_trait]
pub trait Backend: Send {
    async fn get(&mut self, key: &str) -> Result<Option<i64>, StoreError>;

    /// Inserts or updates `key`.
    async fn set(&mut self, key: &str, value: i64) -> Result<(), StoreError>;

    /// Removes `key`; absent keys are not an error.
    async fn delete(&mut self, key: &str) -> Result<(), StoreError>;

    /// Deletes every record whose value is below `cutoff` and returns how many went.
    async fn purge_older_than(&mut self, cutoff: i64) -> Result<u64, StoreError>;

    /// Makes pending writes durable. Called whenever a lock is released.
    async fn flush(&mut self) -> Result<(), StoreError> {
        Ok(())
    }

    /// Re-establishes a lost connection. Only connection-oriented backends
    /// ever report [`StoreError::ConnectionLost`].
    async fn reconnect(&mut self) -> Result<(), StoreError> {
        Ok(())
    }

    /// Takes any cross-process lock and brings the backend up to date with
    /// changes made by other processes. Called each time the store is locked.
    async fn acquire(&mut self) -> Result<(), StoreError> {
        Ok(())
    }

    /// Drops whatever [`Backend::acquire`] took. Must not block.
    fn release(&mut self) {}

    fn kind(&self) -> &'static str;
}

/// Current unix time in seconds.
pub fn unix_time() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

struct StoreInner {
    backend: Box<dyn Backend>,
    last_purge: i64,
}

pub struct Store {
    name: String,
    ttl: i64,
    purge_interval: i64,
    inner: Mutex<StoreInner>,
}

/// Runs a backend operation, reconnecting and retrying once if the backend
/// reports that its connection went away.
macro_rules! retry_once {
    ($store:expr, $inner:expr, $op:ident ( $($arg:expr),* )) => {{
        let first = $inner.backend.$op($($arg),*).await;
        match first {
            Err(StoreError::ConnectionLost(reason)) => {
                let store: &str = &$store.name;
                warn!(store, %reason, "Store connection lost, reconnecting");
                $inner.backend.reconnect().await?;
                $inner.backend.$op($($arg),*).await
            }
            other => other,
        }
    }};
}

impl Store {
    /// Opens the store `name` on the configured backend.
    ///
    /// `ttl` and `purge_interval` are in seconds. Fails when the backend kind
    /// is unknown or the backend cannot be created or reached.
    pub async fn open(
        name: &str,
        ttl: u64,
        purge_interval: u64,
        cfg: &CfgStore,
    ) -> Result<Store, StoreError> {
        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(StoreError::open(name, "store names may only contain [A-Za-z0-9_]"));
        }

        let backend = open_backend(name, cfg).await?;
        info!(store = name, backend = backend.kind(), ttl, purge_interval, "Opened store");
        Ok(Store::with_backend(name, ttl, purge_interval, backend))
    }

    pub fn with_backend(
        name: &str,
        ttl: u64,
        purge_interval: u64,
        backend: Box<dyn Backend>,
    ) -> Store {
        Store {
            name: name.to_string(),
            ttl: ttl as i64,
            purge_interval: purge_interval as i64,
            inner: Mutex::new(StoreInner {
                backend,
                last_purge: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ttl(&self) -> i64 {
        self.ttl
    }

    /// Takes the store's lock. The lock is released when the guard is dropped
    /// or [`StoreGuard::unlock`]ed; only `unlock` flushes pending writes.
    pub async fn lock(&self) -> Result<StoreGuard<'_>, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.backend.acquire().await?;
        Ok(StoreGuard { store: self, inner })
    }

    pub async fn purge(&self) -> Result<u64, StoreError> {
        self.purge_at(unix_time()).await
    }

    /// Deletes records older than the TTL, at most once per purge interval.
    pub async fn purge_at(&self, now: i64) -> Result<u64, StoreError> {
        let mut guard = self.lock().await?;
        if now <= guard.inner.last_purge + self.purge_interval {
            return Ok(0);
        }

        let cutoff = now - self.ttl;
        let removed = retry_once!(self, guard.inner, purge_older_than(cutoff))?;
        guard.inner.last_purge = now;
        guard.unlock().await?;

        if removed > 0 {
            debug!(store = %self.name, removed, cutoff, "Purged expired records");
        }
        Ok(removed)
    }
}

/// Exclusive access to one store.
pub struct StoreGuard<'a> {
    store: &'a Store,
    inner: MutexGuard<'a, StoreInner>,
}

impl StoreGuard<'_> {
    pub async fn contains(&mut self, key: &str) -> Result<bool, StoreError> {
        Ok(self.get(key).await?.is_some())
    }

    pub async fn get(&mut self, key: &str) -> Result<Option<i64>, StoreError> {
        retry_once!(self.store, self.inner, get(key))
    }

    pub async fn set(&mut self, key: &str, value: i64) -> Result<(), StoreError> {
        retry_once!(self.store, self.inner, set(key, value))
    }

    pub async fn delete(&mut self, key: &str) -> Result<(), StoreError> {
        retry_once!(self.store, self.inner, delete(key))
    }

    /// Flushes pending writes and releases the lock.
    pub async fn unlock(mut self) -> Result<(), StoreError> {
        self.inner.backend.flush().await
    }
}

impl Drop for StoreGuard<'_> {
    fn drop(&mut self) {
        self.inner.backend.release();
    }
}

async fn open_backend(name: &str, cfg: &CfgStore) -> Result<Box<dyn Backend>, StoreError> {
    match cfg.backend.to_ascii_lowercase().as_str() {
        "file" => Ok(Box::new(fs_storage::FileBackend::open(&cfg.path, name).await?)),
        "memory" => Ok(Box::new(memory::MemoryBackend::new())),
        #[cfg(feature = "sqlite")]
        "sqlite" => Ok(Box::new(sqlite::SqliteBackend::open(&cfg.path, name).await?)),
        #[cfg(feature = "postgres")]
        "postgres" | "postgresql" => Ok(Box::new(postgres::PostgresBackend::open(cfg, name).await?)),
        #[cfg(feature = "mysql")]
        "mysql" | "mariadb" => Ok(Box::new(mysql::MysqlBackend::open(cfg, name).await?)),
        other => Err(StoreError::UnknownBackend(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn memory_store(ttl: u64, purge_interval: u64) -> Store {
        Store::with_backend(
            "test",
            ttl,
            purge_interval,
            Box::new(memory::MemoryBackend::new()),
        )
    }

    #[tokio::test]
    async fn test_set_get_delete() {
        let store = memory_store(60, 0);
        let mut guard = store.lock().await.unwrap();

        assert!(!guard.contains("k").await.unwrap());
        assert_eq!(guard.get("k").await.unwrap(), None);

        guard.set("k", 100).await.unwrap();
        assert!(guard.contains("k").await.unwrap());
        guard.set("k", 200).await.unwrap();
        assert_eq!(guard.get("k").await.unwrap(), Some(200));

        guard.delete("k").await.unwrap();
        guard.delete("k").await.unwrap();
        assert!(!guard.contains("k").await.unwrap());
        guard.unlock().await.unwrap();
    }

    #[tokio::test]
    async fn test_purge_removes_only_expired() {
        let store = memory_store(100, 10);
        let now = 10_000;
        {
            let mut guard = store.lock().await.unwrap();
            guard.set("expired", now - 101).await.unwrap();
            guard.set("boundary", now - 100).await.unwrap();
            guard.set("fresh", now - 5).await.unwrap();
            guard.unlock().await.unwrap();
        }

        assert_eq!(store.purge_at(now).await.unwrap(), 1);

        let mut guard = store.lock().await.unwrap();
        assert!(!guard.contains("expired").await.unwrap());
        assert!(guard.contains("boundary").await.unwrap());
        assert!(guard.contains("fresh").await.unwrap());
    }

    #[tokio::test]
    async fn test_purge_is_throttled() {
        let store = memory_store(100, 3600);
        assert_eq!(store.purge_at(10_000).await.unwrap(), 0);

        store.lock().await.unwrap().set("old", 1).await.unwrap();

        // Within the interval nothing happens, even though "old" has expired.
        assert_eq!(store.purge_at(10_000 + 3600).await.unwrap(), 0);
        assert!(store.lock().await.unwrap().contains("old").await.unwrap());

        assert_eq!(store.purge_at(10_000 + 3601).await.unwrap(), 1);
        assert!(!store.lock().await.unwrap().contains("old").await.unwrap());
    }

    #[tokio::test]
    async fn test_lock_serializes_read_modify_write() {
        let store = Arc::new(memory_store(60, 60));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let mut guard = store.lock().await.unwrap();
                let current = guard.get("counter").await.unwrap().unwrap_or(0);
                tokio::task::yield_now().await;
                guard.set("counter", current + 1).await.unwrap();
                guard.unlock().await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(store.lock().await.unwrap().get("counter").await.unwrap(), Some(16));
    }

    /// Loses its connection on every other call.
    struct FlakyBackend {
        inner: memory::MemoryBackend,
        calls: usize,
        reconnects: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Backend for FlakyBackend {
        async fn get(&mut self, key: &str) -> Result<Option<i64>, StoreError> {
            self.calls += 1;
            if self.calls % 2 == 1 {
                return Err(StoreError::ConnectionLost("reset by peer".to_string()));
            }
            self.inner.get(key).await
        }

        async fn set(&mut self, key: &str, value: i64) -> Result<(), StoreError> {
            self.inner.set(key, value).await
        }

        async fn delete(&mut self, key: &str) -> Result<(), StoreError> {
            self.inner.delete(key).await
        }

        async fn purge_older_than(&mut self, _cutoff: i64) -> Result<u64, StoreError> {
            Err(StoreError::ConnectionLost("server gone".to_string()))
        }

        async fn reconnect(&mut self) -> Result<(), StoreError> {
            self.reconnects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn kind(&self) -> &'static str {
            "flaky"
        }
    }

    #[tokio::test]
    async fn test_connection_loss_is_retried_once() {
        let reconnects = Arc::new(AtomicUsize::new(0));
        let store = Store::with_backend(
            "flaky",
            60,
            0,
            Box::new(FlakyBackend {
                inner: memory::MemoryBackend::new(),
                calls: 0,
                reconnects: reconnects.clone(),
            }),
        );

        let mut guard = store.lock().await.unwrap();
        guard.set("k", 5).await.unwrap();
        assert_eq!(guard.get("k").await.unwrap(), Some(5));
        assert_eq!(reconnects.load(Ordering::SeqCst), 1);
        drop(guard);

        // A second failure after reconnecting is surfaced.
        let result = store.purge_at(1000).await;
        assert!(matches!(result, Err(StoreError::ConnectionLost(_))));
        assert_eq!(reconnects.load(Ordering::SeqCst), 2);
    }

    /// Counts cross-process lock traffic; refuses the lock once `refuse` is set.
    struct LockingBackend {
        inner: memory::MemoryBackend,
        held: Arc<AtomicUsize>,
        refuse: Arc<std::sync::atomic::AtomicBool>,
    }

    #[async_trait]
    impl Backend for LockingBackend {
        async fn get(&mut self, key: &str) -> Result<Option<i64>, StoreError> {
            self.inner.get(key).await
        }

        async fn set(&mut self, key: &str, value: i64) -> Result<(), StoreError> {
            self.inner.set(key, value).await
        }

        async fn delete(&mut self, key: &str) -> Result<(), StoreError> {
            self.inner.delete(key).await
        }

        async fn purge_older_than(&mut self, cutoff: i64) -> Result<u64, StoreError> {
            self.inner.purge_older_than(cutoff).await
        }

        async fn acquire(&mut self) -> Result<(), StoreError> {
            if self.refuse.load(Ordering::SeqCst) {
                return Err(StoreError::Backend("lock unavailable".to_string()));
            }
            self.held.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn release(&mut self) {
            self.held.fetch_sub(1, Ordering::SeqCst);
        }

        fn kind(&self) -> &'static str {
            "locking"
        }
    }

    #[tokio::test]
    async fn test_backend_lock_follows_guard() {
        let held = Arc::new(AtomicUsize::new(0));
        let refuse = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let store = Store::with_backend(
            "locking",
            60,
            0,
            Box::new(LockingBackend {
                inner: memory::MemoryBackend::new(),
                held: held.clone(),
                refuse: refuse.clone(),
            }),
        );

        let mut guard = store.lock().await.unwrap();
        assert_eq!(held.load(Ordering::SeqCst), 1);
        guard.set("k", 1).await.unwrap();
        guard.unlock().await.unwrap();
        assert_eq!(held.load(Ordering::SeqCst), 0);

        let guard = store.lock().await.unwrap();
        drop(guard);
        assert_eq!(held.load(Ordering::SeqCst), 0);

        refuse.store(true, Ordering::SeqCst);
        assert!(matches!(store.lock().await, Err(StoreError::Backend(_))));
        assert!(matches!(store.purge_at(1000).await, Err(StoreError::Backend(_))));
        assert_eq!(held.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_open_rejects_unknown_backend_and_bad_names() {
        let cfg = CfgStore {
            backend: "berkeleydb".to_string(),
            ..CfgStore::default()
        };
        assert!(matches!(
            Store::open("whitelist", 60, 60, &cfg).await,
            Err(StoreError::UnknownBackend(_))
        ));

        let cfg = CfgStore {
            backend: "memory".to_string(),
            ..CfgStore::default()
        };
        assert!(matches!(
            Store::open("../etc/passwd", 60, 60, &cfg).await,
            Err(StoreError::Open { .. })
        ));
        assert!(Store::open("whitelist", 60, 60, &cfg).await.is_ok());
    }
}
