//! Embedded-database backend (SQLite)
//!
//! ```text
//! cache(key TEXT PRIMARY KEY, value TEXT, expiration INTEGER)
//! queue(key TEXT, id INTEGER PRIMARY KEY AUTOINCREMENT, value TEXT)
//! ```
//! Values are stored as JSON text, expirations as unix milliseconds (`0` = never).
//! The database runs in WAL mode on a single connection, and every operation
//! goes through one instance-wide mutex (single writer). `brpop` polls the
//! queue table at a fixed interval until its deadline.

use crate::core::backend::CacheBackend;
use crate::core::error::{CacheError, CacheResult};
use crate::core::types::{
    CacheValue, coerce_i64, counter_value, decode, encode, expiration_from_ttl, is_expired_at,
    now_millis,
};
use async_trait::async_trait;
use sqlx::Row;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

/// Default sleep between queue polls in `brpop`
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// One opened database file, shared by every typed handle on the same name
pub struct SqliteStore {
    name: String,
    path: PathBuf,
    pool: SqlitePool,
    lock: Mutex<()>,
    poll_interval: Duration,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

impl SqliteStore {
    /// Open (or create) the database at `path` and ensure the schema exists
    pub async fn open(
        name: &str,
        path: impl AsRef<Path>,
        poll_interval: Duration,
    ) -> CacheResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        // One connection: SQLite allows a single writer anyway.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| {
                CacheError::BackendUnavailable(format!("open {}: {}", path.display(), e))
            })?;

        let store = Self {
            name: name.to_string(),
            path,
            pool,
            lock: Mutex::new(()),
            poll_interval,
        };
        store.migrate().await?;

        info!("Opened sqlite cache '{}' at {:?}", store.name, store.path);
        Ok(store)
    }

    /// Create tables and indexes; safe to run on every open
    async fn migrate(&self) -> CacheResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS cache (key TEXT PRIMARY KEY, value TEXT, expiration INTEGER)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS queue (key TEXT, id INTEGER PRIMARY KEY AUTOINCREMENT, value TEXT)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_queue_key_id ON queue (key, id)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        !self.pool.is_closed()
    }

    /// Close the connection; later operations fail with an I/O error
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Fetch the raw JSON text of a live entry, deleting it if expired
    pub async fn get_raw(&self, key: &str) -> CacheResult<String> {
        let _guard = self.lock.lock().await;

        let row = sqlx::query("SELECT value, expiration FROM cache WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Err(CacheError::Miss(key.to_string()));
        };

        let expiration: Option<i64> = row.try_get("expiration")?;
        if is_expired_at(expiration.unwrap_or(0)) {
            debug!("Evicting expired key: {}", key);
            sqlx::query("DELETE FROM cache WHERE key = ?")
                .bind(key)
                .execute(&self.pool)
                .await?;
            return Err(CacheError::Miss(key.to_string()));
        }

        let value: Option<String> = row.try_get("value")?;
        Ok(value.unwrap_or_else(|| "null".to_string()))
    }

    /// Upsert raw JSON text with an absolute expiration
    pub async fn set_raw(&self, key: &str, value: &str, expiration: i64) -> CacheResult<()> {
        let _guard = self.lock.lock().await;
        sqlx::query(
            "INSERT INTO cache (key, value, expiration) VALUES (?, ?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, expiration = excluded.expiration",
        )
        .bind(key)
        .bind(value)
        .bind(expiration)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Delete the entry and any queue stored under `key`
    pub async fn delete(&self, key: &str) -> CacheResult<()> {
        let _guard = self.lock.lock().await;
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM cache WHERE key = ?")
            .bind(key)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM queue WHERE key = ?")
            .bind(key)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Increment a counter, keeping the entry's expiration
    ///
    /// `render` turns the new counter into the JSON text to store, so the
    /// stored shape matches the typed handle's value type.
    pub async fn incr_with<F>(&self, key: &str, render: F) -> CacheResult<i64>
    where
        F: FnOnce(i64) -> CacheResult<String> + Send,
    {
        let _guard = self.lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT value, expiration FROM cache WHERE key = ?")
            .bind(key)
            .fetch_optional(&mut *tx)
            .await?;

        let (current, expiration) = match row {
            Some(row) => {
                let expiration: i64 = row.try_get::<Option<i64>, _>("expiration")?.unwrap_or(0);
                if is_expired_at(expiration) {
                    (0, 0)
                } else {
                    let raw: Option<String> = row.try_get("value")?;
                    let parsed: serde_json::Value =
                        serde_json::from_str(raw.as_deref().unwrap_or("null"))
                            .map_err(|e| CacheError::TypeMismatch(e.to_string()))?;
                    let current = coerce_i64(&parsed).ok_or_else(|| {
                        CacheError::TypeMismatch(format!("value at {} is not numeric", key))
                    })?;
                    (current, expiration)
                }
            }
            None => (0, 0),
        };

        let next = current.checked_add(1).ok_or_else(|| {
            CacheError::TypeMismatch(format!("counter {} would overflow", key))
        })?;
        sqlx::query(
            "INSERT INTO cache (key, value, expiration) VALUES (?, ?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, expiration = excluded.expiration",
        )
        .bind(key)
        .bind(render(next)?)
        .bind(expiration)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(next)
    }

    /// Rewrite the expiration of a live entry
    pub async fn expire(&self, key: &str, expiration: i64) -> CacheResult<()> {
        let _guard = self.lock.lock().await;
        let result = sqlx::query(
            "UPDATE cache SET expiration = ? \
             WHERE key = ? AND (expiration IS NULL OR expiration = 0 OR expiration > ?)",
        )
        .bind(expiration)
        .bind(key)
        .bind(now_millis())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CacheError::Miss(key.to_string()));
        }
        Ok(())
    }

    /// Append raw JSON text to the queue at `key`
    pub async fn push_raw(&self, key: &str, value: &str) -> CacheResult<()> {
        let _guard = self.lock.lock().await;
        sqlx::query("INSERT INTO queue (key, value) VALUES (?, ?)")
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Remove and return the oldest queue item, if any
    async fn try_pop_raw(&self, key: &str) -> CacheResult<Option<String>> {
        let _guard = self.lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT id, value FROM queue WHERE key = ? ORDER BY id LIMIT 1")
            .bind(key)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };

        let id: i64 = row.try_get("id")?;
        let value: Option<String> = row.try_get("value")?;
        sqlx::query("DELETE FROM queue WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(Some(value.unwrap_or_else(|| "null".to_string())))
    }

    /// Poll the queue until an item arrives or `timeout` elapses (zero = forever)
    pub async fn pop_raw(&self, timeout: Duration, key: &str) -> CacheResult<String> {
        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);

        loop {
            if let Some(value) = self.try_pop_raw(key).await? {
                return Ok(value);
            }

            let nap = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        debug!("BRPOP timed out: key={}", key);
                        return Err(CacheError::Timeout(key.to_string()));
                    }
                    self.poll_interval.min(deadline - now)
                }
                None => self.poll_interval,
            };
            tokio::time::sleep(nap).await;
        }
    }

    /// Number of items waiting in the queue at `key`
    pub async fn queue_len(&self, key: &str) -> CacheResult<u64> {
        let _guard = self.lock.lock().await;
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM queue WHERE key = ?")
            .bind(key)
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    /// Delete every expired entry; returns how many were removed
    pub async fn purge_expired(&self) -> CacheResult<u64> {
        let _guard = self.lock.lock().await;
        let result = sqlx::query(
            "DELETE FROM cache WHERE expiration IS NOT NULL AND expiration != 0 AND expiration <= ?",
        )
        .bind(now_millis())
        .execute(&self.pool)
        .await?;
        let purged = result.rows_affected();
        if purged > 0 {
            debug!("Purged {} expired keys from '{}'", purged, self.name);
        }
        Ok(purged)
    }
}

/// Typed handle over a shared [`SqliteStore`]
pub struct SqliteBackend<V> {
    store: Arc<SqliteStore>,
    _value: PhantomData<fn() -> V>,
}

impl<V> Clone for SqliteBackend<V> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            _value: PhantomData,
        }
    }
}

impl<V: CacheValue> SqliteBackend<V> {
    pub fn new(store: Arc<SqliteStore>) -> Self {
        Self {
            store,
            _value: PhantomData,
        }
    }

    /// Open a private store at `path` with the default poll interval
    pub async fn open(name: &str, path: impl AsRef<Path>) -> CacheResult<Self> {
        let store = SqliteStore::open(name, path, DEFAULT_POLL_INTERVAL).await?;
        Ok(Self::new(Arc::new(store)))
    }

    pub fn store(&self) -> &Arc<SqliteStore> {
        &self.store
    }
}

#[async_trait]
impl<V: CacheValue> CacheBackend<V> for SqliteBackend<V> {
    async fn get(&self, key: &str) -> CacheResult<V> {
        let raw = self.store.get_raw(key).await?;
        decode(&raw)
    }

    async fn set(&self, key: &str, value: V, ttl: Duration) -> CacheResult<()> {
        let raw = encode(&value)?;
        self.store
            .set_raw(key, &raw, expiration_from_ttl(ttl))
            .await
    }

    async fn del(&self, key: &str) -> CacheResult<()> {
        self.store.delete(key).await
    }

    async fn exists(&self, key: &str) -> CacheResult<bool> {
        match self.store.get_raw(key).await {
            Ok(_) => Ok(true),
            Err(CacheError::Miss(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn incr(&self, key: &str) -> CacheResult<i64> {
        self.store
            .incr_with(key, |n| encode(&counter_value::<V>(n)?))
            .await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> CacheResult<()> {
        self.store.expire(key, expiration_from_ttl(ttl)).await
    }

    async fn rpush(&self, key: &str, value: V) -> CacheResult<()> {
        let raw = encode(&value)?;
        self.store.push_raw(key, &raw).await
    }

    async fn brpop(&self, timeout: Duration, key: &str) -> CacheResult<V> {
        let raw = self.store.pop_raw(timeout, key).await?;
        decode(&raw)
    }

    fn is_initialized(&self) -> bool {
        self.store.is_open()
    }

    fn backend_name(&self) -> &'static str {
        "sqlite"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn open_temp<V: CacheValue>(dir: &TempDir) -> SqliteBackend<V> {
        SqliteBackend::open("test", dir.path().join("test.db"))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_set_get_roundtrip() {
        let dir = TempDir::new().unwrap();
        let cache: SqliteBackend<serde_json::Value> = open_temp(&dir).await;

        let value = serde_json::json!({"name": "alice", "age": 30});
        cache
            .set("user:1", value.clone(), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(cache.get("user:1").await.unwrap(), value);
    }

    #[tokio::test]
    async fn test_miss_is_distinguished() {
        let dir = TempDir::new().unwrap();
        let cache: SqliteBackend<i64> = open_temp(&dir).await;
        assert_eq!(
            cache.get("absent").await,
            Err(CacheError::Miss("absent".to_string()))
        );
        assert!(!cache.exists("absent").await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_row_is_deleted_on_read() {
        let dir = TempDir::new().unwrap();
        let cache: SqliteBackend<String> = open_temp(&dir).await;

        cache
            .store()
            .set_raw("old", "\"stale\"", now_millis() - 5)
            .await
            .unwrap();
        assert!(cache.get("old").await.unwrap_err().is_miss());

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM cache")
            .fetch_one(&cache.store().pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_incr_over_float_encoding() {
        let dir = TempDir::new().unwrap();
        let cache: SqliteBackend<i64> = open_temp(&dir).await;

        cache.store().set_raw("hits", "2.0", 0).await.unwrap();
        assert_eq!(cache.incr("hits").await.unwrap(), 3);
        assert_eq!(cache.get("hits").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_incr_keeps_expiration() {
        let dir = TempDir::new().unwrap();
        let cache: SqliteBackend<i64> = open_temp(&dir).await;

        cache.set("n", 1, Duration::from_millis(300)).await.unwrap();
        assert_eq!(cache.incr("n").await.unwrap(), 2);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(cache.get("n").await.unwrap_err().is_miss());
    }

    #[tokio::test]
    async fn test_sub_second_ttl() {
        let dir = TempDir::new().unwrap();
        let cache: SqliteBackend<String> = open_temp(&dir).await;

        cache
            .set("short", "v".to_string(), Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(cache.get("short").await.unwrap(), "v");

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(cache.get("short").await.unwrap_err().is_miss());
    }

    #[tokio::test]
    async fn test_incr_string_values() {
        let dir = TempDir::new().unwrap();
        let cache: SqliteBackend<String> = open_temp(&dir).await;

        assert_eq!(cache.incr("visits").await.unwrap(), 1);
        assert_eq!(cache.incr("visits").await.unwrap(), 2);
        assert_eq!(cache.get("visits").await.unwrap(), "2");
    }

    #[tokio::test]
    async fn test_expire_missing_and_existing() {
        let dir = TempDir::new().unwrap();
        let cache: SqliteBackend<String> = open_temp(&dir).await;

        assert!(matches!(
            cache.expire("ghost", Duration::from_secs(1)).await,
            Err(CacheError::Miss(_))
        ));

        cache
            .set("k", "v".to_string(), Duration::ZERO)
            .await
            .unwrap();
        cache.expire("k", Duration::from_secs(1)).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), "v");
        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert!(!cache.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_queue_fifo_and_delete() {
        let dir = TempDir::new().unwrap();
        let cache: SqliteBackend<String> = open_temp(&dir).await;

        for item in ["a", "b", "c"] {
            cache.rpush("jobs", item.to_string()).await.unwrap();
        }
        assert_eq!(cache.store().queue_len("jobs").await.unwrap(), 3);
        assert_eq!(cache.brpop(Duration::ZERO, "jobs").await.unwrap(), "a");

        cache.del("jobs").await.unwrap();
        assert_eq!(cache.store().queue_len("jobs").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_brpop_polls_until_timeout() {
        let dir = TempDir::new().unwrap();
        let cache: SqliteBackend<String> = open_temp(&dir).await;

        let start = std::time::Instant::now();
        let result = cache.brpop(Duration::from_millis(200), "empty").await;
        assert_eq!(result, Err(CacheError::Timeout("empty".to_string())));
        assert!(start.elapsed() >= Duration::from_millis(195));
        assert!(start.elapsed() < Duration::from_millis(700));
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let dir = TempDir::new().unwrap();
        let cache: SqliteBackend<String> = open_temp(&dir).await;

        cache.store().set_raw("a", "\"1\"", now_millis() - 1).await.unwrap();
        cache.store().set_raw("b", "\"2\"", now_millis() - 1).await.unwrap();
        cache
            .set("c", "3".to_string(), Duration::ZERO)
            .await
            .unwrap();

        assert_eq!(cache.store().purge_expired().await.unwrap(), 2);
        assert!(cache.exists("c").await.unwrap());
    }

    #[tokio::test]
    async fn test_reopen_keeps_data() {
        let dir = TempDir::new().unwrap();
        {
            let cache: SqliteBackend<String> = open_temp(&dir).await;
            cache
                .set("durable", "yes".to_string(), Duration::ZERO)
                .await
                .unwrap();
            cache.rpush("q", "item".to_string()).await.unwrap();
            cache.store().close().await;
        }

        let cache: SqliteBackend<String> = open_temp(&dir).await;
        assert_eq!(cache.get("durable").await.unwrap(), "yes");
        assert_eq!(cache.brpop(Duration::ZERO, "q").await.unwrap(), "item");
    }

    #[tokio::test]
    async fn test_wal_mode_enabled() {
        let dir = TempDir::new().unwrap();
        let cache: SqliteBackend<String> = open_temp(&dir).await;
        let mode: String = sqlx::query_scalar("PRAGMA journal_mode")
            .fetch_one(&cache.store().pool)
            .await
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }
}
