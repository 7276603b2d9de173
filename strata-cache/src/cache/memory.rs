//! In-process backend
//!
//! Values live in a `moka` expiring map with per-entry expiration. Queues live
//! in a separate map outside the bounded cache, so capacity eviction never
//! drops queued items. Each key is guarded by its own async reader-writer lock
//! (see [`KeyLocks`]), so operations on different keys never contend.
//!
//! A key holds either a value or a queue, never both.
//!
//! # Blocking queue
//! ```text
//! rpush: lock(key) -> append -> unlock -> notify_one (coalesces if pending)
//! brpop: loop { lock(key) -> pop head? return : unlock -> wait(notify | deadline) }
//! ```
//! The waiter always re-checks the queue under the lock after a wake, so a
//! coalesced notification can delay a waiter but never loses an item. When
//! several callers block on one key each push wakes one of them, in no
//! particular order.

use crate::core::backend::CacheBackend;
use crate::core::error::{CacheError, CacheResult};
use crate::core::key_locks::KeyLocks;
use crate::core::types::{
    CacheEntry, CacheValue, MemoryConfig, MemoryStats, counter_of, counter_value,
};
use async_trait::async_trait;
use moka::Expiry;
use moka::future::Cache;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

type Queues<V> = Arc<Mutex<HashMap<String, VecDeque<V>>>>;

/// Per-entry expiry read from the stored entry
struct EntryExpiry;

impl<V> Expiry<String, CacheEntry<V>> for EntryExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CacheEntry<V>,
        _created_at: Instant,
    ) -> Option<Duration> {
        value.remaining()
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &CacheEntry<V>,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        value.remaining()
    }
}

/// Expiring in-process store with per-key locking and blocking queues
#[derive(Clone)]
pub struct MemoryBackend<V: CacheValue> {
    data: Cache<String, CacheEntry<V>>,
    queues: Queues<V>,
    locks: Arc<KeyLocks>,
    stats: Arc<RwLock<MemoryStats>>,
}

impl<V: CacheValue> Default for MemoryBackend<V> {
    fn default() -> Self {
        Self::new(MemoryConfig::default())
    }
}

impl<V: CacheValue> MemoryBackend<V> {
    /// Create a new in-process backend with the given configuration
    ///
    /// `max_capacity` bounds stored values only; queues are never evicted.
    pub fn new(config: MemoryConfig) -> Self {
        info!(
            "Initializing in-process cache with max_capacity={:?}",
            config.max_capacity
        );

        let mut builder = Cache::builder().expire_after(EntryExpiry);
        if let Some(capacity) = config.max_capacity {
            builder = builder.max_capacity(capacity);
        }

        Self {
            data: builder.build(),
            queues: Arc::new(Mutex::new(HashMap::new())),
            locks: Arc::new(KeyLocks::new()),
            stats: Arc::new(RwLock::new(MemoryStats::default())),
        }
    }

    /// Get statistics
    pub fn stats(&self) -> MemoryStats {
        self.stats.read().clone()
    }

    /// Approximate number of stored keys (values and queues)
    pub fn entry_count(&self) -> u64 {
        self.data.entry_count() + self.queues.lock().len() as u64
    }

    /// Items waiting in the queue at `key`
    pub fn queue_len(&self, key: &str) -> usize {
        self.queues.lock().get(key).map_or(0, VecDeque::len)
    }

    /// Number of keys whose lock/notification state is currently in use
    pub fn tracked_keys(&self) -> usize {
        self.locks.live_count()
    }

    /// Run the expiring map's pending housekeeping (expirations, evictions)
    pub async fn run_pending_tasks(&self) {
        self.data.run_pending_tasks().await;
    }

    fn holds_queue(&self, key: &str) -> bool {
        self.queues.lock().contains_key(key)
    }

    /// Remove an expired value, re-checking under the write lock so a
    /// concurrent `set` is never clobbered
    async fn evict_if_expired(&self, key: &str) {
        let slot = self.locks.slot(key);
        let _guard = slot.lock().write().await;
        if let Some(entry) = self.data.get(key).await {
            if entry.is_expired() {
                debug!("Evicting expired key: {}", key);
                self.data.invalidate(key).await;
            }
        }
    }

    /// Pop the queue head; caller holds the key's write lock
    async fn pop_front(&self, key: &str) -> CacheResult<Option<V>> {
        {
            let mut queues = self.queues.lock();
            if let Some(items) = queues.get_mut(key) {
                let value = items.pop_front();
                if items.is_empty() {
                    queues.remove(key);
                }
                if value.is_some() {
                    return Ok(value);
                }
            }
        }

        match self.data.get(key).await {
            Some(entry) if !entry.is_expired() => Err(CacheError::TypeMismatch(format!(
                "key {} holds a value, not a queue",
                key
            ))),
            _ => Ok(None),
        }
    }
}

#[async_trait]
impl<V: CacheValue> CacheBackend<V> for MemoryBackend<V> {
    async fn get(&self, key: &str) -> CacheResult<V> {
        debug!("GET key={}", key);
        self.stats.write().gets += 1;

        let found = {
            let slot = self.locks.slot(key);
            let _guard = slot.lock().read().await;
            self.data.get(key).await
        };

        match found {
            Some(entry) if !entry.is_expired() => {
                self.stats.write().hits += 1;
                Ok(entry.value)
            }
            Some(_) => {
                self.evict_if_expired(key).await;
                self.stats.write().misses += 1;
                Err(CacheError::Miss(key.to_string()))
            }
            None if self.holds_queue(key) => Err(CacheError::TypeMismatch(format!(
                "key {} holds a queue",
                key
            ))),
            None => {
                self.stats.write().misses += 1;
                Err(CacheError::Miss(key.to_string()))
            }
        }
    }

    async fn set(&self, key: &str, value: V, ttl: Duration) -> CacheResult<()> {
        debug!("SET key={}, ttl={:?}", key, ttl);

        let slot = self.locks.slot(key);
        let _guard = slot.lock().write().await;
        self.queues.lock().remove(key);
        self.data
            .insert(key.to_string(), CacheEntry::new(value, ttl))
            .await;
        self.stats.write().sets += 1;
        Ok(())
    }

    async fn del(&self, key: &str) -> CacheResult<()> {
        debug!("DEL key={}", key);

        {
            let slot = self.locks.slot(key);
            let _guard = slot.lock().write().await;
            self.queues.lock().remove(key);
            self.data.invalidate(key).await;
        }
        self.locks.release(key);
        self.stats.write().dels += 1;
        Ok(())
    }

    /// True only for a live value; a queue is not a readable value
    async fn exists(&self, key: &str) -> CacheResult<bool> {
        let slot = self.locks.slot(key);
        let _guard = slot.lock().read().await;
        Ok(self
            .data
            .get(key)
            .await
            .is_some_and(|entry| !entry.is_expired()))
    }

    async fn incr(&self, key: &str) -> CacheResult<i64> {
        debug!("INCR key={}", key);

        // Counter traffic uses its own lock name so it does not contend with
        // plain get/set on the same key.
        let slot = self.locks.slot(&format!("incr:{}", key));
        let _guard = slot.lock().write().await;

        if self.holds_queue(key) {
            return Err(CacheError::TypeMismatch(format!(
                "key {} holds a queue",
                key
            )));
        }
        let current = match self.data.get(key).await {
            Some(entry) if !entry.is_expired() => counter_of(&entry.value)?,
            _ => 0,
        };

        let next = current.checked_add(1).ok_or_else(|| {
            CacheError::TypeMismatch(format!("counter {} would overflow", key))
        })?;
        self.data
            .insert(key.to_string(), CacheEntry::persistent(counter_value(next)?))
            .await;
        Ok(next)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> CacheResult<()> {
        debug!("EXPIRE key={}, ttl={:?}", key, ttl);

        let slot = self.locks.slot(&format!("expire:{}", key));
        let _guard = slot.lock().write().await;

        if self.holds_queue(key) {
            return Err(CacheError::TypeMismatch(format!(
                "queue {} cannot expire",
                key
            )));
        }
        match self.data.get(key).await {
            Some(entry) if !entry.is_expired() => {
                let refreshed = CacheEntry::new(entry.value, ttl);
                self.data.insert(key.to_string(), refreshed).await;
                Ok(())
            }
            _ => Err(CacheError::Miss(key.to_string())),
        }
    }

    async fn rpush(&self, key: &str, value: V) -> CacheResult<()> {
        debug!("RPUSH key={}", key);

        let slot = self.locks.slot(key);
        {
            let _guard = slot.lock().write().await;
            match self.data.get(key).await {
                Some(entry) if !entry.is_expired() => {
                    return Err(CacheError::TypeMismatch(format!(
                        "key {} holds a value, not a queue",
                        key
                    )));
                }
                Some(_) => self.data.invalidate(key).await,
                None => {}
            }
            self.queues
                .lock()
                .entry(key.to_string())
                .or_default()
                .push_back(value);
        }

        self.stats.write().pushes += 1;
        slot.notify().notify_one();
        Ok(())
    }

    async fn brpop(&self, timeout: Duration, key: &str) -> CacheResult<V> {
        debug!("BRPOP key={}, timeout={:?}", key, timeout);

        let slot = self.locks.slot(key);
        let deadline = (!timeout.is_zero()).then(|| tokio::time::Instant::now() + timeout);

        loop {
            {
                let _guard = slot.lock().write().await;
                if let Some(value) = self.pop_front(key).await? {
                    self.stats.write().pops += 1;
                    return Ok(value);
                }
            }

            let notified = slot.notify().notified();
            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        debug!("BRPOP timed out: key={}", key);
                        return Err(CacheError::Timeout(key.to_string()));
                    }
                }
                None => notified.await,
            }
        }
    }

    fn is_initialized(&self) -> bool {
        true
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> MemoryBackend<String> {
        MemoryBackend::new(MemoryConfig::default())
    }

    #[tokio::test]
    async fn test_set_get() {
        let store = backend();
        store
            .set("key1", "value1".to_string(), Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(store.get("key1").await.unwrap(), "value1");
    }

    #[tokio::test]
    async fn test_get_nonexistent() {
        let store = backend();
        let result = store.get("nonexistent").await;
        assert_eq!(result, Err(CacheError::Miss("nonexistent".to_string())));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let store = backend();
        store
            .set("key1", "value1".to_string(), Duration::ZERO)
            .await
            .unwrap();

        store.del("key1").await.unwrap();
        store.del("key1").await.unwrap();
        assert!(!store.exists("key1").await.unwrap());
        assert!(store.get("key1").await.unwrap_err().is_miss());
    }

    #[tokio::test]
    async fn test_ttl_expiration() {
        let store = backend();
        store
            .set("key1", "value1".to_string(), Duration::from_millis(100))
            .await
            .unwrap();
        assert!(store.exists("key1").await.unwrap());

        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(!store.exists("key1").await.unwrap());
        assert!(store.get("key1").await.unwrap_err().is_miss());
    }

    #[tokio::test]
    async fn test_zero_ttl_never_expires() {
        let store = backend();
        store
            .set("forever", "v".to_string(), Duration::ZERO)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;
        store.run_pending_tasks().await;
        assert_eq!(store.get("forever").await.unwrap(), "v");
    }

    #[tokio::test]
    async fn test_incr_from_absent() {
        let store = backend();
        assert_eq!(store.incr("counter").await.unwrap(), 1);
        assert_eq!(store.incr("counter").await.unwrap(), 2);
        assert_eq!(store.get("counter").await.unwrap(), "2");
    }

    #[tokio::test]
    async fn test_incr_coerces_float() {
        let store: MemoryBackend<f64> = MemoryBackend::default();
        store.set("ratio", 4.0, Duration::ZERO).await.unwrap();
        assert_eq!(store.incr("ratio").await.unwrap(), 5);
        assert_eq!(store.get("ratio").await.unwrap(), 5.0);
    }

    #[tokio::test]
    async fn test_incr_rejects_non_numeric() {
        let store = backend();
        store
            .set("name", "alice".to_string(), Duration::ZERO)
            .await
            .unwrap();
        assert!(matches!(
            store.incr("name").await,
            Err(CacheError::TypeMismatch(_))
        ));
    }

    #[tokio::test]
    async fn test_expire_missing_key() {
        let store = backend();
        let result = store.expire("ghost", Duration::from_secs(5)).await;
        assert!(matches!(result, Err(CacheError::Miss(_))));
    }

    #[tokio::test]
    async fn test_expire_keeps_value() {
        let store = backend();
        store
            .set("key", "v".to_string(), Duration::ZERO)
            .await
            .unwrap();
        store.expire("key", Duration::from_millis(150)).await.unwrap();
        assert_eq!(store.get("key").await.unwrap(), "v");

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(store.get("key").await.unwrap_err().is_miss());
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let store = backend();
        for item in ["a", "b", "c"] {
            store.rpush("jobs", item.to_string()).await.unwrap();
        }

        for expected in ["a", "b", "c"] {
            assert_eq!(store.brpop(Duration::ZERO, "jobs").await.unwrap(), expected);
        }
        assert!(!store.exists("jobs").await.unwrap());
    }

    #[tokio::test]
    async fn test_queue_and_value_do_not_mix() {
        let store = backend();
        store.rpush("q", "item".to_string()).await.unwrap();
        assert!(matches!(
            store.get("q").await,
            Err(CacheError::TypeMismatch(_))
        ));

        store
            .set("v", "plain".to_string(), Duration::ZERO)
            .await
            .unwrap();
        assert!(matches!(
            store.rpush("v", "x".to_string()).await,
            Err(CacheError::TypeMismatch(_))
        ));
    }

    #[tokio::test]
    async fn test_queue_is_not_a_value() {
        let store = backend();
        store.rpush("q", "item".to_string()).await.unwrap();

        assert!(!store.exists("q").await.unwrap());
        assert!(matches!(
            store.incr("q").await,
            Err(CacheError::TypeMismatch(_))
        ));
        assert!(matches!(
            store.expire("q", Duration::from_secs(5)).await,
            Err(CacheError::TypeMismatch(_))
        ));
        assert_eq!(store.queue_len("q"), 1);
    }

    #[tokio::test]
    async fn test_set_replaces_queue() {
        let store = backend();
        store.rpush("k", "queued".to_string()).await.unwrap();
        store
            .set("k", "plain".to_string(), Duration::ZERO)
            .await
            .unwrap();

        assert_eq!(store.get("k").await.unwrap(), "plain");
        assert_eq!(store.queue_len("k"), 0);
    }

    #[tokio::test]
    async fn test_push_onto_expired_value() {
        let store = backend();
        store
            .set("k", "old".to_string(), Duration::from_millis(50))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        store.rpush("k", "job".to_string()).await.unwrap();
        assert_eq!(store.brpop(Duration::ZERO, "k").await.unwrap(), "job");
    }

    #[tokio::test]
    async fn test_capacity_eviction_keeps_queued_items() {
        let store: MemoryBackend<String> = MemoryBackend::new(MemoryConfig {
            max_capacity: Some(10),
        });
        store.rpush("q", "job".to_string()).await.unwrap();

        for i in 0..1000 {
            store
                .set(&format!("k{}", i), "v".to_string(), Duration::ZERO)
                .await
                .unwrap();
        }
        store.run_pending_tasks().await;

        assert_eq!(store.queue_len("q"), 1);
        assert_eq!(
            store.brpop(Duration::from_millis(100), "q").await.unwrap(),
            "job"
        );
    }

    #[tokio::test]
    async fn test_brpop_timeout() {
        let store = backend();
        let start = std::time::Instant::now();
        let result = store.brpop(Duration::from_millis(200), "empty").await;
        let elapsed = start.elapsed();

        assert_eq!(result, Err(CacheError::Timeout("empty".to_string())));
        assert!(elapsed >= Duration::from_millis(195));
        assert!(elapsed < Duration::from_millis(600));
    }

    #[tokio::test]
    async fn test_del_removes_queue() {
        let store = backend();
        store.rpush("q", "item".to_string()).await.unwrap();
        store.del("q").await.unwrap();
        let result = store.brpop(Duration::from_millis(50), "q").await;
        assert!(result.unwrap_err().is_miss());
    }

    #[tokio::test]
    async fn test_stats() {
        let store = backend();
        store
            .set("key1", "value1".to_string(), Duration::ZERO)
            .await
            .unwrap();
        store.get("key1").await.unwrap();
        let _ = store.get("key2").await;

        let stats = store.stats();
        assert_eq!(stats.sets, 1);
        assert_eq!(stats.gets, 2);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hit_rate(), 0.5);
    }

    #[tokio::test]
    async fn test_lock_state_released_after_use() {
        let store = backend();
        store
            .set("a", "1".to_string(), Duration::ZERO)
            .await
            .unwrap();
        store.get("a").await.unwrap();
        store.del("a").await.unwrap();
        assert_eq!(store.tracked_keys(), 0);
    }
}
