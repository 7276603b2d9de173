//! Tiered coordinator
//!
//! Composes backends into an ordered hierarchy (fastest first) with an
//! optional loader for total misses.
//!
//! ```text
//! get(key, ttl)
//!   ├─ load already in flight for key? ──> await its shared result
//!   ├─ tier[0] hit ──────────────────────> return
//!   ├─ tier[i] hit ──────────────────────> promote into tier[0..i] with ttl, return
//!   └─ all miss ─────────────────────────> loader(key) -> set in every tier with ttl
//! ```
//!
//! At most one walk/load per key runs at a time; concurrent callers share its
//! outcome, errors included. Loader errors are never cached.

use crate::core::backend::CacheBackend;
use crate::core::error::{CacheError, CacheResult};
use crate::core::types::CacheValue;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Fallback used when every tier misses
pub type Loader<V> = Arc<dyn Fn(String) -> BoxFuture<'static, CacheResult<V>> + Send + Sync>;

/// One tier of the hierarchy
pub type Tier<V> = Arc<dyn CacheBackend<V>>;

type SharedLoad<V> = Shared<BoxFuture<'static, CacheResult<V>>>;

/// Coordinator counters
#[derive(Debug, Default, Clone, Serialize)]
pub struct TieredStats {
    /// Hits per tier, in tier order
    pub hits: Vec<u64>,
    /// Lookups that missed every tier
    pub misses: u64,
    /// Loader invocations
    pub loads: u64,
    /// Loader invocations that failed
    pub load_errors: u64,
    /// Values written into faster tiers after a slower-tier hit
    pub promotions: u64,
    /// Callers that awaited a lookup already in flight
    pub joined: u64,
}

struct Inner<V: CacheValue> {
    tiers: Vec<Tier<V>>,
    loader: Option<Loader<V>>,
    inflight: Mutex<HashMap<String, SharedLoad<V>>>,
    stats: RwLock<TieredStats>,
}

impl<V: CacheValue> Inner<V> {
    /// Walk the tiers, promote on hit, load on total miss
    async fn resolve(&self, key: &str, ttl: Duration) -> CacheResult<V> {
        for (index, tier) in self.tiers.iter().enumerate() {
            if !tier.is_initialized() {
                debug!("Skipping uninitialized tier {} ({})", index, tier.backend_name());
                continue;
            }

            match tier.get(key).await {
                Ok(value) => {
                    debug!(key = key, tier = index, backend = tier.backend_name(), "Tier HIT");
                    self.stats.write().hits[index] += 1;
                    self.promote(key, &value, ttl, index).await;
                    return Ok(value);
                }
                Err(e) if e.is_miss() => continue,
                Err(e) => return Err(e),
            }
        }

        self.stats.write().misses += 1;
        let Some(loader) = &self.loader else {
            debug!(key = key, "Tier MISS, no loader configured");
            return Err(CacheError::Miss(key.to_string()));
        };

        debug!(key = key, "Tier MISS, invoking loader");
        self.stats.write().loads += 1;
        let value = match loader(key.to_string()).await {
            Ok(value) => value,
            Err(e) => {
                self.stats.write().load_errors += 1;
                return Err(e);
            }
        };

        for tier in self.tiers.iter().filter(|t| t.is_initialized()) {
            if let Err(e) = tier.set(key, value.clone(), ttl).await {
                warn!(
                    "Failed to populate {} with loaded key {}: {}",
                    tier.backend_name(),
                    key,
                    e
                );
            }
        }
        Ok(value)
    }

    /// Copy a value found at tier `hit` into every faster tier
    async fn promote(&self, key: &str, value: &V, ttl: Duration, hit: usize) {
        for tier in self.tiers[..hit].iter().filter(|t| t.is_initialized()) {
            match tier.set(key, value.clone(), ttl).await {
                Ok(()) => self.stats.write().promotions += 1,
                Err(e) => warn!(
                    "Failed to promote key {} into {}: {}",
                    key,
                    tier.backend_name(),
                    e
                ),
            }
        }
    }
}

/// Ordered multi-backend cache with single-flight loading
pub struct TieredCache<V: CacheValue> {
    inner: Arc<Inner<V>>,
}

impl<V: CacheValue> Clone for TieredCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V: CacheValue> TieredCache<V> {
    /// Create a coordinator over `tiers` (fastest first)
    pub fn new(tiers: Vec<Tier<V>>, loader: Option<Loader<V>>) -> Self {
        let stats = TieredStats {
            hits: vec![0; tiers.len()],
            ..Default::default()
        };
        debug!(
            "Tiered cache over [{}]",
            tiers
                .iter()
                .map(|t| t.backend_name())
                .collect::<Vec<_>>()
                .join(", ")
        );

        Self {
            inner: Arc::new(Inner {
                tiers,
                loader,
                inflight: Mutex::new(HashMap::new()),
                stats: RwLock::new(stats),
            }),
        }
    }

    pub fn builder() -> TieredCacheBuilder<V> {
        TieredCacheBuilder::default()
    }

    /// Get `key` from the fastest tier holding it, loading on a total miss
    ///
    /// Concurrent calls for the same key share one walk/load. Values found in
    /// a slower tier, or produced by the loader, are written to the faster
    /// tiers with the caller's `ttl`.
    pub async fn get(&self, key: &str, ttl: Duration) -> CacheResult<V> {
        let load = {
            let mut inflight = self.inner.inflight.lock();
            if let Some(existing) = inflight.get(key) {
                self.inner.stats.write().joined += 1;
                existing.clone()
            } else {
                let inner = Arc::clone(&self.inner);
                let owned_key = key.to_string();
                let load = async move {
                    let result = inner.resolve(&owned_key, ttl).await;
                    inner.inflight.lock().remove(&owned_key);
                    result
                }
                .boxed()
                .shared();
                inflight.insert(key.to_string(), load.clone());
                load
            }
        };

        load.await
    }

    /// Write to every tier in order, stopping at the first error
    ///
    /// Tiers written before the failure keep the value.
    pub async fn set(&self, key: &str, value: V, ttl: Duration) -> CacheResult<()> {
        for tier in self.inner.tiers.iter().filter(|t| t.is_initialized()) {
            tier.set(key, value.clone(), ttl).await?;
        }
        Ok(())
    }

    /// Delete from every tier in order, stopping at the first error
    pub async fn delete(&self, key: &str) -> CacheResult<()> {
        for tier in self.inner.tiers.iter().filter(|t| t.is_initialized()) {
            tier.del(key).await?;
        }
        Ok(())
    }

    pub fn tier_count(&self) -> usize {
        self.inner.tiers.len()
    }

    /// Tier at `index` (0 = fastest)
    pub fn tier(&self, index: usize) -> Option<&Tier<V>> {
        self.inner.tiers.get(index)
    }

    pub fn stats(&self) -> TieredStats {
        self.inner.stats.read().clone()
    }

    /// Number of keys with a lookup currently in flight
    pub fn inflight_count(&self) -> usize {
        self.inner.inflight.lock().len()
    }
}

/// Builder for [`TieredCache`]
pub struct TieredCacheBuilder<V: CacheValue> {
    tiers: Vec<Tier<V>>,
    loader: Option<Loader<V>>,
}

impl<V: CacheValue> Default for TieredCacheBuilder<V> {
    fn default() -> Self {
        Self {
            tiers: Vec::new(),
            loader: None,
        }
    }
}

impl<V: CacheValue> TieredCacheBuilder<V> {
    /// Append a tier; call in order from fastest to slowest
    pub fn tier<B>(mut self, backend: B) -> Self
    where
        B: CacheBackend<V> + 'static,
    {
        self.tiers.push(Arc::new(backend));
        self
    }

    /// Append an already shared tier
    pub fn shared_tier(mut self, backend: Tier<V>) -> Self {
        self.tiers.push(backend);
        self
    }

    /// Set the loader invoked when every tier misses
    pub fn loader<F, Fut>(mut self, load: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CacheResult<V>> + Send + 'static,
    {
        self.loader = Some(Arc::new(move |key| load(key).boxed()));
        self
    }

    pub fn build(self) -> TieredCache<V> {
        TieredCache::new(self.tiers, self.loader)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryBackend;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_miss_without_loader() {
        let cache: TieredCache<String> = TieredCache::builder()
            .tier(MemoryBackend::default())
            .build();

        let result = cache.get("absent", Duration::from_secs(60)).await;
        assert_eq!(result, Err(CacheError::Miss("absent".to_string())));
        assert_eq!(cache.stats().misses, 1);
        assert_eq!(cache.inflight_count(), 0);
    }

    #[tokio::test]
    async fn test_loader_populates_every_tier() {
        let fast = MemoryBackend::<String>::default();
        let slow = MemoryBackend::<String>::default();
        let cache = TieredCache::builder()
            .tier(fast.clone())
            .tier(slow.clone())
            .loader(|key| async move { Ok(format!("loaded:{}", key)) })
            .build();

        assert_eq!(
            cache.get("k", Duration::from_secs(60)).await.unwrap(),
            "loaded:k"
        );
        assert_eq!(fast.get("k").await.unwrap(), "loaded:k");
        assert_eq!(slow.get("k").await.unwrap(), "loaded:k");
    }

    #[tokio::test]
    async fn test_loader_error_is_not_cached() {
        let calls = Arc::new(AtomicUsize::new(0));
        let fast = MemoryBackend::<String>::default();
        let counter = Arc::clone(&calls);
        let cache = TieredCache::builder()
            .tier(fast.clone())
            .loader(move |_key| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(CacheError::Loader("upstream down".to_string()))
                }
            })
            .build();

        for _ in 0..2 {
            let result = cache.get("k", Duration::from_secs(60)).await;
            assert_eq!(result, Err(CacheError::Loader("upstream down".to_string())));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!fast.exists("k").await.unwrap());
        assert_eq!(cache.stats().load_errors, 2);
    }

    #[tokio::test]
    async fn test_set_and_delete_fan_out() {
        let fast = MemoryBackend::<i64>::default();
        let slow = MemoryBackend::<i64>::default();
        let cache = TieredCache::builder()
            .tier(fast.clone())
            .tier(slow.clone())
            .build();

        cache.set("n", 7, Duration::ZERO).await.unwrap();
        assert_eq!(fast.get("n").await.unwrap(), 7);
        assert_eq!(slow.get("n").await.unwrap(), 7);

        cache.delete("n").await.unwrap();
        assert!(!fast.exists("n").await.unwrap());
        assert!(!slow.exists("n").await.unwrap());
    }
}
