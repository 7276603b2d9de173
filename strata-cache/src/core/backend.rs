//! Cache contract shared by every storage backend
//!
//! Every backend (in-process, SQLite, file snapshot, remote) implements
//! [`CacheBackend`]. The tiered coordinator only sees `Arc<dyn CacheBackend<V>>`,
//! so backends can be mixed freely in one tier list.

use super::error::CacheResult;
use async_trait::async_trait;
use std::time::Duration;

/// Operations every cache backend provides
///
/// Misses are always reported as [`CacheError::Miss`](super::CacheError::Miss),
/// never as a default value. A zero `ttl` means "never expires" on every
/// backend.
#[async_trait]
pub trait CacheBackend<V>: Send + Sync
where
    V: Send + Sync + 'static,
{
    /// Get a live value, or `Miss` if absent or expired
    async fn get(&self, key: &str) -> CacheResult<V>;

    /// Store a value; `ttl` of zero means never expires
    async fn set(&self, key: &str, value: V, ttl: Duration) -> CacheResult<()>;

    /// Remove a key; succeeds when the key is already absent
    async fn del(&self, key: &str) -> CacheResult<()>;

    /// True iff `get` would succeed
    async fn exists(&self, key: &str) -> CacheResult<bool>;

    /// Increment a counter, treating an absent key as 0; returns the new value
    async fn incr(&self, key: &str) -> CacheResult<i64>;

    /// Rewrite the expiration of an existing key; `Miss` if absent
    async fn expire(&self, key: &str, ttl: Duration) -> CacheResult<()>;

    /// Append a value to the tail of the queue stored at `key`
    async fn rpush(&self, key: &str, value: V) -> CacheResult<()>;

    /// Pop the head of the queue at `key`, waiting up to `timeout`
    ///
    /// A zero `timeout` waits indefinitely. Expiry of the wait is reported as
    /// [`CacheError::Timeout`](super::CacheError::Timeout).
    async fn brpop(&self, timeout: Duration, key: &str) -> CacheResult<V>;

    /// Whether the backend holds a usable store handle
    fn is_initialized(&self) -> bool;

    /// Short backend name for logs
    fn backend_name(&self) -> &'static str;
}
