//! Strata: tiered cache and blocking-queue engine
//!
//! Backends (in-process, SQLite, JSON file, Redis) share one async contract,
//! [`CacheBackend`]. [`TieredCache`] layers them fastest first with
//! single-flight loading; [`CacheRegistry`] opens named persistent stores.

pub mod cache;
pub mod config;
pub mod core;
pub mod registry;
pub mod tiered;

// Re-export commonly used types
pub use cache::{FileBackend, FileStore, MemoryBackend, RemoteBackend, SqliteBackend, SqliteStore};
pub use config::{LoggingConfig, RemoteConfig, StorageConfig, StrataConfig};
pub use core::{
    CacheBackend, CacheEntry, CacheError, CacheResult, CacheValue, MemoryConfig, MemoryStats,
};
pub use registry::{CacheRegistry, validate_name};
pub use tiered::{Loader, Tier, TieredCache, TieredCacheBuilder, TieredStats};
