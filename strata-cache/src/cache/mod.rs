//! Cache Backends
//!
//! Every backend implements [`CacheBackend`](crate::core::CacheBackend):
//! - Memory: in-process expiring map with blocking queues
//! - SQLite: durable single-file store, polled queues
//! - File: JSON snapshot, no queues
//! - Remote: Redis-protocol server, string values

pub mod file;
pub mod memory;
pub mod remote;
pub mod sqlite;

pub use file::{FileBackend, FileStore};
pub use memory::MemoryBackend;
pub use remote::RemoteBackend;
pub use sqlite::{DEFAULT_POLL_INTERVAL, SqliteBackend, SqliteStore};
