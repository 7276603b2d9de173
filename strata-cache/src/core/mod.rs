pub mod backend;
pub mod error;
pub mod key_locks;
pub mod types;

pub use backend::CacheBackend;
pub use error::{CacheError, CacheResult};
pub use key_locks::{KeyLocks, KeySlot};
pub use types::{CacheEntry, CacheValue, MemoryConfig, MemoryStats};
