//! Named store registry
//!
//! Opens each persistent store once per logical name and hands out typed
//! backends sharing it. Owns the optional remote handle.

use crate::cache::{
    FileBackend, FileStore, MemoryBackend, RemoteBackend, SqliteBackend, SqliteStore,
};
use crate::config::StrataConfig;
use crate::core::backend::CacheBackend;
use crate::core::error::{CacheError, CacheResult};
use crate::core::types::CacheValue;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

pub struct CacheRegistry {
    config: StrataConfig,
    sqlite: Mutex<HashMap<String, Arc<SqliteStore>>>,
    files: Mutex<HashMap<String, Arc<FileStore>>>,
    remote: Option<RemoteBackend>,
}

impl CacheRegistry {
    /// Registry without a remote tier
    pub fn new(config: StrataConfig) -> Self {
        Self {
            config,
            sqlite: Mutex::new(HashMap::new()),
            files: Mutex::new(HashMap::new()),
            remote: None,
        }
    }

    /// Registry that also connects the remote tier when an address is configured
    ///
    /// A failed connection leaves an uninitialized remote handle.
    pub async fn connect(config: StrataConfig) -> Self {
        let remote = if config.remote.is_configured() {
            Some(RemoteBackend::connect_graceful(&config.remote).await)
        } else {
            debug!("No remote address configured, remote tier omitted");
            None
        };

        info!(
            data_dir = %config.storage.data_dir.display(),
            remote = remote.as_ref().map(|r| r.is_initialized()).unwrap_or(false),
            "Cache registry ready"
        );

        Self {
            remote,
            ..Self::new(config)
        }
    }

    pub fn config(&self) -> &StrataConfig {
        &self.config
    }

    pub fn data_dir(&self) -> &Path {
        &self.config.storage.data_dir
    }

    /// SQLite backend for `name`, opening `<data_dir>/<name>.db` on first use
    pub async fn sqlite<V: CacheValue>(&self, name: &str) -> CacheResult<SqliteBackend<V>> {
        validate_name(name)?;
        let mut stores = self.sqlite.lock().await;
        if let Some(store) = stores.get(name) {
            return Ok(SqliteBackend::new(Arc::clone(store)));
        }

        let path = self.store_path(name, "db");
        let store = Arc::new(
            SqliteStore::open(name, &path, self.config.storage.poll_interval()).await?,
        );
        stores.insert(name.to_string(), Arc::clone(&store));
        Ok(SqliteBackend::new(store))
    }

    /// File backend for `name`, loading `<data_dir>/<name>.json` on first use
    pub async fn file<V: CacheValue>(&self, name: &str) -> CacheResult<FileBackend<V>> {
        validate_name(name)?;
        let mut stores = self.files.lock().await;
        if let Some(store) = stores.get(name) {
            return Ok(FileBackend::new(Arc::clone(store)));
        }

        let path = self.store_path(name, "json");
        let store = Arc::new(FileStore::open(name, &path).await?);
        stores.insert(name.to_string(), Arc::clone(&store));
        Ok(FileBackend::new(store))
    }

    /// Fresh in-process backend built from the memory config
    pub fn memory<V: CacheValue>(&self) -> MemoryBackend<V> {
        MemoryBackend::new(self.config.memory.clone())
    }

    pub fn remote(&self) -> Option<RemoteBackend> {
        self.remote.clone()
    }

    /// Names of the SQLite stores opened so far
    pub async fn open_sqlite_stores(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sqlite.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Close every SQLite pool; backends handed out afterwards fail
    pub async fn close(&self) {
        for store in self.sqlite.lock().await.drain().map(|(_, s)| s) {
            store.close().await;
        }
        self.files.lock().await.clear();
    }

    fn store_path(&self, name: &str, extension: &str) -> PathBuf {
        self.config
            .storage
            .data_dir
            .join(format!("{}.{}", name, extension))
    }
}

/// Store names map to a single file, so only `[A-Za-z0-9_-]` is allowed
pub fn validate_name(name: &str) -> CacheResult<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(CacheError::InvalidName(name.to_string()))
    }
}
