//! File-snapshot backend
//!
//! Keeps the whole key space in memory and rewrites one JSON document per
//! cache name after every mutation:
//!
//! ```json
//! { "user:1": { "value": {"name": "alice"}, "expiration": 1735689600 } }
//! ```
//!
//! Expirations are tracked in milliseconds in memory and written to the file
//! as unix seconds, rounded up, so a reloaded entry may outlive its TTL by
//! under a second. Reads check expiration but never delete; expired entries
//! are swept on the next mutation. Queue operations are not supported.

use crate::core::backend::CacheBackend;
use crate::core::error::{CacheError, CacheResult};
use crate::core::types::{
    CacheEntry, CacheValue, coerce_i64, counter_value, decode_value, expiration_from_secs,
    expiration_from_ttl, expiration_to_secs,
};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

type Snapshot = HashMap<String, CacheEntry<Value>>;

/// In-memory key space mirrored to a JSON file
pub struct FileStore {
    name: String,
    path: PathBuf,
    data: RwLock<Snapshot>,
}

impl std::fmt::Debug for FileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStore")
            .field("name", &self.name)
            .field("path", &self.path)
            .finish()
    }
}

impl FileStore {
    /// Open the snapshot at `path`, loading it if present
    ///
    /// Expired entries in an existing file are dropped on load. A file that
    /// is not a valid snapshot is reported as an I/O error.
    pub async fn open(name: &str, path: impl AsRef<Path>) -> CacheResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut data = match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.is_empty() => Snapshot::new(),
            Ok(bytes) => serde_json::from_slice::<Snapshot>(&bytes).map_err(|e| {
                CacheError::Io(format!("corrupt snapshot {}: {}", path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Snapshot::new(),
            Err(e) => return Err(e.into()),
        };

        for entry in data.values_mut() {
            entry.expiration = expiration_from_secs(entry.expiration);
        }
        let loaded = data.len();
        data.retain(|_, entry| !entry.is_expired());
        info!(
            "Opened file cache '{}' at {:?} ({} keys, {} expired dropped)",
            name,
            path,
            data.len(),
            loaded - data.len()
        );

        Ok(Self {
            name: name.to_string(),
            path,
            data: RwLock::new(data),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Live JSON value at `key`
    pub async fn get(&self, key: &str) -> CacheResult<Value> {
        let data = self.data.read().await;
        match data.get(key) {
            Some(entry) if !entry.is_expired() => Ok(entry.value.clone()),
            _ => Err(CacheError::Miss(key.to_string())),
        }
    }

    /// Number of entries currently held, expired ones included until swept
    pub async fn len(&self) -> usize {
        self.data.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Apply a mutation, sweep expired entries and rewrite the file
    ///
    /// The mutation runs on a copy that replaces the live key space only once
    /// the file is written, so a failed `apply` or a failed write leaves both
    /// untouched.
    pub async fn mutate<R, F>(&self, apply: F) -> CacheResult<R>
    where
        F: FnOnce(&mut Snapshot) -> CacheResult<R> + Send,
    {
        let mut data = self.data.write().await;
        let mut next = data.clone();
        let result = apply(&mut next)?;

        let before = next.len();
        next.retain(|_, entry| !entry.is_expired());
        if next.len() < before {
            debug!("Swept {} expired keys from '{}'", before - next.len(), self.name);
        }

        self.persist(&next).await?;
        *data = next;
        Ok(result)
    }

    /// Write the snapshot to a temp file, then rename it over the old one
    async fn persist(&self, data: &Snapshot) -> CacheResult<()> {
        let on_disk: HashMap<&str, CacheEntry<&Value>> = data
            .iter()
            .map(|(key, entry)| {
                let stored = CacheEntry {
                    value: &entry.value,
                    expiration: expiration_to_secs(entry.expiration),
                };
                (key.as_str(), stored)
            })
            .collect();
        let json = serde_json::to_vec(&on_disk)?;
        let tmp = self.path.with_extension("json.tmp");

        if let Err(e) = tokio::fs::write(&tmp, &json).await {
            warn!("Failed to write snapshot {:?}: {}", tmp, e);
            return Err(e.into());
        }
        if let Err(e) = tokio::fs::rename(&tmp, &self.path).await {
            warn!("Failed to replace snapshot {:?}: {}", self.path, e);
            return Err(e.into());
        }
        Ok(())
    }
}

/// Typed handle over a shared [`FileStore`]
pub struct FileBackend<V> {
    store: Arc<FileStore>,
    _value: PhantomData<fn() -> V>,
}

impl<V> Clone for FileBackend<V> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            _value: PhantomData,
        }
    }
}

impl<V: CacheValue> FileBackend<V> {
    pub fn new(store: Arc<FileStore>) -> Self {
        Self {
            store,
            _value: PhantomData,
        }
    }

    /// Open a private store at `path`
    pub async fn open(name: &str, path: impl AsRef<Path>) -> CacheResult<Self> {
        Ok(Self::new(Arc::new(FileStore::open(name, path).await?)))
    }

    pub fn store(&self) -> &Arc<FileStore> {
        &self.store
    }
}

#[async_trait]
impl<V: CacheValue> CacheBackend<V> for FileBackend<V> {
    async fn get(&self, key: &str) -> CacheResult<V> {
        decode_value(self.store.get(key).await?)
    }

    async fn set(&self, key: &str, value: V, ttl: Duration) -> CacheResult<()> {
        let entry = CacheEntry::new(serde_json::to_value(&value)?, ttl);
        let key = key.to_string();
        self.store
            .mutate(move |data| {
                data.insert(key, entry);
                Ok(())
            })
            .await
    }

    async fn del(&self, key: &str) -> CacheResult<()> {
        self.store
            .mutate(|data| {
                data.remove(key);
                Ok(())
            })
            .await
    }

    async fn exists(&self, key: &str) -> CacheResult<bool> {
        match self.store.get(key).await {
            Ok(_) => Ok(true),
            Err(CacheError::Miss(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn incr(&self, key: &str) -> CacheResult<i64> {
        self.store
            .mutate(|data| {
                let (current, expiration) = match data.get(key) {
                    Some(entry) if !entry.is_expired() => {
                        let current = coerce_i64(&entry.value).ok_or_else(|| {
                            CacheError::TypeMismatch(format!("value at {} is not numeric", key))
                        })?;
                        (current, entry.expiration)
                    }
                    _ => (0, 0),
                };

                let next = current.checked_add(1).ok_or_else(|| {
                    CacheError::TypeMismatch(format!("counter {} would overflow", key))
                })?;
                let value = serde_json::to_value(counter_value::<V>(next)?)?;
                data.insert(key.to_string(), CacheEntry { value, expiration });
                Ok(next)
            })
            .await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> CacheResult<()> {
        let expiration = expiration_from_ttl(ttl);
        self.store
            .mutate(|data| match data.get_mut(key) {
                Some(entry) if !entry.is_expired() => {
                    entry.expiration = expiration;
                    Ok(())
                }
                _ => Err(CacheError::Miss(key.to_string())),
            })
            .await
    }

    async fn rpush(&self, _key: &str, _value: V) -> CacheResult<()> {
        Err(CacheError::Unsupported("rpush on file backend"))
    }

    async fn brpop(&self, _timeout: Duration, _key: &str) -> CacheResult<V> {
        Err(CacheError::Unsupported("brpop on file backend"))
    }

    fn is_initialized(&self) -> bool {
        true
    }

    fn backend_name(&self) -> &'static str {
        "file"
    }
}
