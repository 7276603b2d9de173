//! Remote backend over a Redis-protocol server
//!
//! Uses `redis::aio::ConnectionManager` for multiplexed connections with
//! automatic reconnection. Values are plain strings. Blocking pops run on a
//! dedicated connection so they never stall the shared one.

use crate::config::RemoteConfig;
use crate::core::backend::CacheBackend;
use crate::core::error::{CacheError, CacheResult};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::time::Duration;
use tracing::{debug, info, warn};

/// INCR, falling back to numeric coercion when the stored text is a float
const INCR_SCRIPT: &str = r#"
local res = redis.pcall('INCR', KEYS[1])
if type(res) == 'number' then return res end
local n = tonumber(redis.call('GET', KEYS[1]))
if not n then return redis.error_reply('ERR value is not numeric') end
if n >= 0 then n = math.floor(n) else n = math.ceil(n) end
n = n + 1
redis.call('SET', KEYS[1], string.format('%d', n), 'KEEPTTL')
return n
"#;

/// PEXPIRE / PERSIST that reports whether the key existed
const EXPIRE_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then return 0 end
local ms = tonumber(ARGV[1])
if ms > 0 then redis.call('PEXPIRE', KEYS[1], ms) else redis.call('PERSIST', KEYS[1]) end
return 1
"#;

struct Connected {
    client: redis::Client,
    manager: ConnectionManager,
}

/// Redis-backed cache tier with string values
#[derive(Clone)]
pub struct RemoteBackend {
    connected: Option<std::sync::Arc<Connected>>,
    url: String,
}

impl std::fmt::Debug for RemoteBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteBackend")
            .field("url", &self.url)
            .field("initialized", &self.connected.is_some())
            .finish()
    }
}

impl RemoteBackend {
    /// Connect using the configured address
    ///
    /// Fails with `BackendUnavailable` when no address is configured or the
    /// server cannot be reached within `connect_timeout_secs`.
    pub async fn connect(config: &RemoteConfig) -> CacheResult<Self> {
        let info = config.connection_info()?;
        let redacted = config.display_url().unwrap_or_default();

        let client = redis::Client::open(info).map_err(|e| {
            CacheError::BackendUnavailable(format!("invalid redis target {}: {}", redacted, e))
        })?;

        let timeout = Duration::from_secs(config.connect_timeout_secs.max(1));
        let manager = tokio::time::timeout(timeout, ConnectionManager::new(client.clone()))
            .await
            .map_err(|_| {
                CacheError::BackendUnavailable(format!("connect to {} timed out", redacted))
            })?
            .map_err(|e| {
                CacheError::BackendUnavailable(format!("connect to {}: {}", redacted, e))
            })?;

        info!(url = %redacted, "Remote cache backend connected");

        Ok(Self {
            connected: Some(std::sync::Arc::new(Connected { client, manager })),
            url: redacted,
        })
    }

    /// Connect, degrading to an uninitialized handle on failure
    pub async fn connect_graceful(config: &RemoteConfig) -> Self {
        match Self::connect(config).await {
            Ok(backend) => backend,
            Err(e) => {
                warn!("Remote cache backend unavailable: {}", e);
                Self::disconnected(config.display_url().unwrap_or_default())
            }
        }
    }

    /// Handle with no connection; every operation reports `BackendUnavailable`
    pub fn disconnected(url: impl Into<String>) -> Self {
        Self {
            connected: None,
            url: url.into(),
        }
    }

    /// URL this backend points at, password masked
    pub fn url(&self) -> &str {
        &self.url
    }

    fn manager(&self) -> CacheResult<ConnectionManager> {
        self.connected
            .as_ref()
            .map(|c| c.manager.clone())
            .ok_or_else(|| {
                CacheError::BackendUnavailable("remote backend not initialized".to_string())
            })
    }

    /// Check connectivity with PING
    pub async fn ping(&self) -> CacheResult<bool> {
        let mut conn = self.manager()?;
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(pong == "PONG")
    }
}

#[async_trait]
impl CacheBackend<String> for RemoteBackend {
    async fn get(&self, key: &str) -> CacheResult<String> {
        let mut conn = self.manager()?;
        let result: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;

        match result {
            Some(value) => {
                debug!(key = key, "Cache HIT (remote)");
                Ok(value)
            }
            None => {
                debug!(key = key, "Cache MISS (remote)");
                Err(CacheError::Miss(key.to_string()))
            }
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> CacheResult<()> {
        let mut conn = self.manager()?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if !ttl.is_zero() {
            cmd.arg("PX").arg(ttl.as_millis().max(1) as u64);
        }
        cmd.query_async::<()>(&mut conn).await?;

        debug!(key = key, ttl_ms = ttl.as_millis() as u64, "Cache SET (remote)");
        Ok(())
    }

    async fn del(&self, key: &str) -> CacheResult<()> {
        let mut conn = self.manager()?;
        redis::cmd("DEL")
            .arg(key)
            .query_async::<()>(&mut conn)
            .await?;
        debug!(key = key, "Cache DEL (remote)");
        Ok(())
    }

    async fn exists(&self, key: &str) -> CacheResult<bool> {
        let mut conn = self.manager()?;
        let count: i64 = redis::cmd("EXISTS").arg(key).query_async(&mut conn).await?;
        Ok(count > 0)
    }

    async fn incr(&self, key: &str) -> CacheResult<i64> {
        let mut conn = self.manager()?;
        redis::Script::new(INCR_SCRIPT)
            .key(key)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| match e.kind() {
                redis::ErrorKind::ResponseError => CacheError::TypeMismatch(e.to_string()),
                _ => e.into(),
            })
    }

    async fn expire(&self, key: &str, ttl: Duration) -> CacheResult<()> {
        let mut conn = self.manager()?;
        let existed: i64 = redis::Script::new(EXPIRE_SCRIPT)
            .key(key)
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;

        if existed == 0 {
            return Err(CacheError::Miss(key.to_string()));
        }
        Ok(())
    }

    async fn rpush(&self, key: &str, value: String) -> CacheResult<()> {
        let mut conn = self.manager()?;
        redis::cmd("RPUSH")
            .arg(key)
            .arg(value)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn brpop(&self, timeout: Duration, key: &str) -> CacheResult<String> {
        let connected = self.connected.as_ref().ok_or_else(|| {
            CacheError::BackendUnavailable("remote backend not initialized".to_string())
        })?;

        // Head of the list, so RPUSH + BLPOP keeps FIFO order.
        let mut conn = connected.client.get_multiplexed_async_connection().await?;
        let popped: Option<(String, String)> = redis::cmd("BLPOP")
            .arg(key)
            .arg(timeout.as_secs_f64())
            .query_async(&mut conn)
            .await?;

        popped
            .map(|(_, value)| value)
            .ok_or_else(|| CacheError::Timeout(key.to_string()))
    }

    fn is_initialized(&self) -> bool {
        self.connected.is_some()
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_with_bad_port() {
        let config = RemoteConfig {
            address: Some("localhost:notaport".to_string()),
            ..Default::default()
        };
        let result = RemoteBackend::connect(&config).await;
        assert!(matches!(result, Err(CacheError::BackendUnavailable(_))));
    }

    #[tokio::test]
    async fn test_disconnected_reports_unavailable() {
        let backend = RemoteBackend::disconnected("redis://nowhere");
        assert!(!backend.is_initialized());
        assert!(matches!(
            backend.get("k").await,
            Err(CacheError::BackendUnavailable(_))
        ));
        assert!(matches!(
            backend.brpop(Duration::from_millis(10), "k").await,
            Err(CacheError::BackendUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_without_address() {
        let result = RemoteBackend::connect(&RemoteConfig::default()).await;
        assert!(matches!(result, Err(CacheError::BackendUnavailable(_))));
    }

    // Integration tests require a running Redis instance (behind redis-tests feature)
    #[cfg(feature = "redis-tests")]
    mod integration {
        use super::*;

        async fn connect() -> Option<RemoteBackend> {
            let mut config = RemoteConfig::default();
            config.address = Some(
                std::env::var("STRATA_REDIS_ADDR").unwrap_or_else(|_| "127.0.0.1:6379".to_string()),
            );
            match RemoteBackend::connect(&config).await {
                Ok(backend) => Some(backend),
                Err(e) => {
                    warn!("Skipping Redis test (not available): {}", e);
                    None
                }
            }
        }

        fn unique(prefix: &str) -> String {
            format!("strata:test:{}:{}", prefix, uuid::Uuid::new_v4())
        }

        #[tokio::test]
        async fn test_redis_crud_and_expiry() {
            let Some(backend) = connect().await else { return };
            let key = unique("crud");

            backend
                .set(&key, "value".to_string(), Duration::from_millis(500))
                .await
                .unwrap();
            assert_eq!(backend.get(&key).await.unwrap(), "value");
            assert!(backend.exists(&key).await.unwrap());

            tokio::time::sleep(Duration::from_millis(800)).await;
            assert!(backend.get(&key).await.unwrap_err().is_miss());
        }

        #[tokio::test]
        async fn test_redis_incr_coerces_float() {
            let Some(backend) = connect().await else { return };
            let key = unique("incr");

            assert_eq!(backend.incr(&key).await.unwrap(), 1);
            backend
                .set(&key, "4.0".to_string(), Duration::ZERO)
                .await
                .unwrap();
            assert_eq!(backend.incr(&key).await.unwrap(), 5);
            backend.del(&key).await.unwrap();
        }

        #[tokio::test]
        async fn test_redis_expire_missing() {
            let Some(backend) = connect().await else { return };
            let result = backend.expire(&unique("ghost"), Duration::from_secs(1)).await;
            assert!(matches!(result, Err(CacheError::Miss(_))));
        }

        #[tokio::test]
        async fn test_redis_queue_fifo() {
            let Some(backend) = connect().await else { return };
            let key = unique("queue");

            for item in ["a", "b", "c"] {
                backend.rpush(&key, item.to_string()).await.unwrap();
            }
            for expected in ["a", "b", "c"] {
                assert_eq!(
                    backend.brpop(Duration::from_secs(1), &key).await.unwrap(),
                    expected
                );
            }
            let result = backend.brpop(Duration::from_millis(200), &key).await;
            assert!(matches!(result, Err(CacheError::Timeout(_))));
        }
    }
}
