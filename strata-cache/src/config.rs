use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::{CacheError, CacheResult, MemoryConfig};

/// Port used when the remote address has none
pub const DEFAULT_REDIS_PORT: u16 = 6379;

/// Main cache configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StrataConfig {
    pub storage: StorageConfig,
    pub memory: MemoryConfig,
    pub remote: RemoteConfig,
    pub logging: LoggingConfig,
}

/// Where durable backends keep their files
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding `<name>.db` and `<name>.json` files
    pub data_dir: PathBuf,
    /// Sleep between queue polls of the SQLite backend
    pub poll_interval_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/cache"),
            poll_interval_ms: 50,
        }
    }
}

impl StorageConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// Remote (Redis-protocol) tier; no address means the tier is omitted
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// `host:port`
    pub address: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub database: i64,
    pub connect_timeout_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            address: None,
            username: None,
            password: None,
            database: 0,
            connect_timeout_secs: 5,
        }
    }
}

impl RemoteConfig {
    fn configured_address(&self) -> Option<&str> {
        self.address
            .as_deref()
            .map(str::trim)
            .filter(|a| !a.is_empty())
    }

    /// Whether an address is set, i.e. the remote tier should be built
    pub fn is_configured(&self) -> bool {
        self.configured_address().is_some()
    }

    /// Host and port parsed from `address`
    ///
    /// Accepts `host`, `host:port` and `[v6]:port`. `None` when unset or the
    /// port is not a valid number.
    pub fn endpoint(&self) -> Option<(String, u16)> {
        let address = self.configured_address()?;
        if let Some(rest) = address.strip_prefix('[') {
            let (host, tail) = rest.split_once(']')?;
            let port = match tail {
                "" => DEFAULT_REDIS_PORT,
                tail => tail.strip_prefix(':')?.parse().ok()?,
            };
            return Some((host.to_string(), port));
        }
        match address.rsplit_once(':') {
            None => Some((address.to_string(), DEFAULT_REDIS_PORT)),
            Some((host, port)) if !host.is_empty() && !host.contains(':') => {
                Some((host.to_string(), port.parse().ok()?))
            }
            Some(_) => None,
        }
    }

    /// Structured connection parameters
    ///
    /// Credentials are passed as-is, never embedded in a URL, so reserved
    /// characters in a password need no escaping.
    pub fn connection_info(&self) -> CacheResult<redis::ConnectionInfo> {
        let address = self.configured_address().ok_or_else(|| {
            CacheError::BackendUnavailable("remote address not configured".to_string())
        })?;
        let (host, port) = self.endpoint().ok_or_else(|| {
            CacheError::BackendUnavailable(format!("invalid remote address {}", address))
        })?;

        Ok(redis::ConnectionInfo {
            addr: redis::ConnectionAddr::Tcp(host, port),
            redis: redis::RedisConnectionInfo {
                db: self.database,
                username: self.username.clone(),
                password: self.password.clone(),
                ..Default::default()
            },
        })
    }

    /// URL form for logs; the password is always masked
    pub fn display_url(&self) -> Option<String> {
        let address = self.configured_address()?;
        let credentials = match (self.username.as_deref(), self.password.is_some()) {
            (Some(user), true) => format!("{}:***@", user),
            (Some(user), false) => format!("{}@", user),
            (None, true) => ":***@".to_string(),
            (None, false) => String::new(),
        };
        Some(format!(
            "redis://{}{}/{}",
            credentials, address, self.database
        ))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// `pretty` or `json`
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl StrataConfig {
    /// Load configuration from YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: StrataConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Defaults overlaid with the process environment
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env(|name| std::env::var(name).ok());
        config
    }

    /// Overlay environment variables read through `lookup`
    ///
    /// `STRATA_DATA_DIR`, `STRATA_REDIS_ADDR`, `STRATA_REDIS_USERNAME`,
    /// `STRATA_REDIS_PASSWORD`, `STRATA_REDIS_DB`. Empty values are ignored; an
    /// unparsable database index leaves the current one.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(dir) = var("STRATA_DATA_DIR") {
            self.storage.data_dir = PathBuf::from(dir);
        }
        if let Some(address) = var("STRATA_REDIS_ADDR") {
            self.remote.address = Some(address);
        }
        if let Some(username) = var("STRATA_REDIS_USERNAME") {
            self.remote.username = Some(username);
        }
        if let Some(password) = var("STRATA_REDIS_PASSWORD") {
            self.remote.password = Some(password);
        }
        if let Some(db) = var("STRATA_REDIS_DB").and_then(|v| v.trim().parse().ok()) {
            self.remote.database = db;
        }
    }
}
