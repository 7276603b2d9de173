use thiserror::Error;

/// Main error type for cache operations
///
/// `Clone` so a single in-flight load can hand the same outcome to every
/// caller waiting on it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Cache miss: {0}")]
    Miss(String),

    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Timed out waiting on queue: {0}")]
    Timeout(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(&'static str),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Loader failed: {0}")]
    Loader(String),

    #[error("Invalid cache name: {0}")]
    InvalidName(String),
}

impl CacheError {
    /// True for the "not found" family: a plain miss or an expired `brpop` wait.
    ///
    /// Callers treat both the same way: fall back to a default or a loader.
    pub fn is_miss(&self) -> bool {
        matches!(self, Self::Miss(_) | Self::Timeout(_))
    }
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<sqlx::Error> for CacheError {
    fn from(err: sqlx::Error) -> Self {
        Self::Io(format!("sqlite: {}", err))
    }
}

impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_refusal() || err.is_connection_dropped() || err.is_timeout() {
            Self::BackendUnavailable(format!("redis: {}", err))
        } else {
            Self::Io(format!("redis: {}", err))
        }
    }
}

/// Result type alias for cache operations
pub type CacheResult<T> = std::result::Result<T, CacheError>;
