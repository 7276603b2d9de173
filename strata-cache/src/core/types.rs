use super::error::{CacheError, CacheResult};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Anything a backend can store.
///
/// Blanket-implemented; persistent backends go through `serde_json`.
pub trait CacheValue: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> CacheValue for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// Stored value with its absolute expiration
///
/// `expiration` is a unix timestamp in milliseconds, `0` meaning "never expires".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<V> {
    pub value: V,
    #[serde(default)]
    pub expiration: i64,
}

impl<V> CacheEntry<V> {
    /// Create an entry expiring `ttl` from now (zero = never)
    pub fn new(value: V, ttl: Duration) -> Self {
        Self {
            value,
            expiration: expiration_from_ttl(ttl),
        }
    }

    /// Create an entry that never expires
    pub fn persistent(value: V) -> Self {
        Self {
            value,
            expiration: 0,
        }
    }

    /// Check if the entry has expired
    pub fn is_expired(&self) -> bool {
        is_expired_at(self.expiration)
    }

    /// Time left before expiry; `None` for entries that never expire
    pub fn remaining(&self) -> Option<Duration> {
        remaining_until(self.expiration)
    }
}

/// Configuration for the in-process backend
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Upper bound on stored values handed to the expiring map; `None` = unbounded
    ///
    /// Queues are kept outside the bounded map and are never evicted.
    #[serde(default)]
    pub max_capacity: Option<u64>,
}

/// Operation counters for the in-process backend
#[derive(Debug, Default, Clone, Serialize)]
pub struct MemoryStats {
    pub gets: u64,
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub dels: u64,
    pub pushes: u64,
    pub pops: u64,
}

impl MemoryStats {
    /// Calculate hit rate
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Current unix time in milliseconds
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Current unix time in seconds
pub fn now_secs() -> i64 {
    Utc::now().timestamp()
}

/// Absolute expiration (unix milliseconds) for a TTL starting now
///
/// Any non-zero TTL lasts at least one millisecond. A zero TTL yields `0`
/// (never expires).
pub fn expiration_from_ttl(ttl: Duration) -> i64 {
    if ttl.is_zero() {
        return 0;
    }
    let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX).max(1);
    now_millis().saturating_add(ttl_ms)
}

/// Whether an absolute expiration (unix milliseconds, `0` = never) has passed
pub fn is_expired_at(expiration: i64) -> bool {
    expiration != 0 && now_millis() >= expiration
}

/// Time left before an absolute expiration; `None` when it never expires
pub fn remaining_until(expiration: i64) -> Option<Duration> {
    if expiration == 0 {
        return None;
    }
    let left_ms = expiration.saturating_sub(now_millis());
    Some(Duration::from_millis(left_ms.max(0) as u64))
}

/// Millisecond expiration to whole unix seconds, rounded up (`0` stays `0`)
pub fn expiration_to_secs(expiration_ms: i64) -> i64 {
    if expiration_ms == 0 {
        return 0;
    }
    expiration_ms.saturating_add(999).div_euclid(1000)
}

/// Whole-second expiration back to milliseconds (`0` stays `0`)
pub fn expiration_from_secs(expiration_secs: i64) -> i64 {
    expiration_secs.saturating_mul(1000)
}

/// Coerce a stored JSON representation to a 64-bit counter
///
/// Accepts signed, unsigned and floating point numbers, plus numeric strings.
pub fn coerce_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_u64().and_then(|u| i64::try_from(u).ok()))
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f as i64)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>().ok().or_else(|| {
                s.parse::<f64>()
                    .ok()
                    .filter(|f| f.is_finite())
                    .map(|f| f as i64)
            })
        }
        _ => None,
    }
}

/// Read a typed value as a counter
pub fn counter_of<V: CacheValue>(value: &V) -> CacheResult<i64> {
    let json = serde_json::to_value(value)?;
    coerce_i64(&json)
        .ok_or_else(|| CacheError::TypeMismatch(format!("value is not numeric: {}", json)))
}

/// Build a typed value from a counter
///
/// Tries the numeric encoding first, then the string one, so counters also
/// work for `V = String`.
pub fn counter_value<V: CacheValue>(n: i64) -> CacheResult<V> {
    serde_json::from_value(Value::from(n))
        .or_else(|_| serde_json::from_value(Value::String(n.to_string())))
        .map_err(|_| CacheError::TypeMismatch(format!("cannot store counter {} in this type", n)))
}

/// Serialize a value to the JSON text persisted by durable backends
pub fn encode<V: CacheValue>(value: &V) -> CacheResult<String> {
    Ok(serde_json::to_string(value)?)
}

/// Decode persisted JSON text; a shape mismatch is a `TypeMismatch`
pub fn decode<V: CacheValue>(raw: &str) -> CacheResult<V> {
    serde_json::from_str(raw).map_err(|e| CacheError::TypeMismatch(e.to_string()))
}

/// Decode an already-parsed JSON value
pub fn decode_value<V: CacheValue>(raw: Value) -> CacheResult<V> {
    serde_json::from_value(raw).map_err(|e| CacheError::TypeMismatch(e.to_string()))
}
