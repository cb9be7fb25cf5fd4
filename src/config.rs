//! Serializable configuration of the whole store. Durations are written as milliseconds.
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::error::Result;
use crate::error::StoreError;
use crate::pool::ConnectionPool;
use crate::traits::ConnectionManager;
use crate::ttl::TtlPolicy;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub max_size:             usize,
    pub min_size:             usize,
    pub initial_size:         usize,
    #[serde(with = "millis")]
    pub acquire_timeout:      Duration,
    #[serde(with = "millis")]
    pub validation_timeout:   Duration,
    #[serde(with = "millis")]
    pub idle_timeout:         Duration,
    #[serde(with = "millis")]
    pub maintenance_interval: Duration,
    pub connect_attempts:     u32,
    #[serde(with = "millis")]
    pub retry_backoff:        Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size:             10,
            min_size:             3,
            initial_size:         5,
            acquire_timeout:      Duration::from_secs(5),
            validation_timeout:   Duration::from_secs(1),
            idle_timeout:         Duration::from_secs(5 * 60),
            maintenance_interval: Duration::from_secs(60),
            connect_attempts:     3,
            retry_backoff:        Duration::from_secs(1),
        }
    }
}

impl PoolConfig {
    pub fn build_pool<M: ConnectionManager>(&self, manager: M) -> Result<Arc<ConnectionPool<M>>> {
        ConnectionPool::builder()
            .manager(manager)
            .max_size(self.max_size)
            .min_size(self.min_size)
            .initial_size(self.initial_size)
            .acquire_timeout(self.acquire_timeout)
            .validation_timeout(self.validation_timeout)
            .idle_timeout(self.idle_timeout)
            .maintenance_interval(self.maintenance_interval)
            .connect_attempts(self.connect_attempts)
            .retry_backoff(self.retry_backoff)
            .build()
            .map_err(|e| StoreError::Build(e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoalescerConfig {
    #[serde(with = "millis")]
    pub flush_interval: Duration,
    pub max_pending:    usize,
}

impl Default for CoalescerConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(60),
            max_pending:    1_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub profile_capacity:   u64,
    pub aggregate_capacity: u64,
    #[serde(with = "millis")]
    pub profile_ttl:        Duration,
    pub earnings:           TtlPolicy,
    pub spending:           TtlPolicy,
    pub stats:              TtlPolicy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            profile_capacity:   10_000,
            aggregate_capacity: 50_000,
            profile_ttl:        Duration::from_secs(30 * 60),
            earnings:           TtlPolicy::earnings(),
            spending:           TtlPolicy::spending(),
            stats:              TtlPolicy::stats(),
        }
    }
}

/// ```ignore
/// let config = StoreConfig::from_json(r#"{ "pool": { "max_size": 20 }, "coalescer": { "flush_interval": 30000 } }"#)?;
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub pool:      PoolConfig,
    pub coalescer: CoalescerConfig,
    pub cache:     CacheConfig,
}

impl StoreConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| StoreError::Build(format!("store configuration: {e}")))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| StoreError::Build(format!("store configuration {}: {e}", path.display())))?;
        Self::from_json(&json)
    }
}

pub(crate) mod millis {
    use std::time::Duration;

    use serde::Deserialize;
    use serde::Deserializer;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config = StoreConfig::from_json(
            r#"{
                "pool": { "max_size": 20, "acquire_timeout": 2500 },
                "coalescer": { "flush_interval": 30000 },
                "cache": { "stats": { "base": 60000, "max": 60000, "scale": { "by": "fixed" } } }
            }"#,
        )
        .unwrap();

        assert_eq!(config.pool.max_size, 20);
        assert_eq!(config.pool.min_size, 3);
        assert_eq!(config.pool.acquire_timeout, Duration::from_millis(2500));
        assert_eq!(config.coalescer.flush_interval, Duration::from_secs(30));
        assert_eq!(config.coalescer.max_pending, 1_000);
        assert_eq!(config.cache.stats, TtlPolicy::fixed(Duration::from_secs(60)));
        assert_eq!(config.cache.earnings, TtlPolicy::earnings());
    }

    #[test]
    fn serialized_form_reads_back() {
        let config = StoreConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains(r#""acquire_timeout":5000"#));
        assert_eq!(StoreConfig::from_json(&json).unwrap(), config);
    }

    #[test]
    fn malformed_json_is_a_build_error() {
        assert!(matches!(StoreConfig::from_json("{ nope"), Err(StoreError::Build(_))));
    }

    #[test]
    fn reads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        std::fs::write(&path, r#"{ "pool": { "min_size": 1 } }"#).unwrap();
        assert_eq!(StoreConfig::from_file(&path).unwrap().pool.min_size, 1);
    }
}
