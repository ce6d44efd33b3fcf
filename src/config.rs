//! Configuration Module
//!
//! Handles loading and managing cache configuration from environment variables.

use std::env;
use std::path::PathBuf;

/// Cache handle configuration parameters.
///
/// All values except the cache directory can be configured via environment
/// variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Root of on-disk storage (created if absent)
    pub cache_dir: PathBuf,
    /// Coordinator host
    pub redis_host: String,
    /// Coordinator port
    pub redis_port: u16,
    /// Coordinator logical database
    pub redis_db: i64,
    /// Read/write lease lifetime bound in milliseconds
    pub lock_ttl_ms: u64,
    /// Prefix scoping all coordinator keys
    pub namespace: String,
    /// Capacity in bytes; 0 disables eviction
    pub max_bytes: u64,
    /// At-most-one purger duration bound in milliseconds
    pub purge_mutex_ttl_ms: u64,
    /// Fraction of capacity to undershoot when purging (0.0 - 1.0)
    pub purge_factor: f64,
}

impl CacheConfig {
    /// Creates a configuration for the given cache directory with default
    /// coordinator and eviction settings.
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            redis_host: "127.0.0.1".to_string(),
            redis_port: 6379,
            redis_db: 0,
            lock_ttl_ms: 60_000,
            namespace: "poc-cache".to_string(),
            max_bytes: 0,
            purge_mutex_ttl_ms: 2_000,
            purge_factor: 0.2,
        }
    }

    /// Creates a CacheConfig by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `CACHE_DIR` - Cache directory (default: /tmp/poc-cache)
    /// - `REDIS_HOST` - Coordinator host (default: 127.0.0.1)
    /// - `REDIS_PORT` - Coordinator port (default: 6379)
    /// - `REDIS_DB` - Coordinator logical database (default: 0)
    /// - `LOCK_TTL_MS` - Lease lifetime in ms (default: 60000)
    /// - `CACHE_NAMESPACE` - Coordinator key prefix (default: poc-cache)
    /// - `MAX_BYTES` - Capacity in bytes, 0 disables eviction (default: 0)
    /// - `PURGE_MUTEX_TTL_MS` - Purger mutex TTL in ms (default: 2000)
    /// - `PURGE_FACTOR` - Capacity undershoot fraction (default: 0.2)
    pub fn from_env() -> Self {
        let defaults =
            Self::new(env::var("CACHE_DIR").unwrap_or_else(|_| "/tmp/poc-cache".to_string()));
        Self {
            redis_host: env::var("REDIS_HOST").unwrap_or(defaults.redis_host),
            redis_port: env::var("REDIS_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.redis_port),
            redis_db: env::var("REDIS_DB")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.redis_db),
            lock_ttl_ms: env::var("LOCK_TTL_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.lock_ttl_ms),
            namespace: env::var("CACHE_NAMESPACE").unwrap_or(defaults.namespace),
            max_bytes: env::var("MAX_BYTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_bytes),
            purge_mutex_ttl_ms: env::var("PURGE_MUTEX_TTL_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.purge_mutex_ttl_ms),
            purge_factor: env::var("PURGE_FACTOR")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.purge_factor),
            cache_dir: defaults.cache_dir,
        }
    }

    /// Connection URL for the configured coordinator.
    pub fn redis_url(&self) -> String {
        format!(
            "redis://{}:{}/{}",
            self.redis_host, self.redis_port, self.redis_db
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = CacheConfig::new("/tmp/cache-test");
        assert_eq!(config.cache_dir, PathBuf::from("/tmp/cache-test"));
        assert_eq!(config.redis_host, "127.0.0.1");
        assert_eq!(config.redis_port, 6379);
        assert_eq!(config.redis_db, 0);
        assert_eq!(config.lock_ttl_ms, 60_000);
        assert_eq!(config.namespace, "poc-cache");
        assert_eq!(config.max_bytes, 0);
        assert_eq!(config.purge_mutex_ttl_ms, 2_000);
        assert!((config.purge_factor - 0.2).abs() < f64::EPSILON);
    }

    #[test]
    fn test_redis_url() {
        let mut config = CacheConfig::new("/tmp/cache-test");
        assert_eq!(config.redis_url(), "redis://127.0.0.1:6379/0");

        config.redis_host = "redis.internal".to_string();
        config.redis_port = 6380;
        config.redis_db = 3;
        assert_eq!(config.redis_url(), "redis://redis.internal:6380/3");
    }
}
