//! Key Validation and Coordinator Key Layout
//!
//! Cache keys are opaque simple filenames. Coordinator keys are derived from
//! the configured namespace so several caches can share one Redis instance.

use crate::error::{CacheError, Result};

// == Key Validation ==
/// Validates a cache key.
///
/// A key must be a non-empty simple filename: no `/` anywhere and no
/// leading `.` (hidden names are reserved for in-flight temp files).
/// Applied at every public entry point; violations are fatal.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() || key.starts_with('.') || key.contains('/') {
        return Err(CacheError::InvalidKey(format!(
            "'{key}' is not a simple filename (non-empty, no '/', no leading '.')"
        )));
    }
    Ok(())
}

// == Keyspace ==
/// Builds the coordinator keys for one namespace.
///
/// Layout (everything under the `<ns>:` prefix):
/// - `lock:write:<key>` - writer token
/// - `lock:readers:<key>` - active reader count
/// - `lock:evict:<key>` - eviction fence
/// - `idx:size` - hash, key -> recorded byte length
/// - `idx:lru` - sorted set, key scored by last-touch ms timestamp
/// - `idx:total` - sum of recorded sizes
/// - `keys:set` - discovery set of published keys
/// - `purge:mutex` - at-most-one purger token
/// - `evict:log` - list of recent evictions, newest first
///
/// The index keys are supported read paths: operators and tests may inspect
/// them with ordinary Redis commands.
#[derive(Debug, Clone)]
pub struct Keyspace {
    ns: String,
    lru: String,
    sizes: String,
    keys_set: String,
    total: String,
    purge_mutex: String,
    evict_log: String,
}

impl Keyspace {
    pub fn new(namespace: &str) -> Self {
        Self {
            ns: namespace.to_string(),
            lru: format!("{namespace}:idx:lru"),
            sizes: format!("{namespace}:idx:size"),
            keys_set: format!("{namespace}:keys:set"),
            total: format!("{namespace}:idx:total"),
            purge_mutex: format!("{namespace}:purge:mutex"),
            evict_log: format!("{namespace}:evict:log"),
        }
    }

    /// The namespace prefix itself.
    pub fn namespace(&self) -> &str {
        &self.ns
    }

    // == Per-key lock keys ==

    /// Writer exclusion token for `key`.
    pub fn write_lock(&self, key: &str) -> String {
        format!("{}:lock:write:{}", self.ns, key)
    }

    /// Active-reader counter for `key`.
    pub fn readers(&self, key: &str) -> String {
        format!("{}:lock:readers:{}", self.ns, key)
    }

    /// Eviction fence for `key`.
    pub fn evict_fence(&self, key: &str) -> String {
        format!("{}:lock:evict:{}", self.ns, key)
    }

    // == Shared index keys ==

    /// Access-time order (sorted set, score = last-touch ms).
    pub fn lru(&self) -> &str {
        &self.lru
    }

    /// Size map (hash, key -> bytes).
    pub fn sizes(&self) -> &str {
        &self.sizes
    }

    /// Discovery set of published keys.
    pub fn keys_set(&self) -> &str {
        &self.keys_set
    }

    /// Total recorded bytes.
    pub fn total(&self) -> &str {
        &self.total
    }

    /// At-most-one purger mutex.
    pub fn purge_mutex(&self) -> &str {
        &self.purge_mutex
    }

    /// Best-effort eviction log.
    pub fn evict_log(&self) -> &str {
        &self.evict_log
    }
}
