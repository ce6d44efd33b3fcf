//! LRU Index and Eviction Module
//!
//! Maintains the coordinator-side secondary indices (size map, access-time
//! order, total-bytes counter, discovery set) and runs the capacity
//! enforcement loop. Index mutations are individual commands, not a
//! transaction; intermediate states are observable and the eviction path
//! reconciles any drift toward the on-disk truth.
//!
//! Eviction is best-effort: any failure inside the loop ends the cycle and
//! the next successful publish retries.

use std::path::Path;

use redis::{Commands, Connection};
use tracing::{debug, info, warn};

use crate::cache::keys::Keyspace;
use crate::cache::locks::LockManager;
use crate::cache::scripts::ScriptManager;
use crate::error::Result;

/// How long an eviction fence shuts out new leases on the chosen victim.
const EVICT_FENCE_TTL_MS: u64 = 1_500;

/// Bound on the advisory eviction log.
const EVICT_LOG_MAX: isize = 1_000;

// == Index Engine ==
/// Secondary indices plus the single-purger eviction loop.
pub struct IndexEngine {
    keys: Keyspace,
    max_bytes: u64,
    purge_mutex_ttl_ms: u64,
    purge_factor: f64,
}

impl IndexEngine {
    pub fn new(keys: Keyspace, max_bytes: u64, purge_mutex_ttl_ms: u64, purge_factor: f64) -> Self {
        Self {
            keys,
            max_bytes,
            purge_mutex_ttl_ms,
            purge_factor: purge_factor.clamp(0.0, 1.0),
        }
    }

    /// True when a capacity is configured and eviction applies.
    pub fn bounded(&self) -> bool {
        self.max_bytes > 0
    }

    pub fn set_purge_mutex_ttl_ms(&mut self, ttl_ms: u64) {
        self.purge_mutex_ttl_ms = ttl_ms;
    }

    pub fn set_purge_factor(&mut self, factor: f64) {
        self.purge_factor = factor.clamp(0.0, 1.0);
    }

    // == Index Mutations ==

    /// Upserts the access-time score of `key` to `ts_ms`.
    pub fn touch(&self, conn: &mut Connection, key: &str, ts_ms: u64) -> Result<()> {
        let _: i64 = conn.zadd(self.keys.lru(), key, ts_ms)?;
        Ok(())
    }

    /// Records a freshly published entry: size map, total, discovery set,
    /// access-time order.
    pub fn record_publish(
        &self,
        conn: &mut Connection,
        key: &str,
        size: i64,
        ts_ms: u64,
    ) -> Result<()> {
        let _: i64 = conn.hset(self.keys.sizes(), key, size)?;
        let _: i64 = conn.incr(self.keys.total(), size)?;
        let _: i64 = conn.sadd(self.keys.keys_set(), key)?;
        self.touch(conn, key, ts_ms)
    }

    /// Removes every index entry for `key`, which was recorded with `size`
    /// bytes. Used for both eviction and drift reconciliation.
    pub fn remove_entry(&self, conn: &mut Connection, key: &str, size: i64) -> Result<()> {
        let _: i64 = conn.hdel(self.keys.sizes(), key)?;
        let _: i64 = conn.incr(self.keys.total(), -size)?;
        let _: i64 = conn.zrem(self.keys.lru(), key)?;
        let _: i64 = conn.srem(self.keys.keys_set(), key)?;
        Ok(())
    }

    /// The recorded total byte count. Absent or unparsable counts as zero.
    pub fn total_bytes(&self, conn: &mut Connection) -> Result<i64> {
        let raw: Option<String> = conn.get(self.keys.total())?;
        Ok(raw.and_then(|s| s.parse().ok()).unwrap_or(0))
    }

    // == Capacity Enforcement ==

    /// Runs the eviction loop if this process wins the purger mutex.
    ///
    /// At most one purger runs at a time across all processes; losers return
    /// immediately. The mutex is released by TTL expiry, which also bounds
    /// how long a crashed purger can block others. Failures inside the loop
    /// are swallowed; the next publish retries.
    pub fn ensure_capacity(
        &self,
        conn: &mut Connection,
        scripts: &mut ScriptManager,
        locks: &LockManager,
        cache_dir: &Path,
    ) -> Result<()> {
        if !self.bounded() {
            return Ok(());
        }

        let acquired: Option<String> = redis::cmd("SET")
            .arg(self.keys.purge_mutex())
            .arg(1)
            .arg("NX")
            .arg("PX")
            .arg(self.purge_mutex_ttl_ms)
            .query(conn)?;
        if acquired.is_none() {
            debug!("another purger is active, skipping capacity check");
            return Ok(());
        }

        if let Err(err) = self.purge_loop(conn, scripts, locks, cache_dir) {
            warn!(error = %err, "eviction loop ended early");
        }
        Ok(())
    }

    /// Evicts oldest-first until the recorded total drops to the purge
    /// floor, `max_bytes * (1 - purge_factor)`. The undershoot keeps the
    /// next few publishes from re-triggering a purge immediately.
    fn purge_loop(
        &self,
        conn: &mut Connection,
        scripts: &mut ScriptManager,
        locks: &LockManager,
        cache_dir: &Path,
    ) -> Result<()> {
        let mut total = self.total_bytes(conn)?;
        if total <= self.max_bytes as i64 {
            return Ok(());
        }

        let floor = self.purge_floor();
        while total > floor {
            match self.try_evict_one(conn, scripts, locks, cache_dir)? {
                Some((victim, freed)) => {
                    info!(key = %victim, freed, "evicted cache entry");
                }
                None => break,
            }
            total = self.total_bytes(conn)?;
        }
        Ok(())
    }

    pub(crate) fn purge_floor(&self) -> i64 {
        (self.max_bytes as f64 * (1.0 - self.purge_factor)) as i64
    }

    // == Single-Victim Eviction ==

    /// Attempts to evict the oldest entry. Returns the victim and its freed
    /// size, or `None` when no progress was possible this attempt (empty
    /// order, locked victim, or index drift that has now been reconciled).
    fn try_evict_one(
        &self,
        conn: &mut Connection,
        scripts: &mut ScriptManager,
        locks: &LockManager,
        cache_dir: &Path,
    ) -> Result<Option<(String, i64)>> {
        // Oldest access time first
        let oldest: Vec<String> = conn.zrange(self.keys.lru(), 0, 0)?;
        let Some(key) = oldest.into_iter().next() else {
            return Ok(None);
        };

        let size: Option<i64> = conn.hget(self.keys.sizes(), &key)?;
        let Some(size) = size else {
            // Size map lost this key: stale order/discovery entries, drop them.
            debug!(key = %key, "index drift: no recorded size, reconciling");
            let _: i64 = conn.zrem(self.keys.lru(), &key)?;
            let _: i64 = conn.srem(self.keys.keys_set(), &key)?;
            return Ok(None);
        };

        if !locks.can_evict(conn, scripts, &key, EVICT_FENCE_TTL_MS)? {
            // Someone is using it; promote so the next pick is a fresh victim.
            self.touch(conn, &key, super::current_timestamp_ms())?;
            return Ok(None);
        }

        match std::fs::remove_file(cache_dir.join(&key)) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                // File already gone (external delete or an earlier crash
                // mid-eviction): the indices are the stale side, clean them.
                debug!(key = %key, "index drift: file absent, reconciling");
                self.remove_entry(conn, &key, size)?;
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        }

        self.remove_entry(conn, &key, size)?;
        self.log_eviction(conn, &key, size);
        Ok(Some((key, size)))
    }

    /// Appends to the advisory eviction log, newest first. Best-effort.
    fn log_eviction(&self, conn: &mut Connection, key: &str, size: i64) {
        let entry = format!("{} {} {}", super::current_timestamp_ms(), key, size);
        let pushed: redis::RedisResult<i64> = conn.lpush(self.keys.evict_log(), entry);
        if let Err(err) = pushed {
            warn!(key, error = %err, "failed to append eviction log entry");
            return;
        }
        let trimmed: redis::RedisResult<()> = conn.ltrim(self.keys.evict_log(), 0, EVICT_LOG_MAX - 1);
        if let Err(err) = trimmed {
            warn!(error = %err, "failed to trim eviction log");
        }
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;

    fn engine(max_bytes: u64, purge_factor: f64) -> IndexEngine {
        IndexEngine::new(Keyspace::new("test-ns"), max_bytes, 2_000, purge_factor)
    }

    #[test]
    fn test_bounded() {
        assert!(!engine(0, 0.2).bounded());
        assert!(engine(8_192, 0.2).bounded());
    }

    #[test]
    fn test_purge_floor_default_factor() {
        // 20% undershoot below an 8 KiB capacity
        assert_eq!(engine(8_192, 0.2).purge_floor(), 6_553);
    }

    #[test]
    fn test_purge_floor_zero_factor_is_capacity() {
        assert_eq!(engine(8_192, 0.0).purge_floor(), 8_192);
    }

    #[test]
    fn test_purge_floor_full_factor_drains_everything() {
        assert_eq!(engine(8_192, 1.0).purge_floor(), 0);
    }

    #[test]
    fn test_purge_factor_is_clamped() {
        assert_eq!(engine(1_000, 7.5).purge_floor(), 0);
        assert_eq!(engine(1_000, -3.0).purge_floor(), 1_000);

        let mut e = engine(1_000, 0.2);
        e.set_purge_factor(2.0);
        assert_eq!(e.purge_floor(), 0);
    }
}
