//! Lock Manager Module
//!
//! Per-key writer exclusion and reader counting, expressed as atomic
//! server-side scripts so that check-and-set is one unit on the coordinator.
//! A write lock and a nonzero readers counter never coexist for a key, and
//! two write locks for the same key cannot coexist.
//!
//! Leases carry a TTL as a liveness bound against crashed holders; it is not
//! a correctness tool, and operations must complete well within it.

use rand::Rng;
use redis::Connection;
use tracing::warn;

use crate::cache::keys::Keyspace;
use crate::cache::scripts::ScriptManager;
use crate::error::{CacheError, Result};

// == Script Names ==
pub const READ_LOCK_ACQUIRE: &str = "read_lock_acquire";
pub const READ_LOCK_RELEASE: &str = "read_lock_release";
pub const WRITE_LOCK_ACQUIRE: &str = "write_lock_acquire";
pub const WRITE_LOCK_RELEASE: &str = "write_lock_release";
pub const CAN_EVICT: &str = "can_evict";

// == Lua Sources ==
// KEYS[1]=write_lock KEYS[2]=readers_count  ARGV[1]=ttl_ms
// Fails (0) while a writer holds the lock; otherwise bumps the reader count
// and refreshes its TTL so a crashed reader cannot pin the key forever.
const LUA_READ_LOCK_ACQUIRE: &str = r#"
    local wl = KEYS[1]
    local rd = KEYS[2]
    local ttl = tonumber(ARGV[1])
    if redis.call('EXISTS', wl) == 1 then return 0 end
    redis.call('INCR', rd)
    redis.call('PEXPIRE', rd, ttl)
    return 1
"#;

// KEYS[1]=readers_count
const LUA_READ_LOCK_RELEASE: &str = r#"
    local rd = KEYS[1]
    local c = redis.call('DECR', rd)
    if c <= 0 then redis.call('DEL', rd) end
    return 1
"#;

// KEYS[1]=write_lock KEYS[2]=readers_count  ARGV[1]=token ARGV[2]=ttl_ms
// 1 = acquired, 0 = another writer, -1 = readers present.
const LUA_WRITE_LOCK_ACQUIRE: &str = r#"
    local wl = KEYS[1]
    local rd = KEYS[2]
    local token = ARGV[1]
    local ttl = tonumber(ARGV[2])
    if redis.call('EXISTS', wl) == 1 then return 0 end
    local rc = tonumber(redis.call('GET', rd) or "0")
    if rc > 0 then return -1 end
    local ok = redis.call('SET', wl, token, 'NX', 'PX', ttl)
    if ok then return 1 else return 0 end
"#;

// KEYS[1]=write_lock  ARGV[1]=token
// Compare-and-delete: never removes a lock owned by someone else, so a
// TTL-expired writer cannot delete its successor's lock.
const LUA_WRITE_LOCK_RELEASE: &str = r#"
    local wl = KEYS[1]
    local token = ARGV[1]
    local cur = redis.call('GET', wl)
    if cur and cur == token then
        redis.call('DEL', wl)
        return 1
    end
    return 0
"#;

// KEYS[1]=write_lock KEYS[2]=readers_count KEYS[3]=evict_fence  ARGV[1]=fence_ttl_ms
// Succeeds iff the key is idle and no other purger has fenced it.
const LUA_CAN_EVICT: &str = r#"
    if redis.call('EXISTS', KEYS[1]) == 1 then return 0 end
    local rc = tonumber(redis.call('GET', KEYS[2]) or "0")
    if rc > 0 then return 0 end
    local ok = redis.call('SET', KEYS[3], '1', 'NX', 'PX', tonumber(ARGV[1]))
    if ok then return 1 else return 0 end
"#;

/// Loads every lock script into the manager. Called once at handle
/// construction.
pub fn register_scripts(scripts: &mut ScriptManager, conn: &mut Connection) -> Result<()> {
    scripts.register_and_load(conn, READ_LOCK_ACQUIRE, LUA_READ_LOCK_ACQUIRE)?;
    scripts.register_and_load(conn, READ_LOCK_RELEASE, LUA_READ_LOCK_RELEASE)?;
    scripts.register_and_load(conn, WRITE_LOCK_ACQUIRE, LUA_WRITE_LOCK_ACQUIRE)?;
    scripts.register_and_load(conn, WRITE_LOCK_RELEASE, LUA_WRITE_LOCK_RELEASE)?;
    scripts.register_and_load(conn, CAN_EVICT, LUA_CAN_EVICT)?;
    Ok(())
}

// == Lock Manager ==
/// Grants and releases per-key read/write leases.
pub struct LockManager {
    keys: Keyspace,
    lock_ttl_ms: u64,
}

impl LockManager {
    pub fn new(keys: Keyspace, lock_ttl_ms: u64) -> Self {
        Self { keys, lock_ttl_ms }
    }

    // == Read Lease ==
    /// Acquires a read lease for `key`, or fails with `Busy` while a writer
    /// holds the lock.
    pub fn acquire_read(
        &self,
        conn: &mut Connection,
        scripts: &mut ScriptManager,
        key: &str,
    ) -> Result<()> {
        let write_lock = self.keys.write_lock(key);
        let readers = self.keys.readers(key);
        let ttl = self.lock_ttl_ms.to_string();
        let res = scripts.evalsha_int(conn, READ_LOCK_ACQUIRE, &[&write_lock, &readers], &[&ttl])?;
        match res {
            1 => Ok(()),
            0 => Err(CacheError::Busy(format!(
                "read of '{key}' blocked by a writer"
            ))),
            other => Err(CacheError::UnexpectedReply(format!(
                "read-lock acquire returned {other}"
            ))),
        }
    }

    /// Releases a read lease. Best-effort: failures are logged and
    /// swallowed because the lease TTL guarantees liveness.
    pub fn release_read(&self, conn: &mut Connection, scripts: &mut ScriptManager, key: &str) {
        let readers = self.keys.readers(key);
        if let Err(err) = scripts.evalsha_int(conn, READ_LOCK_RELEASE, &[&readers], &[]) {
            warn!(key, error = %err, "failed to release read lease (TTL will expire it)");
        }
    }

    // == Write Lease ==
    /// Acquires the write lease for `key` and returns the release token.
    ///
    /// Fails with `Busy` if another writer holds the lock or readers are
    /// present. The token is fresh randomness known only to this caller;
    /// release refuses to delete any other party's lock.
    pub fn acquire_write(
        &self,
        conn: &mut Connection,
        scripts: &mut ScriptManager,
        key: &str,
    ) -> Result<String> {
        let token = new_token();
        let write_lock = self.keys.write_lock(key);
        let readers = self.keys.readers(key);
        let ttl = self.lock_ttl_ms.to_string();
        let res = scripts.evalsha_int(
            conn,
            WRITE_LOCK_ACQUIRE,
            &[&write_lock, &readers],
            &[&token, &ttl],
        )?;
        match res {
            1 => Ok(token),
            0 => Err(CacheError::Busy(format!(
                "write lock for '{key}' held by another writer"
            ))),
            -1 => Err(CacheError::Busy(format!("readers present on '{key}'"))),
            other => Err(CacheError::UnexpectedReply(format!(
                "write-lock acquire returned {other}"
            ))),
        }
    }

    /// Releases the write lease identified by `token`. Best-effort; a token
    /// mismatch (our lease expired and someone else acquired) is silently a
    /// no-op on the coordinator side.
    pub fn release_write(
        &self,
        conn: &mut Connection,
        scripts: &mut ScriptManager,
        key: &str,
        token: &str,
    ) {
        let write_lock = self.keys.write_lock(key);
        if let Err(err) = scripts.evalsha_int(conn, WRITE_LOCK_RELEASE, &[&write_lock], &[token]) {
            warn!(key, error = %err, "failed to release write lease (TTL will expire it)");
        }
    }

    // == Eviction Fence ==
    /// Returns true iff `key` has no writer, no readers, and this caller won
    /// the eviction fence (valid for `fence_ttl_ms`).
    pub fn can_evict(
        &self,
        conn: &mut Connection,
        scripts: &mut ScriptManager,
        key: &str,
        fence_ttl_ms: u64,
    ) -> Result<bool> {
        let write_lock = self.keys.write_lock(key);
        let readers = self.keys.readers(key);
        let fence = self.keys.evict_fence(key);
        let ttl = fence_ttl_ms.to_string();
        let res = scripts.evalsha_int(conn, CAN_EVICT, &[&write_lock, &readers, &fence], &[&ttl])?;
        Ok(res == 1)
    }
}

// == Tokens ==
/// 128 bits of randomness as 32 lowercase hex characters.
pub(crate) fn new_token() -> String {
    let mut rng = rand::thread_rng();
    let hi: u64 = rng.gen();
    let lo: u64 = rng.gen();
    format!("{hi:016x}{lo:016x}")
}
