//! Cache Store Module
//!
//! The cache façade: combines the lock manager, index engine, and local file
//! I/O into the public operations. One handle owns one coordinator
//! connection and is meant for one thread; instantiate a handle per thread
//! (or per process) to share a cache directory.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use redis::Connection;

use crate::cache::current_timestamp_ms;
use crate::cache::index::IndexEngine;
use crate::cache::keys::{validate_key, Keyspace};
use crate::cache::locks::{self, LockManager};
use crate::cache::scripts::ScriptManager;
use crate::config::CacheConfig;
use crate::error::{CacheError, Result};

// == File Cache ==
/// A disk file cache safe for concurrent use by many processes on many
/// hosts sharing the cache directory, with a Redis server as lock manager
/// and LRU index store.
///
/// Values are opaque byte strings published create-only: a successful
/// `create` is atomic and the value is immutable until eviction removes it.
/// When a capacity is configured, publishing runs an LRU eviction loop that
/// never races a live reader or writer.
pub struct FileCache {
    cache_dir: PathBuf,
    keys: Keyspace,
    conn: Connection,
    scripts: ScriptManager,
    locks: LockManager,
    index: IndexEngine,
}

impl FileCache {
    // == Constructor ==
    /// Opens a cache handle: creates the cache directory if needed, connects
    /// to the coordinator, and loads the server-side scripts.
    ///
    /// # Arguments
    /// * `config` - Cache directory, coordinator target, lease TTL,
    ///   namespace, and eviction policy (see [`CacheConfig`])
    pub fn new(config: CacheConfig) -> Result<Self> {
        fs::create_dir_all(&config.cache_dir)?;

        let client = redis::Client::open(config.redis_url().as_str())?;
        let mut conn = client.get_connection()?;

        let mut scripts = ScriptManager::new();
        locks::register_scripts(&mut scripts, &mut conn)?;

        let keys = Keyspace::new(&config.namespace);
        let locks = LockManager::new(keys.clone(), config.lock_ttl_ms);
        let index = IndexEngine::new(
            keys.clone(),
            config.max_bytes,
            config.purge_mutex_ttl_ms,
            config.purge_factor,
        );

        Ok(Self {
            cache_dir: config.cache_dir,
            keys,
            conn,
            scripts,
            locks,
            index,
        })
    }

    // == Exists ==
    /// Returns whether a regular file for `key` is present. Purely a
    /// filesystem check; no coordinator interaction.
    pub fn exists(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        Ok(self.path_for(key).is_file())
    }

    // == Read ==
    /// Reads the whole value for `key` under a read lease.
    ///
    /// Fails with `Busy` while a writer holds the lock, and with `NotFound`
    /// if no file is present. On success the key's access time is bumped to
    /// now.
    pub fn read(&mut self, key: &str) -> Result<Vec<u8>> {
        validate_key(key)?;
        let path = self.path_for(key);

        self.locks
            .acquire_read(&mut self.conn, &mut self.scripts, key)?;
        let read_result = fs::read(&path);
        self.locks
            .release_read(&mut self.conn, &mut self.scripts, key);

        let data = match read_result {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(CacheError::NotFound(key.to_string()));
            }
            Err(err) => return Err(err.into()),
        };

        self.index
            .touch(&mut self.conn, key, current_timestamp_ms())?;
        Ok(data)
    }

    // == Create ==
    /// Publishes `data` under `key`, create-only.
    ///
    /// The value is written to a uniquely named hidden temp file in the
    /// cache directory, flushed to durable storage, and renamed into place
    /// under the write lease. Fails with `AlreadyExists` if the key is
    /// already published (checked before acquiring and re-checked after the
    /// temp write), and with `Busy` if another writer holds the lock or
    /// readers are present. After a successful publish the index entries are
    /// applied and, when a capacity is configured, the eviction loop runs.
    pub fn create(&mut self, key: &str, data: &[u8]) -> Result<()> {
        validate_key(key)?;
        let path = self.path_for(key);

        // Fast pre-check before taking a lease
        if path.is_file() {
            return Err(CacheError::AlreadyExists(key.to_string()));
        }

        let token = self
            .locks
            .acquire_write(&mut self.conn, &mut self.scripts, key)?;
        let published = publish_file(&self.cache_dir, key, &path, data);
        self.locks
            .release_write(&mut self.conn, &mut self.scripts, key, &token);
        published?;

        self.index.record_publish(
            &mut self.conn,
            key,
            data.len() as i64,
            current_timestamp_ms(),
        )?;

        if self.index.bounded() {
            self.index.ensure_capacity(
                &mut self.conn,
                &mut self.scripts,
                &self.locks,
                &self.cache_dir,
            )?;
        }
        Ok(())
    }

    // == Blocking Read ==
    /// Repeatedly attempts [`FileCache::read`] until it succeeds or the
    /// timeout elapses, sleeping `backoff` between attempts.
    ///
    /// Retries on `Busy` (a writer is active) and on `NotFound` (the key may
    /// be published any moment); every other error propagates immediately.
    /// Returns `None` when the deadline passes. At least one attempt is made
    /// even with a zero timeout.
    pub fn read_blocking(
        &mut self,
        key: &str,
        timeout: Duration,
        backoff: Duration,
    ) -> Result<Option<Vec<u8>>> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.read(key) {
                Ok(data) => return Ok(Some(data)),
                Err(CacheError::Busy(_)) | Err(CacheError::NotFound(_)) => {}
                Err(err) => return Err(err),
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            thread::sleep(backoff);
        }
    }

    // == Blocking Create ==
    /// Repeatedly attempts [`FileCache::create`] until it succeeds or the
    /// timeout elapses, sleeping `backoff` between attempts.
    ///
    /// Only `Busy` is retried. `AlreadyExists` is a permanent condition and
    /// propagates immediately, as does every other error. Returns `false`
    /// when the deadline passes. At least one attempt is made even with a
    /// zero timeout.
    pub fn create_blocking(
        &mut self,
        key: &str,
        data: &[u8],
        timeout: Duration,
        backoff: Duration,
    ) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.create(key, data) {
                Ok(()) => return Ok(true),
                Err(CacheError::Busy(_)) => {}
                Err(err) => return Err(err),
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            thread::sleep(backoff);
        }
    }

    // == Accessors ==

    /// The coordinator key prefix for this handle.
    pub fn namespace_prefix(&self) -> &str {
        self.keys.namespace()
    }

    /// The coordinator key layout, for operator/test inspection.
    pub fn keyspace(&self) -> &Keyspace {
        &self.keys
    }

    /// The on-disk root this handle serves.
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Overrides the purger-mutex TTL, the minimum interval between purge
    /// cycles. Small values are useful in tests.
    pub fn set_purge_mutex_ttl_ms(&mut self, ttl_ms: u64) {
        self.index.set_purge_mutex_ttl_ms(ttl_ms);
    }

    /// Overrides the purge undershoot fraction, clamped to 0.0 - 1.0.
    pub fn set_purge_factor(&mut self, factor: f64) {
        self.index.set_purge_factor(factor);
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.cache_dir.join(key)
    }
}

// == Publication ==
/// Writes `data` to a hidden temp file in `cache_dir`, fsyncs it, re-checks
/// the final name, and renames into place create-only. The temp file is
/// unlinked on every early-exit path (the handle removes it when dropped).
fn publish_file(cache_dir: &Path, key: &str, path: &Path, data: &[u8]) -> Result<()> {
    let mut tmp = tempfile::Builder::new()
        .prefix(&format!(".{key}."))
        .tempfile_in(cache_dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;

    // Final create-only check (belt and suspenders)
    if path.is_file() {
        return Err(CacheError::AlreadyExists(key.to_string()));
    }

    tmp.persist_noclobber(path).map_err(|err| {
        if err.error.kind() == io::ErrorKind::AlreadyExists {
            CacheError::AlreadyExists(key.to_string())
        } else {
            CacheError::Io(err.error)
        }
    })?;
    Ok(())
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_file_writes_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("k.bin");

        publish_file(dir.path(), "k.bin", &path, b"hello world").unwrap();

        assert!(path.is_file());
        assert_eq!(fs::read(&path).unwrap(), b"hello world");
    }

    #[test]
    fn test_publish_file_is_create_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dup.bin");

        publish_file(dir.path(), "dup.bin", &path, b"abc").unwrap();
        let result = publish_file(dir.path(), "dup.bin", &path, b"xyz");

        assert!(matches!(result, Err(CacheError::AlreadyExists(_))));
        // The first publication wins and is untouched
        assert_eq!(fs::read(&path).unwrap(), b"abc");
    }

    #[test]
    fn test_publish_file_leaves_no_temp_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.bin");

        publish_file(dir.path(), "t.bin", &path, b"data").unwrap();
        // Duplicate attempt bails between temp write and rename
        let _ = publish_file(dir.path(), "t.bin", &path, b"other");

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with('.'))
            .collect();
        assert!(leftovers.is_empty(), "temp files not cleaned: {leftovers:?}");
    }

    #[test]
    fn test_publish_file_empty_value() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.bin");

        publish_file(dir.path(), "empty.bin", &path, b"").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"");
    }
}
