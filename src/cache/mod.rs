//! Cache Module
//!
//! A multiprocess, multi-host safe disk file cache. Files live in a shared
//! directory; a Redis server arbitrates locking and holds the LRU indices.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

mod index;
mod keys;
mod locks;
mod scripts;
mod store;


// Re-export public types
pub use keys::{validate_key, Keyspace};
pub use scripts::ScriptManager;
pub use store::FileCache;

// == Public Constants ==
/// Default sleep between blocking-wrapper retries
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(10);

// == Utility Functions ==
/// Returns current Unix timestamp in milliseconds.
pub fn current_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("Time went backwards")
        .as_millis() as u64
}
