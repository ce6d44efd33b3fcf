//! Redis File Cache - a cluster-wide on-disk file cache
//!
//! Multiple worker processes, potentially on different hosts, share a cache
//! directory on a network filesystem. A Redis server coordinates single
//! writer / multi reader access per key, create-only publication, and
//! bounded total size via LRU eviction.

pub mod cache;
pub mod config;
pub mod error;

pub use cache::FileCache;
pub use config::CacheConfig;
pub use error::{CacheError, Result};
