//! Error types for the file cache
//!
//! Provides unified error handling using thiserror.

use thiserror::Error;

// == Cache Error Enum ==
/// Unified error type for the file cache.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Key violates the simple-filename rules
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// A conflicting lease is held (writer present, or readers block a writer)
    #[error("Cache busy: {0}")]
    Busy(String),

    /// No file for the key in the cache directory
    #[error("Key not found: {0}")]
    NotFound(String),

    /// Create-only violation: the key is already published
    #[error("Key already exists: {0}")]
    AlreadyExists(String),

    /// Script name was never registered with the script manager
    #[error("Unknown script: {0}")]
    UnknownScript(String),

    /// Coordinator replied with a shape the caller cannot accept
    #[error("Unexpected coordinator reply: {0}")]
    UnexpectedReply(String),

    /// Coordinator transport or server error
    #[error("Coordinator error: {0}")]
    Coordinator(#[from] redis::RedisError),

    /// Filesystem error other than the mapped not-found/already-exists cases
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CacheError {
    /// True for the conditions a blocking wrapper may retry.
    pub fn is_busy(&self) -> bool {
        matches!(self, CacheError::Busy(_))
    }
}

// == Result Type Alias ==
/// Convenience Result type for the file cache.
pub type Result<T> = std::result::Result<T, CacheError>;
