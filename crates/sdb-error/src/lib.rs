#![forbid(unsafe_code)]
//! Error types for SliceDB.
//!
//! Defines `CacheError` and a `Result<T>` alias used throughout the
//! workspace. Only transient I/O failures and resource exhaustion are
//! recoverable errors; invariant violations are panics carrying a
//! diagnostic dump, never error values.

use thiserror::Error;

/// Unified error type for all SliceDB cache operations.
#[derive(Debug, Error)]
pub enum CacheError {
    /// A serializer read or write failed. The transaction that observed
    /// this error is aborted; the cache itself stays usable.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A page buffer could not be allocated.
    #[error("buffer allocation of {bytes} bytes failed")]
    ResourceExhausted { bytes: usize },

    /// The cache is shutting down; no new transactions or acquisitions
    /// are accepted.
    #[error("cache is shutting down")]
    ShuttingDown,

    /// Invalid configuration or on-image format.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl CacheError {
    /// Build a fresh `Io` error from a detail string.
    ///
    /// Used when one serializer failure has to be surfaced to several
    /// waiting callbacks: `std::io::Error` is not `Clone`, so each
    /// waiter gets its own instance carrying the same detail.
    #[must_use]
    pub fn io_detail(detail: &str) -> Self {
        Self::Io(std::io::Error::other(detail.to_owned()))
    }
}

/// Result alias using `CacheError`.
pub type Result<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_detail_preserves_message() {
        let err = CacheError::io_detail("device gone");
        assert!(err.to_string().contains("device gone"));
    }

    #[test]
    fn display_formats() {
        assert_eq!(
            CacheError::ResourceExhausted { bytes: 4096 }.to_string(),
            "buffer allocation of 4096 bytes failed"
        );
        assert_eq!(
            CacheError::ShuttingDown.to_string(),
            "cache is shutting down"
        );
        assert_eq!(
            CacheError::Config("flush timer must be > 0".to_owned()).to_string(),
            "invalid configuration: flush timer must be > 0"
        );
    }
}
