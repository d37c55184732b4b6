//! Error types for query cache operations
//!
//! Store operations never fail; lookups return `Option`. These errors come from
//! key construction, configuration loading, typed data decoding and fetches.

use thiserror::Error;

/// Main error type for the query cache
///
/// The enum is `Clone` because the last fetch error is kept in entry state and
/// handed to every caller awaiting a deduplicated fetch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// A key or cached value could not be converted to or from JSON
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Invalid configuration value
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// The fetch function reported a failure
    #[error("Fetch error: {0}")]
    FetchError(String),

    /// An in-flight fetch was aborted because its query was destroyed
    #[error("Fetch cancelled: query {0} was destroyed")]
    Cancelled(String),

    /// Generic error with context
    #[error("Error: {0}")]
    Other(String),
}

/// Result type alias for query cache operations
pub type Result<T> = std::result::Result<T, CacheError>;

impl From<String> for CacheError {
    fn from(s: String) -> Self {
        CacheError::Other(s)
    }
}

impl From<&str> for CacheError {
    fn from(s: &str) -> Self {
        CacheError::Other(s.to_string())
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::SerializationError(e.to_string())
    }
}
