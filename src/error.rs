//! Error types for cache operations
//!
//! Every failure the caching layer can surface is a [`CacheError`]. The type is
//! `Clone` so a single outcome can be handed to every caller waiting on a
//! deduplicated fetch.

use thiserror::Error;

/// Main error type for cache operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// The backing key-value store is not configured, unreachable, or failed a command
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Serialization/Deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A caller-supplied fetch function failed
    #[error("Upstream fetch failed: {0}")]
    Upstream(String),

    /// A deduplicated request did not settle in time
    #[error("Request timeout after {timeout_ms}ms: {key}")]
    DeduplicationTimeout { key: String, timeout_ms: u64 },

    /// Invalidation rule lookup failed
    #[error("Invalidation rule not found: {0}")]
    RuleNotFound(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A key pattern could not be compiled
    #[error("Invalid key pattern: {0}")]
    InvalidPattern(String),

    /// HTTP transport error while polling for changes
    #[error("HTTP error: {0}")]
    Http(String),

    /// Generic error with context
    #[error("Error: {0}")]
    Other(String),
}

/// Result type alias for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;

impl CacheError {
    /// Wrap any displayable failure from a fetch function
    pub fn upstream(err: impl std::fmt::Display) -> Self {
        CacheError::Upstream(err.to_string())
    }

    /// Short, stable label used when recording error metrics
    pub fn kind(&self) -> &'static str {
        match self {
            CacheError::StoreUnavailable(_) => "store_unavailable",
            CacheError::Serialization(_) => "serialization",
            CacheError::Upstream(_) => "upstream",
            CacheError::DeduplicationTimeout { .. } => "dedupe_timeout",
            CacheError::RuleNotFound(_) => "rule_not_found",
            CacheError::Config(_) => "config",
            CacheError::InvalidPattern(_) => "invalid_pattern",
            CacheError::Http(_) => "http",
            CacheError::Other(_) => "other",
        }
    }
}

impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        CacheError::StoreUnavailable(err.to_string())
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Serialization(err.to_string())
    }
}

impl From<glob::PatternError> for CacheError {
    fn from(err: glob::PatternError) -> Self {
        CacheError::InvalidPattern(err.to_string())
    }
}

impl From<reqwest::Error> for CacheError {
    fn from(err: reqwest::Error) -> Self {
        CacheError::Http(err.to_string())
    }
}

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
