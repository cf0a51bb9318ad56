//! Error types for the coordination engine

use thiserror::Error;

/// Coordination engine error types
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The coordination store rejected or failed an operation
    #[error("Store error: {0}")]
    Store(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Every resolver in an IP resolution chain came back empty
    #[error("Unresolved: {0}")]
    Unresolved(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the caller may retry the operation with backoff.
    ///
    /// Store unavailability is transient; everything else is not.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Store(_) | Self::Timeout(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Result type for coordination operations
pub type Result<T> = std::result::Result<T, Error>;
