//! Error types and result handling for the Argus core

use thiserror::Error;

/// Result type alias for Argus operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Argus core operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Unique constraint conflict: {0}")]
    Conflict(String),

    #[error("Sink delivery error: {0}")]
    SinkDelivery(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invariant violation: {0}")]
    Invariant(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Generic error: {0}")]
    Generic(#[from] anyhow::Error),
}

impl Error {
    /// Check if the error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Storage(_) | Error::Conflict(_) | Error::Timeout(_)
        )
    }

    /// Get error category for logging and metrics
    pub fn category(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation",
            Error::Storage(_) => "storage",
            Error::Conflict(_) => "conflict",
            Error::SinkDelivery(_) => "sink",
            Error::Config(_) => "config",
            Error::Invariant(_) => "invariant",
            Error::Timeout(_) => "timeout",
            Error::Serialization(_) => "serialization",
            Error::Generic(_) => "generic",
        }
    }
}
