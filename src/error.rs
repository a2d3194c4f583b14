//! Error types for the Quotagate admission layer.

use std::time::Duration;

use thiserror::Error;

/// Main error type for Quotagate operations.
#[derive(Error, Debug)]
pub enum QuotaError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A tier definition failed validation
    #[error("Invalid tier '{tier}': {reason}")]
    InvalidTier { tier: String, reason: String },

    /// A tier name that is not part of the registry was requested
    #[error("Unknown tier: {0}")]
    UnknownTier(String),

    /// The distributed store returned an error
    #[error("Backend error: {0}")]
    Backend(String),

    /// The distributed store did not answer in time
    #[error("Backend timed out after {0:?}")]
    Timeout(Duration),

    /// A custom identifier function failed
    #[error("Identifier resolution failed: {0}")]
    Identifier(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<redis::RedisError> for QuotaError {
    fn from(err: redis::RedisError) -> Self {
        QuotaError::Backend(err.to_string())
    }
}

impl From<config::ConfigError> for QuotaError {
    fn from(err: config::ConfigError) -> Self {
        QuotaError::Config(err.to_string())
    }
}

/// Result type alias for Quotagate operations.
pub type Result<T> = std::result::Result<T, QuotaError>;
