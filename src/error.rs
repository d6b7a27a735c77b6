//! Error types for the Bulwark service.

use std::time::Duration;

use thiserror::Error;

/// Main error type for Bulwark operations.
#[derive(Error, Debug)]
pub enum BulwarkError {
    /// Configuration-related errors. Fatal at startup.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Counter store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// HTTP server errors
    #[error("Server error: {0}")]
    Server(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Bulwark operations.
pub type Result<T> = std::result::Result<T, BulwarkError>;

/// Failures reported by a counter store.
///
/// Every variant is treated as "store unavailable" by the limiter and
/// resolved through its failure policy.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The store could not be reached or refused the command.
    #[error("counter store unavailable: {0}")]
    Unavailable(String),

    /// The store did not answer within the configured timeout.
    #[error("counter store timed out after {0:?}")]
    Timeout(Duration),

    /// The store answered with something we could not interpret.
    #[error("unexpected counter store reply: {0}")]
    Protocol(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
            StoreError::Unavailable(err.to_string())
        } else {
            StoreError::Protocol(err.to_string())
        }
    }
}

impl From<config::ConfigError> for BulwarkError {
    fn from(err: config::ConfigError) -> Self {
        BulwarkError::Config(err.to_string())
    }
}
