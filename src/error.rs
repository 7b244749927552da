//! Error types for ratequeue.

use thiserror::Error;

/// Main error type for limiter and configuration operations.
#[derive(Error, Debug)]
pub enum RateQueueError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// An endpoint weight resolved to something that is not a non-negative number.
    #[error("Invalid endpoint config for '{method} {endpoint}'")]
    InvalidWeight {
        /// HTTP verb of the offending request
        method: String,
        /// Normalized endpoint of the offending request
        endpoint: String,
    },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for ratequeue operations.
pub type Result<T> = std::result::Result<T, RateQueueError>;
