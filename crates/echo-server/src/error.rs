//! Server error types

use thiserror::Error;

/// Server-related errors
#[derive(Error, Debug)]
pub enum ServerError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// SAM error
    #[error("SAM error: {0}")]
    Sam(#[from] sam_core::SamError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for server operations
pub type Result<T> = std::result::Result<T, ServerError>;
