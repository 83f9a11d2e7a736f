//! Client error types

use thiserror::Error;

/// Client-related errors
#[derive(Error, Debug)]
pub enum ClientError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// SAM error
    #[error("SAM error: {0}")]
    Sam(#[from] sam_core::SamError),

    /// Not connected
    #[error("Not connected to server")]
    NotConnected,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for client operations
pub type Result<T> = std::result::Result<T, ClientError>;
