//! SAM error types

use crate::connection::ConnectionState;
use thiserror::Error;

/// Errors surfaced by SAM operations
#[derive(Error, Debug)]
pub enum SamError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Failed to reach the SAM bridge
    #[error("Connect failed: {0}")]
    Connect(String),

    /// SAM protocol failure; carries the bridge's reply verbatim
    #[error("SAM protocol error: {0}")]
    Protocol(String),

    /// Peer destination could not be parsed into a usable address
    #[error("Invalid destination: {0}")]
    InvalidDestination(String),

    /// Operation called in the wrong connection state
    #[error("{op} called in invalid state {state:?}")]
    InvalidState {
        op: &'static str,
        state: ConnectionState,
    },

    /// Operation timed out
    #[error("Operation timed out")]
    Timeout,

    /// Operation cancelled by `close` or `cancel_read_operations`
    #[error("Operation cancelled")]
    Cancelled,

    /// Peer closed the stream
    #[error("End of stream")]
    Eof,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for SAM operations
pub type Result<T> = std::result::Result<T, SamError>;
