//! SAM v3 stream client for I2P
//!
//! This crate talks to a local I2P router's SAM bridge to establish an
//! anonymous identity and carry TCP-like streams to and from peers
//! addressed by their `.b32.i2p` names. It hides the line-oriented SAM
//! control protocol, the per-connection state machine with timeouts and
//! cancellation, and the parsing of destination blobs into Base32
//! addresses.
//!
//! Default SAM port: 7656

pub mod connection;
pub mod encoding;
pub mod error;
pub mod identity;
pub mod parser;
pub mod service;
pub mod transport;

pub use connection::{Connection, ConnectionState};
pub use error::{Result, SamError};
pub use identity::{
    b32_from_sam_destination, generate_key_and_identity, generate_private_key,
    generate_random_nickname,
};
pub use parser::{parse_reply, ReplyKind, ReplyMessage, ResultCode};
pub use service::{
    default_session_options, EstablishedSession, GeneratedDestination, ResolvedName, SamService,
    StreamSetup, DEFAULT_SAM_PORT, TRANSIENT_DESTINATION,
};
pub use transport::{TlsOptions, Transport};
