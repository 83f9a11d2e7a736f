//! SAM session and stream composition
//!
//! A SAM session multiplexes one identity across independent TCP links:
//! the control connection carries `SESSION CREATE` and then just holds the
//! session open, while every data stream repeats `HELLO` plus
//! `STREAM ACCEPT`/`CONNECT ID=<session>` on a fresh connection of its own.

use crate::connection::{Connection, CONNECT_TIMEOUT, HELLO_TIMEOUT};
use crate::identity::{b32_from_sam_destination, SIGNING_KEY_TYPE_EDDSA_SHA512_ED25519};
use crate::parser::{ReplyKind, ReplyMessage, ResultCode};
use crate::transport::Transport;
use crate::{Result, SamError};
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Default I2P SAM bridge port
pub const DEFAULT_SAM_PORT: u16 = 7656;

/// Keyword for a bridge-generated throwaway destination
pub const TRANSIENT_DESTINATION: &str = "TRANSIENT";

/// Tunnel build can take minutes on a cold router.
const SESSION_CREATE_TIMEOUT: Duration = Duration::from_secs(3 * 60);
const STREAM_ACCEPT_TIMEOUT: Duration = Duration::from_secs(120);
const STREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(90);
const NAMING_LOOKUP_TIMEOUT: Duration = Duration::from_secs(30);
const DEST_GENERATE_TIMEOUT: Duration = Duration::from_secs(30);
/// Acceptors park here until a peer dials in.
const ACCEPT_PEER_WAIT: Duration = Duration::from_secs(7 * 24 * 60 * 60);
/// A SESSION STATUS OK faster than this usually means the bridge replayed
/// a cached tunnel that is not actually ready yet.
const SUSPICIOUSLY_FAST_SESSION: Duration = Duration::from_secs(2);
/// Shortest plausible `<52 chars>.b32.i2p` form
const MIN_B32_ADDRESS_LEN: usize = 50;

/// Outcome of [`SamService::establish_control_session`]
#[derive(Debug, Clone)]
pub struct EstablishedSession {
    /// The session nickname now registered with the bridge
    pub session_id: String,
    /// Our own `.b32.i2p` address
    pub local_b32_address: String,
    /// Raw `DESTINATION=` field from the SESSION STATUS reply
    pub raw_destination_reply: String,
    /// Wall-clock time the bridge took to answer SESSION CREATE
    pub creation_duration: Duration,
    /// True when the bridge answered OK suspiciously fast; the tunnel may
    /// not be usable yet
    pub maybe_unreliable: bool,
}

/// Outcome of a stream accept/connect: the peer's address plus the data
/// connection, which is transferred to the caller.
#[derive(Debug)]
pub struct StreamSetup {
    pub remote_peer_b32_address: String,
    pub connection: Connection,
}

/// A name resolved through the bridge's naming service
#[derive(Debug, Clone)]
pub struct ResolvedName {
    pub name: String,
    /// Full Base64 destination
    pub destination: String,
    pub b32_address: String,
}

/// A keypair generated by the bridge via `DEST GENERATE`
#[derive(Debug, Clone)]
pub struct GeneratedDestination {
    pub pub_key: String,
    pub priv_key: String,
}

/// Session options the demo tooling has always used: interactive streaming
/// profile over short tunnels.
pub fn default_session_options() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("i2p.streaming.profile".to_string(), "INTERACTIVE".to_string()),
        ("inbound.length".to_string(), "1".to_string()),
        ("outbound.length".to_string(), "1".to_string()),
    ])
}

/// High-level SAM client: owns the control connection and opens data
/// connections on demand.
pub struct SamService {
    host: String,
    port: u16,
    transport: Transport,
    control: Mutex<Option<Connection>>,
    control_session_id: Mutex<Option<String>>,
}

impl SamService {
    /// Service for a plain-TCP bridge
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self::with_transport(host, port, Transport::Tcp)
    }

    pub fn with_transport(host: impl Into<String>, port: u16, transport: Transport) -> Self {
        Self {
            host: host.into(),
            port,
            transport,
            control: Mutex::new(None),
            control_session_id: Mutex::new(None),
        }
    }

    /// Establish the control session this service's streams will run under.
    ///
    /// `private_key_b64_or_transient` is either a full private-key blob or
    /// [`TRANSIENT_DESTINATION`]; `signature_type` is appended only for
    /// fixed keys and may be empty. An existing control connection is
    /// closed and replaced.
    pub async fn establish_control_session(
        &self,
        nickname: &str,
        private_key_b64_or_transient: &str,
        signature_type: &str,
        options: &BTreeMap<String, String>,
    ) -> Result<EstablishedSession> {
        if let Some(existing) = self.control.lock().unwrap().take() {
            if existing.is_open() {
                info!("control connection already open, closing to re-establish '{}'", nickname);
                existing.close();
            }
        }

        let connection = Connection::new(self.transport.clone());
        match self
            .establish_on(&connection, nickname, private_key_b64_or_transient, signature_type, options)
            .await
        {
            Ok(session) => {
                info!(
                    "control SAM session '{}' established, local address {}",
                    nickname, session.local_b32_address
                );
                *self.control.lock().unwrap() = Some(connection);
                *self.control_session_id.lock().unwrap() = Some(nickname.to_string());
                Ok(session)
            }
            Err(e) => {
                error!("establishing control session '{}' failed: {}", nickname, e);
                connection.close();
                Err(e)
            }
        }
    }

    async fn establish_on(
        &self,
        connection: &Connection,
        nickname: &str,
        private_key_b64_or_transient: &str,
        signature_type: &str,
        options: &BTreeMap<String, String>,
    ) -> Result<EstablishedSession> {
        connection.connect(&self.host, self.port, CONNECT_TIMEOUT).await?;
        let hello = connection.perform_hello(HELLO_TIMEOUT).await?;
        if hello.result != ResultCode::Ok {
            return Err(SamError::Protocol(format!("HELLO failed: {}", hello.original_line)));
        }

        let transient = private_key_b64_or_transient == TRANSIENT_DESTINATION;
        let command = build_session_command(
            nickname,
            private_key_b64_or_transient,
            signature_type,
            options,
        );

        let started = Instant::now();
        let status = connection
            .send_command_and_wait_reply(&command, SESSION_CREATE_TIMEOUT)
            .await?;
        let creation_duration = started.elapsed();
        info!(
            "SESSION CREATE answered in {} ms: {}",
            creation_duration.as_millis(),
            if status.result == ResultCode::Ok { "OK" } else { "error" }
        );

        if status.kind != ReplyKind::SessionStatus || status.result != ResultCode::Ok {
            return Err(SamError::Protocol(format!(
                "SESSION CREATE failed: {}",
                status.original_line
            )));
        }

        let maybe_unreliable = creation_duration < SUSPICIOUSLY_FAST_SESSION;
        if maybe_unreliable {
            warn!(
                "SESSION CREATE returned OK in {} ms; the tunnel may not be ready yet",
                creation_duration.as_millis()
            );
        }

        let raw_destination_reply = status.destination_field;
        if raw_destination_reply.is_empty() {
            return Err(SamError::Protocol(
                "SESSION STATUS reply carried no DESTINATION field".to_string(),
            ));
        }

        let local_b32_address = b32_from_sam_destination(&raw_destination_reply, transient);
        if local_b32_address.contains("(Error:") || local_b32_address.contains("(Warning:") {
            // Not fatal: the raw destination is still usable for the session.
            warn!("local destination did not fully parse: {}", local_b32_address);
        }

        Ok(EstablishedSession {
            session_id: nickname.to_string(),
            local_b32_address,
            raw_destination_reply,
            creation_duration,
            maybe_unreliable,
        })
    }

    /// Wait for an inbound stream on a fresh data connection.
    ///
    /// Blocks until a peer dials the session (or the far-off accept window
    /// lapses). On success the returned connection is in data mode and
    /// belongs to the caller.
    pub async fn accept_stream_via_new_connection(
        &self,
        control_session_id: &str,
    ) -> Result<StreamSetup> {
        let connection = Connection::new(self.transport.clone());
        match self.accept_on(&connection, control_session_id).await {
            Ok(remote_peer_b32_address) => {
                connection.enter_data_stream_mode()?;
                info!(
                    "accepted stream from {} for session '{}'",
                    remote_peer_b32_address, control_session_id
                );
                Ok(StreamSetup {
                    remote_peer_b32_address,
                    connection,
                })
            }
            Err(e) => {
                error!("stream accept for session '{}' failed: {}", control_session_id, e);
                connection.close();
                Err(e)
            }
        }
    }

    async fn accept_on(&self, connection: &Connection, session_id: &str) -> Result<String> {
        connection.connect(&self.host, self.port, CONNECT_TIMEOUT).await?;
        let hello = connection.perform_hello(HELLO_TIMEOUT).await?;
        if hello.result != ResultCode::Ok {
            return Err(SamError::Protocol(format!("HELLO failed: {}", hello.original_line)));
        }

        let command = format!("STREAM ACCEPT ID={} SILENT=false", session_id);
        let status = connection
            .send_command_and_wait_reply(&command, STREAM_ACCEPT_TIMEOUT)
            .await?;
        debug!("STREAM ACCEPT reply: {}", status.original_line);
        require_stream_ok(&status, "STREAM ACCEPT")?;

        // Some bridges put FROM_DESTINATION on the status line; others push
        // it as its own line once a peer actually arrives.
        let remote = if !status.destination_field.is_empty() {
            b32_from_sam_destination(&status.destination_field, false)
        } else {
            let line = connection.read_line(ACCEPT_PEER_WAIT).await?;
            // SAM 3.2 may append FROM_PORT/TO_PORT after the destination
            let dest = line.split_whitespace().next().unwrap_or("");
            if dest.is_empty() {
                return Err(SamError::Protocol(
                    "peer destination line was empty".to_string(),
                ));
            }
            b32_from_sam_destination(dest, false)
        };

        if remote.len() < MIN_B32_ADDRESS_LEN
            || remote.contains("(Error:")
            || remote.contains("(Warning:")
        {
            return Err(SamError::InvalidDestination(remote));
        }
        Ok(remote)
    }

    /// Open an outbound stream to `target_b32` on a fresh data connection.
    pub async fn connect_to_peer_via_new_connection(
        &self,
        control_session_id: &str,
        target_b32: &str,
        stream_options: &BTreeMap<String, String>,
    ) -> Result<StreamSetup> {
        let connection = Connection::new(self.transport.clone());
        match self
            .connect_on(&connection, control_session_id, target_b32, stream_options)
            .await
        {
            Ok(()) => {
                connection.enter_data_stream_mode()?;
                info!(
                    "connected to {} via session '{}'",
                    target_b32, control_session_id
                );
                Ok(StreamSetup {
                    remote_peer_b32_address: target_b32.to_string(),
                    connection,
                })
            }
            Err(e) => {
                error!("stream connect to {} failed: {}", target_b32, e);
                connection.close();
                Err(e)
            }
        }
    }

    async fn connect_on(
        &self,
        connection: &Connection,
        session_id: &str,
        target_b32: &str,
        stream_options: &BTreeMap<String, String>,
    ) -> Result<()> {
        connection.connect(&self.host, self.port, CONNECT_TIMEOUT).await?;
        let hello = connection.perform_hello(HELLO_TIMEOUT).await?;
        if hello.result != ResultCode::Ok {
            return Err(SamError::Protocol(format!("HELLO failed: {}", hello.original_line)));
        }

        let mut command = format!(
            "STREAM CONNECT ID={} DESTINATION={} SILENT=false",
            session_id, target_b32
        );
        for (key, value) in stream_options {
            command.push_str(&format!(" {}={}", key, value));
        }

        let status = connection
            .send_command_and_wait_reply(&command, STREAM_CONNECT_TIMEOUT)
            .await?;
        debug!("STREAM CONNECT reply: {}", status.original_line);
        require_stream_ok(&status, "STREAM CONNECT")
    }

    /// Resolve an I2P name (`*.i2p`, `*.b32.i2p`, or a full destination)
    /// through the bridge, on a throwaway connection.
    pub async fn lookup_name_via_new_connection(&self, name: &str) -> Result<ResolvedName> {
        let connection = Connection::new(self.transport.clone());
        let result = self.lookup_on(&connection, name).await;
        connection.close();
        result
    }

    async fn lookup_on(&self, connection: &Connection, name: &str) -> Result<ResolvedName> {
        connection.connect(&self.host, self.port, CONNECT_TIMEOUT).await?;
        let hello = connection.perform_hello(HELLO_TIMEOUT).await?;
        if hello.result != ResultCode::Ok {
            return Err(SamError::Protocol(format!("HELLO failed: {}", hello.original_line)));
        }

        let command = format!("NAMING LOOKUP NAME={}", name);
        let reply = connection
            .send_command_and_wait_reply(&command, NAMING_LOOKUP_TIMEOUT)
            .await?;
        if reply.kind != ReplyKind::NamingReply || reply.result != ResultCode::Ok {
            return Err(SamError::Protocol(format!(
                "NAMING LOOKUP failed: {}",
                reply.original_line
            )));
        }
        if reply.value.is_empty() {
            return Err(SamError::Protocol(
                "NAMING REPLY carried no VALUE field".to_string(),
            ));
        }

        let b32_address = b32_from_sam_destination(&reply.value, false);
        Ok(ResolvedName {
            name: if reply.name.is_empty() { name.to_string() } else { reply.name },
            destination: reply.value,
            b32_address,
        })
    }

    /// Ask the bridge to generate a fresh Ed25519 destination keypair,
    /// on a throwaway connection.
    pub async fn generate_destination_via_new_connection(&self) -> Result<GeneratedDestination> {
        let connection = Connection::new(self.transport.clone());
        let result = self.generate_on(&connection).await;
        connection.close();
        result
    }

    async fn generate_on(&self, connection: &Connection) -> Result<GeneratedDestination> {
        connection.connect(&self.host, self.port, CONNECT_TIMEOUT).await?;
        let hello = connection.perform_hello(HELLO_TIMEOUT).await?;
        if hello.result != ResultCode::Ok {
            return Err(SamError::Protocol(format!("HELLO failed: {}", hello.original_line)));
        }

        let command = format!(
            "DEST GENERATE SIGNATURE_TYPE={}",
            SIGNING_KEY_TYPE_EDDSA_SHA512_ED25519
        );
        let reply = connection
            .send_command_and_wait_reply(&command, DEST_GENERATE_TIMEOUT)
            .await?;
        if reply.kind != ReplyKind::DestReply || reply.result != ResultCode::Ok {
            return Err(SamError::Protocol(format!(
                "DEST GENERATE failed: {}",
                reply.original_line
            )));
        }

        Ok(GeneratedDestination {
            pub_key: reply.pub_key,
            priv_key: reply.priv_key,
        })
    }

    /// The session id of the current control connection, if one was
    /// established.
    pub fn control_session_id(&self) -> Option<String> {
        self.control_session_id.lock().unwrap().clone()
    }

    /// True while the control connection is up.
    pub fn is_open(&self) -> bool {
        self.control
            .lock()
            .unwrap()
            .as_ref()
            .map(Connection::is_open)
            .unwrap_or(false)
    }

    /// Close the control connection. Losing it invalidates the session.
    pub fn shutdown(&self) {
        if let Some(connection) = self.control.lock().unwrap().take() {
            info!("closing control connection");
            connection.close();
        }
    }
}

impl Drop for SamService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn build_session_command(
    nickname: &str,
    private_key_b64_or_transient: &str,
    signature_type: &str,
    options: &BTreeMap<String, String>,
) -> String {
    let mut command = format!(
        "SESSION CREATE STYLE=STREAM ID={} DESTINATION={}",
        nickname, private_key_b64_or_transient
    );
    if private_key_b64_or_transient != TRANSIENT_DESTINATION && !signature_type.is_empty() {
        command.push_str(&format!(" SIGNATURE_TYPE={}", signature_type));
    }
    for (key, value) in options {
        command.push_str(&format!(" {}={}", key, value));
    }
    command
}

fn require_stream_ok(status: &ReplyMessage, what: &str) -> Result<()> {
    if status.kind != ReplyKind::StreamStatus || status.result != ResultCode::Ok {
        return Err(SamError::Protocol(format!(
            "{} failed: {}",
            what, status.original_line
        )));
    }
    Ok(())
}
