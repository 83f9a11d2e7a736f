//! SAM bridge connection state machine
//!
//! One `Connection` owns one TCP (or TLS) link to the SAM bridge. The
//! control phase is line-oriented (`HELLO`, `SESSION`, `STREAM` commands);
//! after a successful `STREAM ACCEPT`/`STREAM CONNECT` the same link is
//! repurposed to carry opaque stream bytes.
//!
//! All I/O entry points take `&self` so a connection can be shared across
//! tasks (one reader, any number of writers); `close` and
//! `cancel_read_operations` are synchronous and may be called from
//! anywhere.

use crate::parser::{parse_reply, ReplyKind, ReplyMessage, ResultCode};
use crate::transport::{SamStream, Transport};
use crate::{Result, SamError};
use bytes::{Buf, BytesMut};
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Default timeout for `connect`
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Default timeout for `perform_hello`
pub const HELLO_TIMEOUT: Duration = Duration::from_secs(5);
/// Default reply timeout for `send_command_and_wait_reply`
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);
/// Default timeout for `stream_read`
pub const STREAM_READ_TIMEOUT: Duration = Duration::from_secs(5 * 60);
/// Default timeout for `stream_write`
pub const STREAM_WRITE_TIMEOUT: Duration = Duration::from_secs(30);

const HELLO_COMMAND: &str = "HELLO VERSION MIN=3.1 MAX=3.2\n";

const READ_BUFFER_CAPACITY: usize = 8 * 1024;

/// Connection lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Link up, `HELLO` not yet verified
    ConnectedNoHello,
    /// `HELLO` succeeded, ready for commands
    HelloOk,
    /// `STREAM ACCEPT`/`CONNECT` succeeded, link carries raw stream bytes
    DataStream,
    Closing,
    Closed,
    /// Unrecoverable control-phase protocol failure
    Error,
}

struct LineReader {
    half: ReadHalf<Box<dyn SamStream>>,
    /// Holds leftovers past a `\n` so no bytes are lost when the link
    /// switches from line replies to raw stream data.
    buf: BytesMut,
}

enum ReadEvent {
    Data(std::io::Result<usize>),
    ReadCancelled,
    Closed,
    TimedOut,
}

enum WriteEvent {
    Done(std::io::Result<()>),
    Closed,
    TimedOut,
}

/// One TCP/TLS link to the SAM bridge.
///
/// A connection serves either the control role or one data stream, never
/// both. `Drop` forces `close`.
pub struct Connection {
    transport: Transport,
    state: Mutex<ConnectionState>,
    reader: AsyncMutex<Option<LineReader>>,
    /// Doubles as the write-serialisation token: concurrent writers queue
    /// here and run in acquisition order.
    writer: AsyncMutex<Option<WriteHalf<Box<dyn SamStream>>>>,
    /// Fired only by `close`; observed by reads and writes.
    shutdown: Mutex<CancellationToken>,
    /// Fired by `cancel_read_operations`; wakes pending reads only.
    read_cancel: Notify,
}

impl Connection {
    pub fn new(transport: Transport) -> Self {
        Self {
            transport,
            state: Mutex::new(ConnectionState::Disconnected),
            reader: AsyncMutex::new(None),
            writer: AsyncMutex::new(None),
            shutdown: Mutex::new(CancellationToken::new()),
            read_cancel: Notify::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, new_state: ConnectionState) {
        let mut state = self.state.lock().unwrap();
        debug!("connection state {:?} -> {:?}", *state, new_state);
        *state = new_state;
    }

    pub fn is_open(&self) -> bool {
        matches!(
            self.state(),
            ConnectionState::ConnectedNoHello
                | ConnectionState::HelloOk
                | ConnectionState::DataStream
        )
    }

    fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.lock().unwrap().clone()
    }

    /// Resolve `host` and open the link, completing within `timeout`.
    ///
    /// Allowed from `Disconnected` and `Closed` (a closed connection may be
    /// reconnected). Timeout leaves the connection `Disconnected`; any other
    /// failure closes it.
    pub async fn connect(&self, host: &str, port: u16, timeout: Duration) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            if !matches!(
                *state,
                ConnectionState::Disconnected | ConnectionState::Closed
            ) {
                return Err(SamError::InvalidState {
                    op: "connect",
                    state: *state,
                });
            }
            *state = ConnectionState::Connecting;
        }
        // Fresh token: the previous one is spent if this is a reconnect.
        *self.shutdown.lock().unwrap() = CancellationToken::new();

        match tokio::time::timeout(timeout, self.transport.open(host, port)).await {
            Err(_) => {
                warn!("timeout connecting to {}:{}", host, port);
                self.set_state(ConnectionState::Disconnected);
                Err(SamError::Timeout)
            }
            Ok(Err(e)) => {
                error!("connect to {}:{} failed: {}", host, port, e);
                self.close();
                Err(e)
            }
            Ok(Ok(stream)) => {
                let (read_half, write_half) = tokio::io::split(stream);
                *self.reader.lock().await = Some(LineReader {
                    half: read_half,
                    buf: BytesMut::with_capacity(READ_BUFFER_CAPACITY),
                });
                *self.writer.lock().await = Some(write_half);
                self.set_state(ConnectionState::ConnectedNoHello);
                info!("connected to SAM bridge at {}:{}", host, port);
                Ok(())
            }
        }
    }

    /// Send `HELLO VERSION` and verify the reply.
    ///
    /// On `RESULT=OK` the connection becomes ready for commands. A rejected
    /// `HELLO` is returned to the caller with the connection failed and
    /// closed; transport errors come back as `Err` with the same effect.
    pub async fn perform_hello(&self, timeout: Duration) -> Result<ReplyMessage> {
        let state = self.state();
        if state != ConnectionState::ConnectedNoHello {
            return Err(SamError::InvalidState {
                op: "perform_hello",
                state,
            });
        }

        match self.command_roundtrip(HELLO_COMMAND, timeout).await {
            Ok(reply) => {
                if reply.kind == ReplyKind::HelloReply && reply.result == ResultCode::Ok {
                    debug!("HELLO ok");
                    self.set_state(ConnectionState::HelloOk);
                } else {
                    error!("HELLO rejected: {}", reply.original_line);
                    self.fail_control_phase();
                }
                Ok(reply)
            }
            Err(e) => {
                error!("HELLO failed: {}", e);
                self.fail_control_phase();
                Err(e)
            }
        }
    }

    /// Write one command line and await its reply.
    ///
    /// Strictly request/response: the next line read is the reply to this
    /// command, so callers must not interleave two calls on one connection.
    /// A trailing `\n` is appended when missing. Replies are returned
    /// whatever their `RESULT`; transport failures fail the connection.
    pub async fn send_command_and_wait_reply(
        &self,
        command: &str,
        reply_timeout: Duration,
    ) -> Result<ReplyMessage> {
        let state = self.state();
        if state != ConnectionState::HelloOk {
            return Err(SamError::InvalidState {
                op: "send_command_and_wait_reply",
                state,
            });
        }

        let mut line = command.to_string();
        if !line.ends_with('\n') {
            line.push('\n');
        }

        match self.command_roundtrip(&line, reply_timeout).await {
            Ok(reply) => Ok(reply),
            Err(e) => {
                error!("command '{}' failed: {}", command.trim_end(), e);
                self.fail_control_phase();
                Err(e)
            }
        }
    }

    async fn command_roundtrip(&self, line: &str, reply_timeout: Duration) -> Result<ReplyMessage> {
        self.write_bytes(line.as_bytes()).await?;
        let reply = self.read_line(reply_timeout).await?;
        Ok(parse_reply(&reply))
    }

    /// Control-phase writes race the shutdown token like data-phase ones,
    /// so a `close` aborts an in-flight command write too.
    async fn write_bytes(&self, data: &[u8]) -> Result<()> {
        let token = self.shutdown_token();
        let mut guard = self.writer.lock().await;
        let half = match guard.as_mut() {
            Some(half) => half,
            None => return Err(SamError::Cancelled),
        };

        let wrote = tokio::select! {
            _ = token.cancelled() => None,
            wrote = async {
                half.write_all(data).await?;
                half.flush().await
            } => Some(wrote),
        };

        match wrote {
            Some(Ok(())) => Ok(()),
            Some(Err(e)) => Err(SamError::Io(e)),
            None => {
                guard.take();
                Err(SamError::Cancelled)
            }
        }
    }

    /// Read bytes until `\n` and return the line without it.
    ///
    /// Leftover bytes past the newline stay buffered for later reads. Fails
    /// with `Timeout` after `timeout`, with `Cancelled` when unblocked by
    /// `cancel_read_operations` or `close`, and with `Eof` when the bridge
    /// hangs up mid-line.
    pub async fn read_line(&self, timeout: Duration) -> Result<String> {
        let token = self.shutdown_token();
        let mut guard = self.reader.lock().await;

        let deadline = sleep(timeout);
        tokio::pin!(deadline);
        let cancelled = self.read_cancel.notified();
        tokio::pin!(cancelled);
        cancelled.as_mut().enable();

        loop {
            let reader = match guard.as_mut() {
                Some(reader) => reader,
                None => return Err(SamError::Cancelled),
            };

            if let Some(pos) = reader.buf.iter().position(|&b| b == b'\n') {
                let mut line = reader.buf.split_to(pos + 1);
                line.truncate(pos);
                return Ok(String::from_utf8_lossy(&line).into_owned());
            }

            let event = tokio::select! {
                _ = token.cancelled() => ReadEvent::Closed,
                _ = cancelled.as_mut() => ReadEvent::ReadCancelled,
                _ = &mut deadline => ReadEvent::TimedOut,
                read = reader.half.read_buf(&mut reader.buf) => ReadEvent::Data(read),
            };

            match event {
                ReadEvent::Data(Ok(0)) => return Err(SamError::Eof),
                ReadEvent::Data(Ok(_)) => continue,
                ReadEvent::Data(Err(e)) => return Err(SamError::Io(e)),
                ReadEvent::ReadCancelled => {
                    debug!("read_line cancelled");
                    return Err(SamError::Cancelled);
                }
                ReadEvent::Closed => {
                    guard.take();
                    return Err(SamError::Cancelled);
                }
                ReadEvent::TimedOut => {
                    warn!("timeout waiting for SAM reply line");
                    return Err(SamError::Timeout);
                }
            }
        }
    }

    /// One partial read of stream data into `buf`.
    ///
    /// `None` (or a zero duration) waits indefinitely. A zero-byte read is
    /// the peer's EOF and surfaces as `Err(Eof)`. Timeouts do not close the
    /// connection; at most one `stream_read` may be in flight at a time.
    pub async fn stream_read(&self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize> {
        let state = self.state();
        if state != ConnectionState::DataStream {
            return Err(SamError::InvalidState {
                op: "stream_read",
                state,
            });
        }

        let token = self.shutdown_token();
        let mut guard = self.reader.lock().await;
        let reader = match guard.as_mut() {
            Some(reader) => reader,
            None => return Err(SamError::Cancelled),
        };

        // The control phase may have buffered past its last reply line;
        // hand those bytes out before touching the socket.
        if !reader.buf.is_empty() {
            let n = reader.buf.len().min(buf.len());
            buf[..n].copy_from_slice(&reader.buf[..n]);
            reader.buf.advance(n);
            return Ok(n);
        }

        let deadline = async {
            match timeout {
                Some(t) if !t.is_zero() => sleep(t).await,
                _ => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(deadline);
        let cancelled = self.read_cancel.notified();
        tokio::pin!(cancelled);
        cancelled.as_mut().enable();

        let event = tokio::select! {
            _ = token.cancelled() => ReadEvent::Closed,
            _ = cancelled.as_mut() => ReadEvent::ReadCancelled,
            _ = &mut deadline => ReadEvent::TimedOut,
            read = reader.half.read(buf) => ReadEvent::Data(read),
        };

        match event {
            ReadEvent::Data(Ok(0)) => {
                debug!("EOF from peer");
                Err(SamError::Eof)
            }
            ReadEvent::Data(Ok(n)) => Ok(n),
            ReadEvent::Data(Err(e)) => {
                error!("stream read error: {}", e);
                guard.take();
                drop(guard);
                self.close();
                Err(SamError::Io(e))
            }
            ReadEvent::ReadCancelled => {
                debug!("stream_read cancelled");
                Err(SamError::Cancelled)
            }
            ReadEvent::Closed => {
                guard.take();
                Err(SamError::Cancelled)
            }
            ReadEvent::TimedOut => {
                warn!("stream_read timeout");
                Err(SamError::Timeout)
            }
        }
    }

    /// Write the whole of `data` to the peer.
    ///
    /// Concurrent writers are serialised; the bytes of one call are never
    /// interleaved with another's. `None` waits indefinitely. A write
    /// timeout closes the connection: a hung write means a broken peer.
    pub async fn stream_write(&self, data: &[u8], timeout: Option<Duration>) -> Result<()> {
        let state = self.state();
        if state != ConnectionState::DataStream {
            return Err(SamError::InvalidState {
                op: "stream_write",
                state,
            });
        }

        let token = self.shutdown_token();
        let mut guard = self.writer.lock().await;
        let half = match guard.as_mut() {
            Some(half) => half,
            None => return Err(SamError::Cancelled),
        };

        // Writes get their own deadline and do not listen to the read-cancel
        // wakeup, so cancelling readers never aborts a writer.
        let deadline = async {
            match timeout {
                Some(t) if !t.is_zero() => sleep(t).await,
                _ => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(deadline);

        let event = tokio::select! {
            _ = token.cancelled() => WriteEvent::Closed,
            _ = &mut deadline => WriteEvent::TimedOut,
            wrote = async {
                half.write_all(data).await?;
                half.flush().await
            } => WriteEvent::Done(wrote),
        };

        match event {
            WriteEvent::Done(Ok(())) => Ok(()),
            WriteEvent::Done(Err(e)) => {
                error!("stream write error: {}", e);
                guard.take();
                drop(guard);
                self.close();
                Err(SamError::Io(e))
            }
            WriteEvent::Closed => {
                guard.take();
                Err(SamError::Cancelled)
            }
            WriteEvent::TimedOut => {
                warn!("stream_write timeout, closing connection");
                guard.take();
                drop(guard);
                self.close();
                Err(SamError::Timeout)
            }
        }
    }

    /// Switch a command-phase connection over to raw data transfer.
    /// Called once the bridge has acknowledged `STREAM ACCEPT`/`CONNECT`.
    pub fn enter_data_stream_mode(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if *state != ConnectionState::HelloOk {
            return Err(SamError::InvalidState {
                op: "enter_data_stream_mode",
                state: *state,
            });
        }
        debug!("connection state {:?} -> {:?}", *state, ConnectionState::DataStream);
        *state = ConnectionState::DataStream;
        Ok(())
    }

    /// Wake any pending `read_line`/`stream_read` with `Cancelled` without
    /// closing the socket. Writers are unaffected.
    pub fn cancel_read_operations(&self) {
        debug!("cancelling pending reads");
        self.read_cancel.notify_waiters();
    }

    /// Control-phase failure: the connection is torn down but parked in
    /// `Error` rather than `Closed`, so the failure stays observable.
    fn fail_control_phase(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if matches!(*state, ConnectionState::Closing | ConnectionState::Closed) {
                return;
            }
            debug!("connection state {:?} -> {:?}", *state, ConnectionState::Error);
            *state = ConnectionState::Error;
        }
        self.teardown();
    }

    /// Close the connection. Synchronous, idempotent, callable from any
    /// state; pending reads and writes complete with `Cancelled`.
    pub fn close(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if matches!(*state, ConnectionState::Closing | ConnectionState::Closed) {
                return;
            }
            debug!("connection state {:?} -> {:?}", *state, ConnectionState::Closing);
            *state = ConnectionState::Closing;
        }
        self.teardown();
        self.set_state(ConnectionState::Closed);
    }

    /// Release pending operations and drop whichever socket halves are not
    /// currently held by one. An operation that holds a half observes the
    /// cancelled token and drops it itself, so the socket closes promptly
    /// either way; dropping both halves closes both directions.
    fn teardown(&self) {
        self.shutdown.lock().unwrap().cancel();
        self.read_cancel.notify_waiters();
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }
        if let Ok(mut reader) = self.reader.try_lock() {
            // Buffered input goes with the half.
            reader.take();
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if !matches!(self.state(), ConnectionState::Closed) {
            self.close();
        }
    }
}
