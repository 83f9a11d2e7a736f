//! Main server implementation

use crate::{config::ServerConfig, Result};
use sam_core::{
    default_session_options, generate_random_nickname, SamError, SamService, StreamSetup,
    TRANSIENT_DESTINATION,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::time::sleep;
use tracing::{error, info, warn};

const ECHO_BUFFER_SIZE: usize = 8192;

/// The echo server: one SAM control session plus an acceptor per free slot
pub struct Server {
    /// Server configuration
    config: Arc<ServerConfig>,

    /// SAM service owning the control connection
    service: Arc<SamService>,

    /// Streams currently being echoed
    active_streams: Arc<AtomicUsize>,
}

impl Server {
    /// Create a new server
    pub fn new(config: ServerConfig) -> Self {
        let service = Arc::new(SamService::with_transport(
            config.sam_host.clone(),
            config.sam_port,
            config.transport(),
        ));

        Self {
            config: Arc::new(config),
            service,
            active_streams: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Run the server: establish the session, then serve inbound streams
    /// until a shutdown signal arrives.
    pub async fn run(self) -> Result<()> {
        let session_key = self.config.session_key()?;
        let signature_type = if session_key == TRANSIENT_DESTINATION {
            String::new()
        } else {
            self.config.signature_type.clone()
        };
        let nickname = format!(
            "{}_{}",
            self.config.nickname_prefix,
            generate_random_nickname()
        );

        info!(
            "Establishing SAM session '{}' via {}:{}",
            nickname, self.config.sam_host, self.config.sam_port
        );
        let session = self
            .service
            .establish_control_session(
                &nickname,
                &session_key,
                &signature_type,
                &default_session_options(),
            )
            .await
            .map_err(|e| {
                error!("Failed to establish SAM session: {}", e);
                e
            })?;

        info!("Server address: {}", session.local_b32_address);
        if session.maybe_unreliable {
            warn!("Session came up suspiciously fast; the tunnel may not be ready yet");
        }

        tokio::select! {
            _ = self.accept_loop(&session.session_id) => {}
            result = signal::ctrl_c() => {
                match result {
                    Ok(()) => info!("Shutdown signal received"),
                    Err(err) => error!("Error waiting for shutdown signal: {}", err),
                }
            }
        }

        info!("Server shutting down...");
        self.service.shutdown();
        Ok(())
    }

    /// Keep up to `max_streams` echo streams in flight, one acceptor at a
    /// time.
    async fn accept_loop(&self, session_id: &str) {
        let read_timeout = Duration::from_secs(self.config.read_timeout_secs);

        loop {
            if self.active_streams.load(Ordering::SeqCst) >= self.config.max_streams {
                sleep(Duration::from_millis(200)).await;
                continue;
            }

            match self.service.accept_stream_via_new_connection(session_id).await {
                Ok(stream) => {
                    self.active_streams.fetch_add(1, Ordering::SeqCst);
                    let active_streams = self.active_streams.clone();
                    tokio::spawn(async move {
                        echo_stream(stream, read_timeout).await;
                        active_streams.fetch_sub(1, Ordering::SeqCst);
                    });
                }
                Err(e) => {
                    error!("Accept failed: {}", e);
                    sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }
}

/// Echo everything the peer sends until it hangs up or goes idle.
async fn echo_stream(stream: StreamSetup, read_timeout: Duration) {
    let peer = stream.remote_peer_b32_address;
    let connection = stream.connection;
    info!("Stream with {} started", peer);

    let mut buffer = [0u8; ECHO_BUFFER_SIZE];
    loop {
        let n = match connection.stream_read(&mut buffer, Some(read_timeout)).await {
            Ok(n) => n,
            Err(SamError::Eof) => {
                info!("Peer {} closed the stream", peer);
                break;
            }
            Err(SamError::Timeout) => {
                info!("Stream with {} idle, closing", peer);
                break;
            }
            Err(SamError::Cancelled) => break,
            Err(e) => {
                error!("Read error from {}: {}", peer, e);
                break;
            }
        };

        if let Err(e) = connection.stream_write(&buffer[..n], None).await {
            error!("Write error to {}: {}", peer, e);
            break;
        }
    }

    connection.close();
    info!("Stream with {} finished", peer);
}
