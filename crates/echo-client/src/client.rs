//! Client connection management

use crate::{config::ClientConfig, ClientError, Result};
use sam_core::{
    default_session_options, generate_random_nickname, SamError, SamService, StreamSetup,
    TRANSIENT_DESTINATION,
};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

const REPLY_BUFFER_SIZE: usize = 8192;

/// The echo client: one SAM session and one data stream to the target
pub struct Client {
    /// Client configuration
    config: ClientConfig,

    /// SAM service owning the control connection
    service: SamService,

    /// Data stream to the target, once connected
    stream: Option<StreamSetup>,
}

impl Client {
    /// Create a new client
    pub fn new(config: ClientConfig) -> Self {
        let service = SamService::with_transport(
            config.sam_host.clone(),
            config.sam_port,
            config.transport(),
        );

        Self {
            config,
            service,
            stream: None,
        }
    }

    /// Establish the SAM session and open the stream to the target.
    pub async fn connect(&mut self) -> Result<()> {
        let target = self.config.target.clone().ok_or_else(|| {
            ClientError::Config(
                "no target address; use --target or set it in the config".to_string(),
            )
        })?;

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

        info!("Local address: {}", session.local_b32_address);
        if session.maybe_unreliable {
            warn!("Session came up suspiciously fast; the tunnel may not be ready yet");
        }

        info!("Connecting to {}", target);
        let stream = self
            .service
            .connect_to_peer_via_new_connection(
                &session.session_id,
                &target,
                &default_session_options(),
            )
            .await
            .map_err(|e| {
                error!("Failed to connect to {}: {}", target, e);
                e
            })?;

        self.stream = Some(stream);
        Ok(())
    }

    /// Send one line and wait for its echo.
    pub async fn echo(&self, line: &str) -> Result<String> {
        let stream = self.stream.as_ref().ok_or(ClientError::NotConnected)?;
        let reply_timeout = Duration::from_secs(self.config.reply_timeout_secs);

        stream.connection.stream_write(line.as_bytes(), None).await?;

        let mut reply = [0u8; REPLY_BUFFER_SIZE];
        let n = stream
            .connection
            .stream_read(&mut reply, Some(reply_timeout))
            .await?;
        Ok(String::from_utf8_lossy(&reply[..n]).into_owned())
    }

    /// Drive the interactive loop: stdin lines out, echoes printed back.
    pub async fn run(&mut self) -> Result<()> {
        self.connect().await?;
        info!("Connected; type lines to echo, Ctrl-D to quit");

        let mut stdin = BufReader::new(tokio::io::stdin()).lines();
        loop {
            let line = tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                line = stdin.next_line() => line?,
            };
            let Some(line) = line else { break };
            if line.is_empty() {
                continue;
            }

            match self.echo(&line).await {
                Ok(reply) => println!("{}", reply),
                Err(ClientError::Sam(SamError::Eof)) => {
                    info!("Server closed the stream");
                    break;
                }
                Err(ClientError::Sam(SamError::Timeout)) => {
                    warn!("No echo within {} s", self.config.reply_timeout_secs);
                    break;
                }
                Err(e) => {
                    error!("Echo failed: {}", e);
                    break;
                }
            }
        }

        self.disconnect();
        info!("Done");
        Ok(())
    }

    /// Close the data stream and the control session.
    pub fn disconnect(&mut self) {
        if let Some(stream) = self.stream.take() {
            stream.connection.close();
        }
        self.service.shutdown();
    }
}
