//! Transport selection for bridge links
//!
//! The connection logic is transport-agnostic: both variants produce one
//! boxed async stream, so the control and data phases always run over the
//! same negotiated channel.

use crate::{Result, SamError};
use std::path::PathBuf;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// The byte stream a connection runs over
pub trait SamStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> SamStream for T {}

/// TLS settings for [`Transport::Tls`]
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    /// Verify the bridge certificate. Disable only for self-signed setups.
    pub verify_peer: bool,
    /// Additional PEM root certificate; the system store is used when `None`.
    pub ca_file: Option<PathBuf>,
}

/// How to reach the SAM bridge
#[derive(Debug, Clone, Default)]
pub enum Transport {
    #[default]
    Tcp,
    Tls(TlsOptions),
}

impl Transport {
    /// Open a stream to `host:port`, including the TLS handshake if selected.
    pub(crate) async fn open(&self, host: &str, port: u16) -> Result<Box<dyn SamStream>> {
        let tcp = TcpStream::connect((host, port))
            .await
            .map_err(|e| SamError::Connect(format!("{}:{}: {}", host, port, e)))?;

        match self {
            Transport::Tcp => Ok(Box::new(tcp)),
            Transport::Tls(options) => {
                let connector = build_connector(options)?;
                let tls = connector
                    .connect(host, tcp)
                    .await
                    .map_err(|e| {
                        SamError::Connect(format!("TLS handshake with {}:{}: {}", host, port, e))
                    })?;
                Ok(Box::new(tls))
            }
        }
    }
}

fn build_connector(options: &TlsOptions) -> Result<tokio_native_tls::TlsConnector> {
    let mut builder = native_tls::TlsConnector::builder();

    if !options.verify_peer {
        builder.danger_accept_invalid_certs(true);
        builder.danger_accept_invalid_hostnames(true);
    }

    if let Some(path) = &options.ca_file {
        let pem = std::fs::read(path)
            .map_err(|e| SamError::Config(format!("CA file {}: {}", path.display(), e)))?;
        let certificate = native_tls::Certificate::from_pem(&pem)
            .map_err(|e| SamError::Config(format!("CA file {}: {}", path.display(), e)))?;
        builder.add_root_certificate(certificate);
    }

    let connector = builder
        .build()
        .map_err(|e| SamError::Config(format!("TLS setup: {}", e)))?;
    Ok(tokio_native_tls::TlsConnector::from(connector))
}
