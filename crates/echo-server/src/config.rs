//! Server configuration

use crate::{Result, ServerError};
use sam_core::{TlsOptions, Transport, TRANSIENT_DESTINATION};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// SAM bridge host
    #[serde(default = "default_sam_host")]
    pub sam_host: String,

    /// SAM bridge port
    #[serde(default = "default_sam_port")]
    pub sam_port: u16,

    /// Base64 private key file; a transient destination is used when unset
    #[serde(default)]
    pub key_file: Option<PathBuf>,

    /// Signature type sent with a fixed key (ignored for transient sessions)
    #[serde(default = "default_signature_type")]
    pub signature_type: String,

    /// Session nickname prefix (a random suffix is appended per run)
    #[serde(default = "default_nickname_prefix")]
    pub nickname_prefix: String,

    /// Maximum concurrent echo streams
    #[serde(default = "default_max_streams")]
    pub max_streams: usize,

    /// Per-read idle timeout on echo streams (seconds)
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,

    /// Connect to the bridge over TLS
    #[serde(default)]
    pub tls: bool,

    /// Skip TLS certificate verification
    #[serde(default)]
    pub tls_insecure: bool,

    /// PEM root certificate for the bridge
    #[serde(default)]
    pub tls_ca_file: Option<PathBuf>,
}

fn default_sam_host() -> String {
    "127.0.0.1".to_string()
}

fn default_sam_port() -> u16 {
    sam_core::DEFAULT_SAM_PORT
}

fn default_signature_type() -> String {
    "EdDSA_SHA512_Ed25519".to_string()
}

fn default_nickname_prefix() -> String {
    "echosrv".to_string()
}

fn default_max_streams() -> usize {
    5
}

fn default_read_timeout() -> u64 {
    600
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            sam_host: default_sam_host(),
            sam_port: default_sam_port(),
            key_file: None,
            signature_type: default_signature_type(),
            nickname_prefix: default_nickname_prefix(),
            max_streams: default_max_streams(),
            read_timeout_secs: default_read_timeout(),
            tls: false,
            tls_insecure: false,
            tls_ca_file: None,
        }
    }
}

impl ServerConfig {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        toml::from_str(&contents)
            .map_err(|e| ServerError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_string = toml::to_string_pretty(self)
            .map_err(|e| ServerError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, toml_string)?;
        Ok(())
    }

    /// The transport the service should use
    pub fn transport(&self) -> Transport {
        if self.tls {
            Transport::Tls(TlsOptions {
                verify_peer: !self.tls_insecure,
                ca_file: self.tls_ca_file.clone(),
            })
        } else {
            Transport::Tcp
        }
    }

    /// Read the session key: the key file's contents, or TRANSIENT
    pub fn session_key(&self) -> Result<String> {
        match &self.key_file {
            Some(path) => {
                let contents = std::fs::read_to_string(path).map_err(|e| {
                    ServerError::Config(format!("key file {}: {}", path.display(), e))
                })?;
                let key = contents.trim().to_string();
                if key.is_empty() {
                    return Err(ServerError::Config(format!(
                        "key file {} is empty",
                        path.display()
                    )));
                }
                Ok(key)
            }
            None => Ok(TRANSIENT_DESTINATION.to_string()),
        }
    }
}
