//! Client configuration

use crate::{ClientError, Result};
use sam_core::{TlsOptions, Transport, TRANSIENT_DESTINATION};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// SAM bridge host
    #[serde(default = "default_sam_host")]
    pub sam_host: String,

    /// SAM bridge port
    #[serde(default = "default_sam_port")]
    pub sam_port: u16,

    /// Target server address (.b32.i2p)
    #[serde(default)]
    pub target: Option<String>,

    /// Base64 private key file; a transient destination is used when unset
    #[serde(default)]
    pub key_file: Option<PathBuf>,

    /// Signature type sent with a fixed key (ignored for transient sessions)
    #[serde(default = "default_signature_type")]
    pub signature_type: String,

    /// Session nickname prefix (a random suffix is appended per run)
    #[serde(default = "default_nickname_prefix")]
    pub nickname_prefix: String,

    /// How long to wait for each echo reply (seconds)
    #[serde(default = "default_reply_timeout")]
    pub reply_timeout_secs: u64,

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
    "echocli".to_string()
}

fn default_reply_timeout() -> u64 {
    300
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            sam_host: default_sam_host(),
            sam_port: default_sam_port(),
            target: None,
            key_file: None,
            signature_type: default_signature_type(),
            nickname_prefix: default_nickname_prefix(),
            reply_timeout_secs: default_reply_timeout(),
            tls: false,
            tls_insecure: false,
            tls_ca_file: None,
        }
    }
}

impl ClientConfig {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        toml::from_str(&contents)
            .map_err(|e| ClientError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_string = toml::to_string_pretty(self)
            .map_err(|e| ClientError::Config(format!("Failed to serialize config: {}", e)))?;
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
                    ClientError::Config(format!("key file {}: {}", path.display(), e))
                })?;
                let key = contents.trim().to_string();
                if key.is_empty() {
                    return Err(ClientError::Config(format!(
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
