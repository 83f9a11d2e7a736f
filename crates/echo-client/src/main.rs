//! Echo Client - connects to an echo server over I2P
//!
//! Establishes a SAM control session, opens a stream to the target
//! .b32.i2p address, then sends stdin lines and prints the echoes.

use clap::Parser;
use echo_client::{client::Client, config::ClientConfig, Result};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Target server address (.b32.i2p)
    #[arg(short, long)]
    target: Option<String>,

    /// Path to configuration file
    #[arg(short, long, default_value = "echo-client.toml")]
    config: PathBuf,

    /// SAM bridge host
    #[arg(long)]
    host: Option<String>,

    /// SAM bridge port
    #[arg(long)]
    port: Option<u16>,

    /// Base64 private key file (transient destination when omitted)
    #[arg(short, long)]
    key: Option<PathBuf>,

    /// Connect to the bridge over TLS
    #[arg(long)]
    tls: bool,

    /// Skip TLS certificate verification
    #[arg(long)]
    insecure: bool,

    /// PEM root certificate for the bridge
    #[arg(long)]
    ca_file: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    let mut config = if args.config.exists() {
        info!("Loading configuration from {:?}", args.config);
        ClientConfig::load_from_file(&args.config)?
    } else {
        ClientConfig::default()
    };

    // CLI overrides
    if let Some(target) = args.target {
        config.target = Some(target);
    }
    if let Some(host) = args.host {
        config.sam_host = host;
    }
    if let Some(port) = args.port {
        config.sam_port = port;
    }
    if let Some(key) = args.key {
        config.key_file = Some(key);
    }
    if args.tls {
        config.tls = true;
    }
    if args.insecure {
        config.tls_insecure = true;
    }
    if let Some(ca_file) = args.ca_file {
        config.tls_ca_file = Some(ca_file);
    }

    let mut client = Client::new(config);
    client.run().await
}
