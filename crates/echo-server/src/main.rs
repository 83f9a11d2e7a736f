//! Echo Server - accepts I2P streams and echoes bytes back
//!
//! Establishes a SAM control session, prints its .b32.i2p address, then
//! serves up to a configured number of concurrent inbound streams.

use clap::Parser;
use echo_server::{config::ServerConfig, server::Server, Result};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "echo-server.toml")]
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

    /// Maximum concurrent echo streams
    #[arg(long)]
    max_streams: Option<usize>,

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
        ServerConfig::load_from_file(&args.config)?
    } else {
        ServerConfig::default()
    };

    // CLI overrides
    if let Some(host) = args.host {
        config.sam_host = host;
    }
    if let Some(port) = args.port {
        config.sam_port = port;
    }
    if let Some(key) = args.key {
        config.key_file = Some(key);
    }
    if let Some(max_streams) = args.max_streams {
        config.max_streams = max_streams;
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

    let server = Server::new(config);
    server.run().await
}
