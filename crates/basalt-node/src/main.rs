//! basalt node - P2P networking daemon.
//!
//! This is the main entry point for the basalt-node binary.

use anyhow::Result;
use basalt_network::{
    protocol_channel, Capability, RegisteredProtocol, Server, DEFAULT_QUEUE_CAPACITY,
};
use clap::Parser;
use std::path::PathBuf;
use tracing::{debug, info, Level};
use tracing_subscriber::FmtSubscriber;

mod config;

use config::NodeConfig;

/// basalt P2P node.
#[derive(Parser, Debug)]
#[command(name = "basalt-node")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "basalt-node.toml")]
    config: PathBuf,

    /// Human-readable node name
    #[arg(long)]
    name: Option<String>,

    /// Hex-encoded local node id
    #[arg(long)]
    node_id: Option<String>,

    /// P2P listen address
    #[arg(short, long)]
    listen: Option<String>,

    /// UDP port handed to discovery
    #[arg(long)]
    kad_port: Option<u16>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("starting basalt node v{}", env!("CARGO_PKG_VERSION"));

    let config = NodeConfig::load(&args.config, &args)?;
    info!(name = %config.node_name, listen = %config.listen_addr, "configuration loaded");

    let server = Server::new(config.to_server_config()?);
    server.register_protocol(status_protocol())?;
    server.start().await?;
    info!(addr = %server.local_addr().expect("server is running"), "p2p listening");

    tokio::signal::ctrl_c().await.ok();
    info!("shutdown signal received");

    server.stop().await;
    info!("node stopped");
    Ok(())
}

/// A minimal sub-protocol that logs peer churn. Real application
/// protocols (chain sync, tx gossip) register the same way.
fn status_protocol() -> RegisteredProtocol {
    let (host, mut events) = protocol_channel(Capability::new("status", 1), DEFAULT_QUEUE_CAPACITY);
    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                peer = events.added.recv() => match peer {
                    Some(peer) => info!(peer = %peer, "peer up"),
                    None => break,
                },
                peer = events.removed.recv() => match peer {
                    Some(peer) => info!(
                        peer = %peer,
                        err = peer.terminal_error().unwrap_or_default(),
                        "peer down"
                    ),
                    None => break,
                },
                message = events.inbound.recv() => match message {
                    Some(message) => debug!(
                        peer = %message.peer,
                        msg_code = message.msg_code,
                        len = message.payload.len(),
                        "status message"
                    ),
                    None => break,
                },
            }
        }
    });
    RegisteredProtocol::new(host, task)
}
