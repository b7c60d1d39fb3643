//! craft - gossip node from the command line.
//!
//! Starts a node, optionally connects to peers, and publishes every line read
//! from stdin as a string message.

use std::path::PathBuf;

use clap::Parser;
use craft_node::config::FIXED_PORT;
use craft_node::{CraftNode, NodeConfig, NodeError, PeerAddr};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "craft")]
#[command(about = "Craft gossip node")]
#[command(version)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    /// Port to bind (default: 21000)
    #[arg(short, long, env = "CRAFT_PORT")]
    port: Option<u16>,

    /// Use a random port in 5000..=9000
    #[arg(short, long, conflicts_with = "port")]
    random_port: bool,

    /// Keep everything in memory instead of a store file
    #[arg(short, long)]
    memory: bool,

    /// JSON config file; flags override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory for the store file
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Peer to connect to, as host:port (repeatable)
    #[arg(long = "peer", value_name = "HOST:PORT")]
    peers: Vec<PeerAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug, cli.json_logs)?;

    let config = build_config(&cli)?;
    let node = CraftNode::bind(config).await?;
    node.start()?;
    info!(node = %node.local_addr(), "node running, enter messages to broadcast (Ctrl+C to quit)");

    for peer in &cli.peers {
        node.connect_to_peer(peer.clone(), true).await?;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => publish(&node, line).await,
                None => {
                    info!("stdin closed");
                    tokio::signal::ctrl_c().await?;
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    info!("shutting down");
    node.stop().await;
    Ok(())
}

fn init_tracing(debug: bool, json: bool) -> anyhow::Result<()> {
    let level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("craft={level},craft_node={level}")))?;

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
    Ok(())
}

fn build_config(cli: &Cli) -> anyhow::Result<NodeConfig> {
    let mut config = match &cli.config {
        Some(path) => NodeConfig::from_file(path)?,
        None => NodeConfig::default(),
    };

    config.persistent = !cli.memory;
    if let Some(dir) = &cli.data_dir {
        config.data_dir.clone_from(dir);
    }
    if cli.random_port {
        config.port = None;
    } else if let Some(port) = cli.port {
        config.port = Some(port);
    } else if config.port.is_none() && cli.config.is_none() {
        config.port = Some(FIXED_PORT);
    }

    config.validate()?;
    Ok(config)
}

async fn publish(node: &CraftNode, line: String) {
    match node.create_shared_message(line).await {
        Ok((digest, _)) => info!(digest = %digest, "message published"),
        Err(e @ NodeError::PayloadTooLarge { .. }) => warn!(error = %e, "message too large"),
        Err(e) => error!(error = %e, "failed to publish message"),
    }
}
