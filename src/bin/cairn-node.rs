#![forbid(unsafe_code)]
//! CairnChain full node

use cairnchain::config::load_config;
use cairnchain::network;
use cairnchain::node::Node;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "config.toml")]
    config: String,
    /// Override the P2P listen port
    #[arg(long)]
    p2p_port: Option<u16>,
    /// Enable the miner
    #[arg(long)]
    mine: bool,
    /// Hex address credited by mined coinbases
    #[arg(long)]
    reward_address: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();

    let cli = Cli::parse();
    let mut config = load_config(&cli.config)?;
    if let Some(port) = cli.p2p_port {
        config.network.p2p_port = port;
    }
    if cli.mine {
        config.miner.enabled = true;
    }
    if let Some(address) = cli.reward_address {
        config.miner.reward_address = address;
    }
    config.validate()?;

    let listener = network::bind(config.network.p2p_port).await?;
    let (node, handle) = Node::open(config)?;

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received");
            let _ = handle.shutdown().await;
        }
    });

    if let Err(e) = node.run(listener).await {
        error!("Node stopped: {}", e);
        return Err(e.into());
    }
    Ok(())
}
