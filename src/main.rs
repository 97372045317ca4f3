//! Archivas node binary.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use archivas_node::context::NodeConfig;
use archivas_node::node::Node;
use archivas_node::sync::ibd::IbdConfig;

#[derive(Parser, Debug)]
#[command(name = "archivas-node", about = "Archivas proof-of-space full node", version)]
struct Args {
    /// Network identifier; also selects the expected genesis hash.
    #[arg(long, default_value = "archivas-devnet-v4")]
    network_id: String,

    /// RPC bind address (":8080" binds all interfaces).
    #[arg(long, default_value = ":8080")]
    rpc_bind: String,

    /// Chain database directory.
    #[arg(long, default_value = "archivas-data")]
    data_dir: PathBuf,

    /// Comma-separated bootnodes. Only seed.archivas.ai may drive IBD.
    #[arg(long, default_value = "seed.archivas.ai:9090")]
    bootnodes: String,

    /// Path to the genesis document.
    #[arg(long, default_value = "genesis/devnet.genesis.json")]
    genesis: PathBuf,

    /// Override the seed URL derived from the bootnodes (dev setups).
    #[arg(long)]
    seed_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let bootnodes: Vec<String> = args
        .bootnodes
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    let config = NodeConfig {
        network_id: args.network_id,
        rpc_bind: args.rpc_bind,
        data_dir: args.data_dir,
        bootnodes,
        genesis_path: args.genesis,
        seed_url: args.seed_url,
        ibd: IbdConfig::default(),
    };

    let node = Node::start(config).await?;

    tokio::signal::ctrl_c().await?;
    node.stop().await;
    Ok(())
}
