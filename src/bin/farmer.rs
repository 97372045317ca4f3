//! Archivas farmer binary: polls a node for challenges and submits
//! winning proofs. Plot scanning plugs in through `ProofSource`; without
//! plots configured the farmer runs in monitor mode.

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use archivas_node::farmer::{run_farmer, FarmerConfig, NoPlots};

#[derive(Parser, Debug)]
#[command(name = "archivas-farmer", about = "Archivas proof-of-space farmer", version)]
struct Args {
    /// Node RPC base URL.
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    node_url: String,

    /// Reward address for farmed blocks.
    #[arg(long)]
    farmer_address: String,

    /// Compressed secp256k1 public key, hex (33 bytes).
    #[arg(long)]
    farmer_pubkey: String,

    /// Seed URL used for the IBD submission guard.
    #[arg(long, default_value = "https://seed.archivas.ai")]
    seed_url: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let mut cfg = FarmerConfig::new(args.node_url, args.farmer_address, args.farmer_pubkey);
    cfg.seed_url = args.seed_url;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let farmer = tokio::spawn(run_farmer(cfg, Arc::new(NoPlots), shutdown_rx));

    tokio::signal::ctrl_c().await?;
    let _ = shutdown_tx.send(true);
    let _ = farmer.await;
    Ok(())
}
