//! In-place fork recovery: wipe the database and reinitialize from
//! genesis without stopping the process.
//!
//! The RPC listener, metrics task, and log sinks stay bound throughout;
//! they observe the swapped state on their next read. The caller (IBD)
//! re-enters sync from height 0 afterwards.

use crate::chain::{ChainDeps, ChainState};
use crate::context::NodeContext;
use crate::error::NodeError;
use crate::genesis::load_genesis;
use crate::metrics;
use crate::storage::Store;

pub fn recover_from_fork(ctx: &NodeContext) -> Result<(), NodeError> {
    tracing::info!("fork detected, clearing database and resyncing from genesis...");

    let data_dir = ctx.config.data_dir.clone();
    let network_id = ctx.config.network_id.clone();

    // Everything below happens under the write lock so readers see either
    // the forked state or the rebuilt one, never a torn intermediate.
    let mut slot = ctx.state.write();

    // Closing the store (via drop) releases sled's own lock before the
    // directory goes away.
    tracing::info!("fork recovery: closing database connection...");
    let old = slot.take();
    drop(old);

    tracing::info!(path = %data_dir.display(), "fork recovery: removing forked chain database");
    std::fs::remove_dir_all(&data_dir)?;
    std::fs::create_dir_all(&data_dir)?;

    tracing::info!("fork recovery: reopening database...");
    let store = Store::open(&data_dir)?;

    let (doc, _used_path) = load_genesis(&ctx.config.genesis_path)?;

    let deps = ChainDeps {
        mempool: std::sync::Arc::new(crate::mempool::Mempool::new()),
        gate: ctx.gate.clone(),
        network: ctx.network.clone(),
        progress: ctx.progress.clone(),
    };
    let state = ChainState::fresh(store, &doc, &network_id, deps)?;

    *slot = Some(state);
    drop(slot);

    ctx.gate.set_ibd_running(false);
    ctx.progress.reset(0);
    metrics::FORK_RECOVERIES.inc();
    metrics::update_tip_height(0);

    tracing::info!("fork recovery: database cleared and reinitialized from genesis");
    tracing::info!("fork recovery: IBD will restart automatically from height 0");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::BlockSource;
    use crate::context::{IbdProgress, NetworkCache, NodeConfig};
    use crate::gate::PeerGate;
    use crate::genesis::{GenesisAllocation, GenesisDoc};
    use crate::mempool::Mempool;
    use crate::sync::ibd::IbdConfig;
    use parking_lot::RwLock;
    use std::sync::Arc;

    fn write_genesis(dir: &std::path::Path) -> std::path::PathBuf {
        let doc = GenesisDoc {
            network: "archivas-testnet".into(),
            timestamp: 1_690_000_000,
            initial_difficulty: 4_000_000,
            allocations: vec![GenesisAllocation { address: "arcvalice".into(), balance: 1_000 }],
        };
        let path = dir.join("testnet.genesis.json");
        std::fs::write(&path, serde_json::to_vec(&doc).unwrap()).unwrap();
        path
    }

    fn test_ctx(root: &std::path::Path) -> NodeContext {
        let genesis_path = write_genesis(root);
        let data_dir = root.join("data");
        // receivers keep returning the last value after the sender drops
        let (_tx, rx) = tokio::sync::watch::channel(false);

        let gate = Arc::new(PeerGate::new());
        let network = Arc::new(NetworkCache::new());
        let progress = Arc::new(IbdProgress::new());

        let (doc, _) = load_genesis(&genesis_path).unwrap();
        let store = Store::open(&data_dir).unwrap();
        let deps = ChainDeps {
            mempool: Arc::new(Mempool::new()),
            gate: gate.clone(),
            network: network.clone(),
            progress: progress.clone(),
        };
        let state = ChainState::fresh(store, &doc, "archivas-testnet", deps).unwrap();

        NodeContext {
            config: NodeConfig {
                network_id: "archivas-testnet".into(),
                rpc_bind: "127.0.0.1:0".into(),
                data_dir,
                bootnodes: vec![],
                genesis_path,
                seed_url: None,
                ibd: IbdConfig::default(),
            },
            state: RwLock::new(Some(state)),
            gate,
            network,
            progress,
            shutdown: rx,
        }
    }

    #[test]
    fn recovery_rebuilds_genesis_only_chain() {
        let root = tempfile::tempdir().unwrap();
        let ctx = test_ctx(root.path());

        // grow the chain, then pretend IBD found a fork
        let genesis_hash = {
            let mut guard = ctx.state.write();
            let state = guard.as_mut().unwrap();
            let tip = state.block_at(0).unwrap().clone();
            let next = crate::block::BlockJson::from(&crate::block::Block {
                height: 1,
                timestamp: tip.timestamp + 20,
                prev_hash: crate::block::hash_block(&tip),
                difficulty: 3_000_000,
                challenge: crate::consensus::generate_challenge(
                    crate::block::hash_block(&tip),
                    1,
                ),
                txs: vec![],
                proof: Some(crate::block::Proof {
                    hash: crate::consensus::proof_hash(
                        [6u8; 32],
                        crate::consensus::generate_challenge(crate::block::hash_block(&tip), 1),
                        1,
                    ),
                    quality: 10,
                    plot_id: [6u8; 32],
                    index: 1,
                    farmer_pubkey: [2u8; 33],
                    challenge: crate::consensus::generate_challenge(
                        crate::block::hash_block(&tip),
                        1,
                    ),
                }),
                farmer_addr: "arcvfarmer".into(),
                cumulative_work: 0,
            });
            state
                .apply_block(&serde_json::to_vec(&next).unwrap(), BlockSource::Seed)
                .unwrap();
            assert_eq!(state.current_height(), 1);
            state.genesis_hash()
        };

        ctx.gate.set_ibd_running(true);
        recover_from_fork(&ctx).unwrap();

        let guard = ctx.state.read();
        let state = guard.as_ref().unwrap();
        assert_eq!(state.current_height(), 0);
        assert_eq!(state.genesis_hash(), genesis_hash);
        assert!(!ctx.gate.ibd_running());
        assert_eq!(ctx.progress.snapshot().applied_blocks, 0);
    }
}
