//! Shared helpers for the integration tests: a synthetic test network,
//! deterministic chain construction, and an in-process mock seed.

#![allow(dead_code)]

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;

use archivas_node::block::{hash_block, Block, BlockJson, Proof, Transaction};
use archivas_node::chain::{ChainDeps, ChainState};
use archivas_node::consensus::{generate_challenge, proof_hash, INITIAL_BLOCK_REWARD};
use archivas_node::context::{IbdProgress, NetworkCache, NodeConfig, NodeContext};
use archivas_node::gate::PeerGate;
use archivas_node::genesis::{genesis_block, GenesisAllocation, GenesisDoc};
use archivas_node::mempool::Mempool;
use archivas_node::storage::Store;
use archivas_node::sync::ibd::IbdConfig;

pub const TEST_NETWORK: &str = "archivas-testnet";

pub fn test_genesis_doc() -> GenesisDoc {
    GenesisDoc {
        network: TEST_NETWORK.into(),
        timestamp: 1_690_000_000,
        initial_difficulty: 4_000_000,
        allocations: vec![GenesisAllocation { address: "arcvalice".into(), balance: 1_000 }],
    }
}

pub fn write_genesis_file(dir: &std::path::Path) -> std::path::PathBuf {
    let path = dir.join("testnet.genesis.json");
    std::fs::write(&path, serde_json::to_vec(&test_genesis_doc()).unwrap()).unwrap();
    path
}

/// Deterministic successor of `tip`, with a well-formed proof and the
/// canonical hash field filled in.
pub fn make_next_block(tip: &Block, difficulty: u64) -> Block {
    let next_height = tip.height + 1;
    let challenge = generate_challenge(hash_block(tip), next_height);
    let plot_id = [6u8; 32];
    Block {
        height: next_height,
        timestamp: tip.timestamp + 20,
        prev_hash: hash_block(tip),
        difficulty,
        challenge,
        txs: vec![Transaction::coinbase("arcvfarmer", INITIAL_BLOCK_REWARD)],
        proof: Some(Proof {
            hash: proof_hash(plot_id, challenge, next_height),
            quality: 10,
            plot_id,
            index: next_height,
            farmer_pubkey: [2u8; 33],
            challenge,
        }),
        farmer_addr: "arcvfarmer".into(),
        cumulative_work: 0,
    }
}

/// Wire-format chain `[genesis, 1, ..., n]` as the seed would serve it.
pub fn make_wire_chain(doc: &GenesisDoc, n: u64, difficulty: u64) -> Vec<serde_json::Value> {
    let mut blocks = vec![genesis_block(doc)];
    for _ in 0..n {
        let next = make_next_block(blocks.last().unwrap(), difficulty);
        blocks.push(next);
    }
    blocks
        .iter()
        .map(|b| serde_json::to_value(BlockJson::from(b)).unwrap())
        .collect()
}

/// An IBD config with all the timing knobs collapsed for tests.
pub fn fast_ibd_config() -> IbdConfig {
    IbdConfig {
        start_delay: std::time::Duration::from_millis(0),
        batch_size: 2,
        ibd_threshold: 1,
        catch_up_threshold: 0,
        request_timeout: std::time::Duration::from_secs(5),
        max_attempts: 3,
        initial_retry_delay: std::time::Duration::from_millis(100),
        max_retry_delay: std::time::Duration::from_millis(500),
        post_recovery_delay: std::time::Duration::from_millis(50),
        probe_attempts: 3,
        probe_initial_delay: std::time::Duration::from_millis(50),
        progress_interval: std::time::Duration::from_secs(1),
        stuck_after: std::time::Duration::from_secs(5),
    }
}

// =================== Mock seed ===================

#[derive(Clone)]
pub struct SeedState {
    pub blocks: Arc<Mutex<Vec<serde_json::Value>>>,
    pub difficulty: Arc<Mutex<u64>>,
    /// Served once for the first `/blocks/range` hit, then discarded.
    pub poisoned_first_batch: Arc<Mutex<Option<Vec<serde_json::Value>>>>,
}

impl SeedState {
    pub fn new(blocks: Vec<serde_json::Value>, difficulty: u64) -> Self {
        SeedState {
            blocks: Arc::new(Mutex::new(blocks)),
            difficulty: Arc::new(Mutex::new(difficulty)),
            poisoned_first_batch: Arc::new(Mutex::new(None)),
        }
    }

    pub fn tip_height(&self) -> u64 {
        self.blocks.lock().len() as u64 - 1
    }
}

#[derive(Deserialize)]
struct RangeQuery {
    #[serde(default)]
    from: u64,
    #[serde(default)]
    limit: u32,
}

async fn seed_chain_tip(State(seed): State<SeedState>) -> Json<serde_json::Value> {
    // string-encoded numbers, like the production seed
    Json(serde_json::json!({
        "height": seed.tip_height().to_string(),
        "difficulty": seed.difficulty.lock().to_string(),
    }))
}

async fn seed_blocks_range(
    State(seed): State<SeedState>,
    Query(q): Query<RangeQuery>,
) -> Json<serde_json::Value> {
    if let Some(poisoned) = seed.poisoned_first_batch.lock().take() {
        return Json(serde_json::json!({ "blocks": poisoned }));
    }
    let blocks = seed.blocks.lock();
    let from = q.from.max(1) as usize;
    let limit = if q.limit == 0 { 512 } else { q.limit } as usize;
    let slice: Vec<serde_json::Value> = blocks
        .iter()
        .skip(from)
        .take(limit)
        .cloned()
        .collect();
    Json(serde_json::json!({ "blocks": slice }))
}

/// Serve the mock seed on an ephemeral port, returning its base URL.
pub async fn spawn_mock_seed(seed: SeedState) -> String {
    let app = Router::new()
        .route("/chainTip", get(seed_chain_tip))
        .route("/blocks/range", get(seed_blocks_range))
        .with_state(seed);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

// =================== Node context for engine tests ===================

pub struct TestNode {
    pub ctx: Arc<NodeContext>,
    // kept alive so shutdown never fires during the test
    pub shutdown_tx: tokio::sync::watch::Sender<bool>,
}

pub fn build_context(root: &std::path::Path, seed_url: Option<String>) -> TestNode {
    let genesis_path = write_genesis_file(root);
    let data_dir = root.join("data");

    let gate = Arc::new(PeerGate::new());
    gate.load(&data_dir.join("banned_peers.json"));
    let network = Arc::new(NetworkCache::new());
    let progress = Arc::new(IbdProgress::new());
    let deps = ChainDeps {
        mempool: Arc::new(Mempool::new()),
        gate: gate.clone(),
        network: network.clone(),
        progress: progress.clone(),
    };

    let store = Store::open(&data_dir).unwrap();
    let state = ChainState::fresh(store, &test_genesis_doc(), TEST_NETWORK, deps).unwrap();

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let ctx = Arc::new(NodeContext {
        config: NodeConfig {
            network_id: TEST_NETWORK.into(),
            rpc_bind: "127.0.0.1:0".into(),
            data_dir,
            bootnodes: vec![],
            genesis_path,
            seed_url,
            ibd: fast_ibd_config(),
        },
        state: RwLock::new(Some(state)),
        gate,
        network,
        progress,
        shutdown: shutdown_rx,
    });
    TestNode { ctx, shutdown_tx }
}

/// Assert the structural chain invariants over the live state.
pub fn assert_chain_invariants(ctx: &NodeContext) {
    let guard = ctx.state.read();
    let state = guard.as_ref().expect("state present");
    let genesis = state.block_at(0).expect("genesis present");
    assert_eq!(genesis.height, 0);
    assert_eq!(genesis.prev_hash, [0u8; 32]);
    for h in 1..=state.current_height() {
        let prev = state.block_at(h - 1).unwrap();
        let block = state.block_at(h).unwrap();
        assert_eq!(block.height, h);
        assert_eq!(block.prev_hash, hash_block(prev), "prev-hash link broken at {h}");
        assert!(block.cumulative_work >= prev.cumulative_work);
    }
    assert_eq!(state.current_height() as usize, state.chain_len() - 1);
}
