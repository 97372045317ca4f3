//! Node lifecycle: startup reconciliation, task spawning, and shutdown.
//!
//! `Node` is the embeddable surface: a host (CLI, desktop shell) calls
//! `start`, observes `height`/`tip_hash`/`peer_count`, and calls `stop`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::chain::{ChainDeps, ChainState};
use crate::context::{IbdProgress, NetworkCache, NodeConfig, NodeContext};
use crate::error::NodeError;
use crate::gate::PeerGate;
use crate::genesis::load_genesis;
use crate::mempool::Mempool;
use crate::metrics;
use crate::storage::Store;
use crate::sync::catchup::run_catchup;
use crate::sync::ibd::run_ibd;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const METRICS_INTERVAL: Duration = Duration::from_secs(2);
const IBD_HEALTH_INTERVAL: Duration = Duration::from_secs(120);
const IBD_STUCK_WARNING: Duration = Duration::from_secs(300);

pub struct Node {
    ctx: Arc<NodeContext>,
    shutdown_tx: watch::Sender<bool>,
    running: AtomicBool,
    rpc_addr: SocketAddr,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Initialize storage and chain state, bind the RPC listener, and
    /// spawn the background tasks. Errors here are fatal for the start
    /// attempt; nothing keeps running.
    pub async fn start(config: NodeConfig) -> Result<Arc<Node>, NodeError> {
        tracing::info!(
            network = %config.network_id,
            rpc_bind = %config.rpc_bind,
            data_dir = %config.data_dir.display(),
            "initializing Archivas node..."
        );

        let rpc_bind = normalize_bind(&config.rpc_bind);
        std::fs::create_dir_all(&config.data_dir)?;

        let gate = Arc::new(PeerGate::new());
        gate.load(&config.banned_peers_file());
        tracing::info!(
            banned = gate.banned_peers().len(),
            "loaded banned peers (forked-chain host permanently banned)"
        );

        let network = Arc::new(NetworkCache::new());
        let progress = Arc::new(IbdProgress::new());
        let deps = ChainDeps {
            mempool: Arc::new(Mempool::new()),
            gate: gate.clone(),
            network: network.clone(),
            progress: progress.clone(),
        };

        let (doc, used_path) = load_genesis(&config.genesis_path)?;
        tracing::info!(
            path = %used_path.display(),
            doc_hash = %crate::block::short_hex(&doc.document_hash()),
            "loaded genesis file"
        );
        // Validate the genesis document itself up front. A mismatch here
        // is a fatal configuration error; only a mismatch against the
        // *stored* chain below justifies wiping the data directory.
        let canonical =
            crate::genesis::verify_genesis_block(&crate::genesis::genesis_block(&doc), &config.network_id)?;
        tracing::info!(hash = %crate::block::short_hex(&canonical), "genesis block hash verified (matches network)");

        let store = Store::open(&config.data_dir)?;
        let state = match ChainState::load(store, &doc, &config.network_id, deps.clone()) {
            Ok(state) => state,
            Err(NodeError::GenesisMismatch { calculated, expected }) => {
                tracing::warn!(
                    stored = %calculated,
                    expected = %expected,
                    "genesis hash mismatch - clearing database to fix"
                );
                // The store was dropped with the failed load; wipe and
                // rebuild from the genesis file.
                std::fs::remove_dir_all(&config.data_dir)?;
                std::fs::create_dir_all(&config.data_dir)?;
                let store = Store::open(&config.data_dir)?;
                ChainState::fresh(store, &doc, &config.network_id, deps.clone())?
            }
            Err(e) => return Err(e),
        };
        tracing::info!(height = state.current_height(), "node state initialized");
        metrics::update_tip_height(state.current_height());
        metrics::update_difficulty(state.difficulty_target());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let ctx = Arc::new(NodeContext {
            config,
            state: RwLock::new(Some(state)),
            gate,
            network,
            progress,
            shutdown: shutdown_rx,
        });

        // RPC server binds before anything else so farmers and peers can
        // reach us during IBD (reads are always allowed).
        let listener = tokio::net::TcpListener::bind(&rpc_bind).await?;
        let rpc_addr = listener.local_addr()?;
        tracing::info!(addr = %rpc_addr, "RPC server running");

        let node = Arc::new(Node {
            ctx: ctx.clone(),
            shutdown_tx,
            running: AtomicBool::new(true),
            rpc_addr,
            tasks: Mutex::new(Vec::new()),
        });

        let mut tasks = Vec::new();

        {
            let app = crate::rpc::router(ctx.clone());
            let mut shutdown = ctx.shutdown.clone();
            tasks.push(tokio::spawn(async move {
                let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
                    let _ = shutdown.changed().await;
                });
                if let Err(e) = serve.await {
                    tracing::error!(err = %e, "RPC server error");
                }
            }));
        }

        if ctx.config.seed_url().is_some() {
            let ibd_ctx = ctx.clone();
            tasks.push(tokio::spawn(async move {
                let delay = ibd_ctx.config.ibd.start_delay;
                let mut shutdown = ibd_ctx.shutdown.clone();
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => return,
                }
                run_ibd(ibd_ctx).await;
            }));
            tasks.push(tokio::spawn(run_catchup(ctx.clone())));
        } else {
            tracing::warn!("no trusted seed in bootnodes - running without sync");
        }

        tasks.push(tokio::spawn(metrics_task(ctx.clone())));
        tasks.push(tokio::spawn(heartbeat_task(ctx.clone())));

        *node.tasks.lock() = tasks;

        tracing::info!("Archivas node started successfully");
        tracing::info!("waiting for farmers to submit blocks...");
        Ok(node)
    }

    /// Graceful shutdown: cancel every task, then null the state slot so
    /// late RPC reads fail fast instead of racing teardown.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        tracing::info!("stopping Archivas node...");
        let _ = self.shutdown_tx.send(true);

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
                tracing::warn!("background task did not stop in time");
            }
        }

        // Dropping the state closes the store (flush + LOCK removal).
        let old = self.ctx.state.write().take();
        drop(old);
        tracing::info!("Archivas node stopped and cleaned up");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn height(&self) -> u64 {
        self.ctx.state.read().as_ref().map(|s| s.current_height()).unwrap_or(0)
    }

    pub fn tip_hash(&self) -> String {
        match self.ctx.state.read().as_ref() {
            Some(state) => hex::encode(state.tip_hash()),
            None => "0".repeat(64),
        }
    }

    /// Connected peer count. Zero until a P2P transport is wired in.
    pub fn peer_count(&self) -> usize {
        0
    }

    pub fn rpc_addr(&self) -> SocketAddr {
        self.rpc_addr
    }

    pub fn context(&self) -> &Arc<NodeContext> {
        &self.ctx
    }
}

fn normalize_bind(bind: &str) -> String {
    if bind.starts_with(':') {
        format!("0.0.0.0{bind}")
    } else {
        bind.to_string()
    }
}

async fn metrics_task(ctx: Arc<NodeContext>) {
    let mut ticker = tokio::time::interval(METRICS_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut shutdown = ctx.shutdown.clone();
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => return,
        }
        let guard = ctx.state.read();
        if let Some(state) = guard.as_ref() {
            metrics::update_tip_height(state.current_height());
            metrics::update_difficulty(state.difficulty_target());
        }
        metrics::update_peer_count(0);
    }
}

/// Periodic liveness logging plus the slow IBD stall check.
async fn heartbeat_task(ctx: Arc<NodeContext>) {
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut ibd_health = tokio::time::interval(IBD_HEALTH_INTERVAL);
    ibd_health.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut shutdown = ctx.shutdown.clone();

    let mut last_ibd_height = 0u64;
    let mut last_ibd_progress = Instant::now();

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                let guard = ctx.state.read();
                if let Some(state) = guard.as_ref() {
                    tracing::debug!(
                        height = state.current_height(),
                        difficulty = state.difficulty_target(),
                        "node running"
                    );
                }
            }
            _ = ibd_health.tick() => {
                if ctx.gate.ibd_running() {
                    let current = ctx.state.read().as_ref().map(|s| s.current_height()).unwrap_or(0);
                    if current == last_ibd_height {
                        let stalled = last_ibd_progress.elapsed();
                        if stalled > IBD_STUCK_WARNING {
                            tracing::warn!(
                                height = current,
                                stalled_for = ?stalled,
                                "IBD appears stuck - this may indicate seed issues"
                            );
                        }
                    } else {
                        last_ibd_height = current;
                        last_ibd_progress = Instant::now();
                    }
                } else {
                    last_ibd_height = 0;
                    last_ibd_progress = Instant::now();
                }
            }
            _ = shutdown.changed() => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_normalization() {
        assert_eq!(normalize_bind(":8080"), "0.0.0.0:8080");
        assert_eq!(normalize_bind("127.0.0.1:8080"), "127.0.0.1:8080");
    }
}
