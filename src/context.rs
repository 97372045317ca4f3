//! `NodeContext`: the shared state the original carried as process
//! globals, re-architected as one value owned by `Node::start` and handed
//! to every spawned task behind an `Arc`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;

use crate::chain::ChainState;
use crate::gate::{is_trusted_seed, PeerGate, TRUSTED_SEED_HOST};
use crate::sync::ibd::IbdConfig;

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub network_id: String,
    pub rpc_bind: String,
    pub data_dir: PathBuf,
    pub bootnodes: Vec<String>,
    pub genesis_path: PathBuf,
    /// Normally derived from the bootnode list; tests point this at a
    /// mock seed.
    pub seed_url: Option<String>,
    pub ibd: IbdConfig,
}

impl NodeConfig {
    /// The single trusted seed URL, if any bootnode qualifies. Only
    /// `seed.archivas.ai` is allowed to drive IBD.
    pub fn seed_url(&self) -> Option<String> {
        if let Some(url) = &self.seed_url {
            return Some(url.clone());
        }
        self.bootnodes
            .iter()
            .find(|b| is_trusted_seed(b))
            .map(|_| format!("https://{TRUSTED_SEED_HOST}"))
    }

    pub fn banned_peers_file(&self) -> PathBuf {
        self.data_dir.join("banned_peers.json")
    }
}

/// Network difficulty observed at the seed, cached with its fetch time so
/// `get_status` can report network-accurate difficulty early in sync.
#[derive(Debug, Default)]
pub struct NetworkCache {
    difficulty: Mutex<Option<(u64, Instant)>>,
}

impl NetworkCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_difficulty(&self, difficulty: u64) {
        *self.difficulty.lock() = Some((difficulty, Instant::now()));
    }

    /// Cached difficulty, if set within `max_age`.
    pub fn fresh_difficulty(&self, max_age: Duration) -> Option<u64> {
        let guard = self.difficulty.lock();
        match *guard {
            Some((d, at)) if at.elapsed() < max_age => Some(d),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct IbdProgressSnapshot {
    pub last_applied_height: u64,
    pub last_applied_at: Instant,
    pub applied_blocks: u64,
}

/// IBD progress counters, read by the progress watcher and the node-level
/// health ticker.
#[derive(Debug)]
pub struct IbdProgress {
    inner: Mutex<IbdProgressSnapshot>,
}

impl IbdProgress {
    pub fn new() -> Self {
        IbdProgress {
            inner: Mutex::new(IbdProgressSnapshot {
                last_applied_height: 0,
                last_applied_at: Instant::now(),
                applied_blocks: 0,
            }),
        }
    }

    pub fn record_applied(&self, height: u64) {
        let mut inner = self.inner.lock();
        inner.last_applied_height = height;
        inner.last_applied_at = Instant::now();
        inner.applied_blocks += 1;
    }

    pub fn reset(&self, height: u64) {
        let mut inner = self.inner.lock();
        inner.last_applied_height = height;
        inner.last_applied_at = Instant::now();
        inner.applied_blocks = 0;
    }

    pub fn snapshot(&self) -> IbdProgressSnapshot {
        *self.inner.lock()
    }
}

impl Default for IbdProgress {
    fn default() -> Self {
        Self::new()
    }
}

pub struct NodeContext {
    pub config: NodeConfig,
    /// The live chain state. `None` after shutdown; swapped whole during
    /// fork recovery so readers never see a torn intermediate.
    pub state: RwLock<Option<ChainState>>,
    pub gate: Arc<PeerGate>,
    pub network: Arc<NetworkCache>,
    pub progress: Arc<IbdProgress>,
    /// Flipped to `true` once at stop; background tasks watch it.
    pub shutdown: watch::Receiver<bool>,
}

impl NodeContext {
    pub fn shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_url_requires_trusted_bootnode() {
        let mut cfg = NodeConfig {
            network_id: "archivas-testnet".into(),
            rpc_bind: "127.0.0.1:8080".into(),
            data_dir: "/tmp/x".into(),
            bootnodes: vec!["node1.example.com:9090".into()],
            genesis_path: "genesis.json".into(),
            seed_url: None,
            ibd: IbdConfig::default(),
        };
        assert_eq!(cfg.seed_url(), None);

        cfg.bootnodes.push("seed.archivas.ai:9090".into());
        assert_eq!(cfg.seed_url().as_deref(), Some("https://seed.archivas.ai"));

        cfg.seed_url = Some("http://127.0.0.1:4000".into());
        assert_eq!(cfg.seed_url().as_deref(), Some("http://127.0.0.1:4000"));
    }

    #[test]
    fn network_cache_expires() {
        let cache = NetworkCache::new();
        assert_eq!(cache.fresh_difficulty(Duration::from_secs(300)), None);
        cache.set_difficulty(7_000_000);
        assert_eq!(cache.fresh_difficulty(Duration::from_secs(300)), Some(7_000_000));
        assert_eq!(cache.fresh_difficulty(Duration::from_nanos(0)), None);
    }

    #[test]
    fn progress_counters() {
        let progress = IbdProgress::new();
        progress.record_applied(5);
        progress.record_applied(6);
        let snap = progress.snapshot();
        assert_eq!(snap.last_applied_height, 6);
        assert_eq!(snap.applied_blocks, 2);
        progress.reset(0);
        assert_eq!(progress.snapshot().applied_blocks, 0);
    }
}
