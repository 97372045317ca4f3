//! PeerGate: the enforcement point for "who may mutate the chain".
//!
//! Holds the process-wide IBD flag, the persistent ban list, and the
//! per-peer invalid-block strike counter. Ingress paths (P2P apply, RPC
//! accept) consult the gate before touching chain state.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::error::NodeError;

/// Host of the single trusted seed that drives IBD and catch-up.
pub const TRUSTED_SEED_HOST: &str = "seed.archivas.ai";

/// Peer that serves a long-dead fork; permanently banned.
const PERMANENT_BAN_IP: &str = "72.251.11.191";

/// A peer announcing a height past this, while not being the trusted
/// seed, is assumed to be on a forked chain and banned outright.
pub const FORK_HEIGHT_BAN_THRESHOLD: u64 = 200_000;

/// More than this many blocks behind: only the trusted seed drives sync.
pub const SIGNIFICANT_GAP: u64 = 10;

pub fn is_trusted_seed(peer: &str) -> bool {
    peer.contains(TRUSTED_SEED_HOST)
}

#[derive(Debug, Default)]
pub struct PeerGate {
    ibd_running: AtomicBool,
    banned: Mutex<BTreeSet<String>>,
    banned_file: Mutex<Option<PathBuf>>,
    /// Invalid-block strikes per peer. Informational for now; reserved
    /// for threshold-based banning.
    strikes: DashMap<String, u32>,
}

impl PeerGate {
    pub fn new() -> Self {
        let gate = PeerGate::default();
        gate.insert_permanent_bans();
        gate
    }

    fn insert_permanent_bans(&self) {
        let mut banned = self.banned.lock();
        banned.insert(format!("{PERMANENT_BAN_IP}:9090"));
        banned.insert(PERMANENT_BAN_IP.to_string());
    }

    // ---- IBD flag ----

    pub fn ibd_running(&self) -> bool {
        self.ibd_running.load(Ordering::SeqCst)
    }

    pub fn set_ibd_running(&self, running: bool) {
        self.ibd_running.store(running, Ordering::SeqCst);
    }

    // ---- ban list ----

    pub fn is_banned(&self, peer: &str) -> bool {
        if peer.contains(PERMANENT_BAN_IP) {
            return true;
        }
        self.banned.lock().contains(peer)
    }

    /// Ban a peer and persist the list when a ban file is configured.
    /// Returns true when the peer was not already banned.
    pub fn ban(&self, peer: &str) -> bool {
        let newly = self.banned.lock().insert(peer.to_string());
        if newly {
            if let Err(e) = self.save() {
                tracing::warn!(peer = %peer, err = %e, "failed to persist banned peers");
            }
        }
        newly
    }

    pub fn banned_peers(&self) -> Vec<String> {
        self.banned.lock().iter().cloned().collect()
    }

    pub fn record_invalid_block(&self, peer: &str) -> u32 {
        let mut entry = self.strikes.entry(peer.to_string()).or_insert(0);
        *entry += 1;
        *entry
    }

    /// Load the persisted ban list and remember the file path for future
    /// saves. Unreadable or malformed files are ignored: the permanent
    /// bans are always present and the file gets rewritten on next ban.
    pub fn load(&self, path: &Path) {
        *self.banned_file.lock() = Some(path.to_path_buf());

        let Ok(data) = std::fs::read(path) else {
            return;
        };
        let Ok(peers) = serde_json::from_slice::<Vec<String>>(&data) else {
            tracing::warn!(path = %path.display(), "banned peers file is not a JSON array, ignoring");
            return;
        };
        let mut banned = self.banned.lock();
        for peer in peers {
            banned.insert(peer);
        }
        drop(banned);
        self.insert_permanent_bans();
    }

    /// Atomic write: temp file in the same directory, then rename.
    pub fn save(&self) -> Result<(), NodeError> {
        let Some(path) = self.banned_file.lock().clone() else {
            return Ok(());
        };
        let peers: Vec<String> = self.banned.lock().iter().cloned().collect();
        let data = serde_json::to_vec_pretty(&peers)?;

        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }
}
