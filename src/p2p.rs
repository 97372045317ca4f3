//! P2P ingress interface.
//!
//! The transport itself (peer dialing, framing, gossip) lives outside this
//! crate; `NodeHandler` defines everything a transport may ask of the
//! node. Every mutating hook is filtered through the peer gate: banned
//! peers are dropped, absurd height announcements get the peer banned,
//! and block application is refused outright while IBD owns the chain.

use crate::block::{BlockJson, Hash32};
use crate::chain::BlockSource;
use crate::context::NodeContext;
use crate::error::NodeError;
use crate::gate::{is_trusted_seed, FORK_HEIGHT_BAN_THRESHOLD, SIGNIFICANT_GAP};

pub trait NodeHandler: Send + Sync {
    fn get_status(&self) -> (u64, u64, Hash32);
    fn local_height(&self) -> u64;
    fn has_block(&self, height: u64) -> bool;
    fn get_genesis_hash(&self) -> Hash32;
    /// A peer announced a new block at `height`.
    fn on_new_block(&self, height: u64, hash: Hash32, from_peer: &str);
    fn on_block_request(&self, height: u64) -> Result<BlockJson, NodeError>;
    /// Serve a batch for a syncing peer: `(blocks, tip_height, eof)`.
    fn on_blocks_range_request(
        &self,
        from_height: u64,
        max_blocks: u32,
    ) -> Result<(Vec<BlockJson>, u64, bool), NodeError>;
    /// Verify and apply a block received from a peer.
    fn verify_and_apply_block(&self, raw: &[u8]) -> Result<(), NodeError>;
}

impl NodeHandler for NodeContext {
    fn get_status(&self) -> (u64, u64, Hash32) {
        let guard = self.state.read();
        match guard.as_ref() {
            Some(state) => state.get_status(),
            None => {
                let difficulty = self
                    .network
                    .fresh_difficulty(std::time::Duration::from_secs(300))
                    .unwrap_or(0);
                (0, difficulty, [0u8; 32])
            }
        }
    }

    fn local_height(&self) -> u64 {
        self.state.read().as_ref().map(|s| s.current_height()).unwrap_or(0)
    }

    fn has_block(&self, height: u64) -> bool {
        self.state.read().as_ref().map(|s| s.has_block(height)).unwrap_or(false)
    }

    fn get_genesis_hash(&self) -> Hash32 {
        self.state.read().as_ref().map(|s| s.genesis_hash()).unwrap_or([0u8; 32])
    }

    fn on_new_block(&self, height: u64, _hash: Hash32, from_peer: &str) {
        // Banned peers are dropped silently to keep the log quiet.
        if self.gate.is_banned(from_peer) {
            return;
        }

        // A non-seed peer announcing a height far past the network tip is
        // on a forked chain; ban it permanently.
        if !is_trusted_seed(from_peer) && height > FORK_HEIGHT_BAN_THRESHOLD {
            if self.gate.ban(from_peer) {
                tracing::warn!(
                    peer = from_peer,
                    height,
                    "banned peer (likely forked chain) - permanently ignoring"
                );
            }
            return;
        }

        let current = self.local_height();
        if height <= current {
            return;
        }
        let gap = height - current;
        if gap > SIGNIFICANT_GAP {
            // Far behind: only the trusted seed drives sync, over HTTP.
            // P2P block requests are never issued in this regime.
            if is_trusted_seed(from_peer) && !self.gate.ibd_running() {
                tracing::info!(gap, "behind the network tip - IBD will catch up from the seed");
            }
        } else if !self.gate.ibd_running() {
            // Within the threshold any non-banned peer may serve single
            // blocks; the transport issues the actual request.
            tracing::debug!(height, peer = from_peer, "eligible for single-block fetch");
        }
    }

    fn on_block_request(&self, height: u64) -> Result<BlockJson, NodeError> {
        let guard = self.state.read();
        let state = guard.as_ref().ok_or(NodeError::ShuttingDown)?;
        state
            .block_at(height)
            .map(BlockJson::from)
            .ok_or_else(|| NodeError::Rejected(format!("block {height} not found")))
    }

    fn on_blocks_range_request(
        &self,
        from_height: u64,
        max_blocks: u32,
    ) -> Result<(Vec<BlockJson>, u64, bool), NodeError> {
        let guard = self.state.read();
        let state = guard.as_ref().ok_or(NodeError::ShuttingDown)?;
        Ok(state.blocks_range(from_height, max_blocks))
    }

    fn verify_and_apply_block(&self, raw: &[u8]) -> Result<(), NodeError> {
        // The IBD check lives inside apply_block, keyed on the source.
        let mut guard = self.state.write();
        let state = guard.as_mut().ok_or(NodeError::ShuttingDown)?;
        state.apply_block(raw, BlockSource::P2p)?;
        Ok(())
    }
}
