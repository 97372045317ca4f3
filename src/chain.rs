//! The chain state machine: the single gate for all block application.
//!
//! All paths (IBD, background catch-up, P2P, RPC block submission) MUST go
//! through this module. It owns the in-memory chain, the world state, the
//! consensus target, and the persistence handles; everything mutates under
//! the caller's write lock on the state slot.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::block::{
    hash_block, hex32, short_hex, Block, BlockJson, Hash32, Proof, Transaction,
};
use crate::consensus::{
    calculate_work, generate_challenge, generate_challenge_bytes, Consensus, ReorgDetector,
    INITIAL_BLOCK_REWARD,
};
use crate::context::{IbdProgress, NetworkCache};
use crate::error::NodeError;
use crate::gate::PeerGate;
use crate::genesis::{genesis_block, verify_genesis_block, GenesisDoc};
use crate::health::ChainHealth;
use crate::ledger::WorldState;
use crate::mempool::Mempool;
use crate::metrics;
use crate::storage::Store;

/// Where a block entered the node. The peer gate rejects P2P blocks while
/// IBD owns the apply path; seed-originated blocks (IBD and catch-up) are
/// always admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockSource {
    Seed,
    P2p,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// The block was already on the chain with an identical hash.
    AlreadyApplied,
}

/// Chains within this many blocks of the status threshold report the
/// cached network difficulty instead of the local one.
const EARLY_CHAIN_HEIGHT: u64 = 100;
const NETWORK_DIFFICULTY_MAX_AGE: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct VdfState {
    pub seed: Vec<u8>,
    pub iterations: u64,
    pub output: Vec<u8>,
}

pub struct ChainState {
    chain: Vec<Block>,
    world: WorldState,
    mempool: Arc<Mempool>,
    consensus: Consensus,
    current_height: u64,
    current_challenge: Hash32,
    store: Store,
    genesis_hash: Hash32,
    network_id: String,
    health: ChainHealth,
    reorg: ReorgDetector,
    data_dir: PathBuf,
    vdf: Option<VdfState>,
    gate: Arc<PeerGate>,
    network: Arc<NetworkCache>,
    progress: Arc<IbdProgress>,
}

/// Handles shared by every `ChainState` built for one node instance.
#[derive(Clone)]
pub struct ChainDeps {
    pub mempool: Arc<Mempool>,
    pub gate: Arc<PeerGate>,
    pub network: Arc<NetworkCache>,
    pub progress: Arc<IbdProgress>,
}

impl ChainState {
    /// Build a fresh chain from the genesis document and persist it.
    /// Used on first start, after a stored-genesis mismatch wipe, and by
    /// fork recovery.
    pub fn fresh(
        store: Store,
        doc: &GenesisDoc,
        network_id: &str,
        deps: ChainDeps,
    ) -> Result<Self, NodeError> {
        let genesis = genesis_block(doc);
        let genesis_hash = verify_genesis_block(&genesis, network_id)?;
        tracing::info!(hash = %short_hex(&genesis_hash), "genesis block hash verified");

        let allocs = doc.allocations_map();
        let world = WorldState::new(&allocs);
        let consensus = Consensus::new(doc.initial_difficulty);

        store.save_block(0, &genesis)?;
        for (addr, balance) in &allocs {
            store.save_account(addr, *balance, 0)?;
        }
        store.save_tip_height(0)?;
        store.save_difficulty(consensus.difficulty_target)?;
        store.save_genesis_hash(genesis_hash)?;
        store.save_network_id(network_id)?;
        tracing::info!(
            accounts = allocs.len(),
            hash = %short_hex(&genesis_hash),
            "genesis block saved (height=0)"
        );

        let data_dir = store.data_dir().to_path_buf();
        // The live challenge is always derived from the tip, even when
        // the tip is genesis (whose embedded challenge is the fixed one).
        let current_challenge = generate_challenge(genesis_hash, 1);
        Ok(ChainState {
            chain: vec![genesis],
            world,
            mempool: deps.mempool,
            consensus,
            current_height: 0,
            current_challenge,
            store,
            genesis_hash,
            network_id: network_id.to_string(),
            health: ChainHealth::new(),
            reorg: ReorgDetector::new(),
            data_dir,
            vdf: None,
            gate: deps.gate,
            network: deps.network,
            progress: deps.progress,
        })
    }

    /// Reload an existing chain from disk, reconciling difficulty and the
    /// world state. Errors with a genesis mismatch when the stored chain
    /// belongs to a different network; the caller wipes and retries.
    pub fn load(
        store: Store,
        doc: &GenesisDoc,
        network_id: &str,
        deps: ChainDeps,
    ) -> Result<Self, NodeError> {
        let Some(tip_height) = store.load_tip_height()? else {
            tracing::info!("fresh start detected (no existing database)");
            return Self::fresh(store, doc, network_id, deps);
        };
        tracing::info!(tip = tip_height, "existing database found");

        let canonical = verify_genesis_block(&genesis_block(doc), network_id)?;
        match store.load_genesis_hash()? {
            Some(saved) if saved == canonical => {
                tracing::info!(hash = %short_hex(&saved), "genesis hash verified");
            }
            Some(saved) => {
                return Err(NodeError::GenesisMismatch {
                    calculated: hex32(saved),
                    expected: hex32(canonical),
                });
            }
            None => {
                return Err(NodeError::GenesisMismatch {
                    calculated: "absent".into(),
                    expected: hex32(canonical),
                });
            }
        }

        let mut chain = Vec::with_capacity(tip_height as usize + 1);
        for h in 0..=tip_height {
            let block = store.load_block(h)?.ok_or_else(|| {
                NodeError::Config(format!("failed to load block {h} from database"))
            })?;
            chain.push(block);
        }

        // Difficulty: stored value, else cached network difficulty, else
        // the genesis seed; the non-genesis tip block wins over all.
        let mut difficulty = match store.load_difficulty()? {
            Some(d) => d,
            None => match deps.network.fresh_difficulty(NETWORK_DIFFICULTY_MAX_AGE) {
                Some(d) => {
                    tracing::info!(difficulty = d, "using network difficulty (no stored difficulty)");
                    d
                }
                None => {
                    tracing::info!(
                        difficulty = doc.initial_difficulty,
                        "using genesis difficulty (no stored or network difficulty)"
                    );
                    doc.initial_difficulty
                }
            },
        };
        if let Some(tip) = chain.last() {
            if tip.height > 0 && tip.difficulty > 0 && tip.difficulty != difficulty {
                tracing::info!(
                    from = difficulty,
                    to = tip.difficulty,
                    height = tip.height,
                    "updated difficulty from tip block"
                );
                difficulty = tip.difficulty;
                if let Err(e) = store.save_difficulty(difficulty) {
                    tracing::warn!(err = %e, "failed to save updated difficulty");
                }
            }
        }
        let consensus = Consensus::new(difficulty);

        // World state: genesis allocations overlaid with stored balances,
        // plus every address a loaded block touched.
        let allocs = doc.allocations_map();
        let mut world = WorldState::empty();
        for (addr, balance) in &allocs {
            match store.load_account(addr) {
                Ok(Some((bal, nonce))) => {
                    world.accounts.insert(addr.clone(), crate::ledger::AccountState { balance: bal, nonce });
                }
                Ok(None) => {
                    world.accounts.insert(addr.clone(), crate::ledger::AccountState { balance: *balance, nonce: 0 });
                }
                Err(e) => {
                    tracing::warn!(addr = %addr, err = %e, "failed to load account, using genesis balance");
                    world.accounts.insert(addr.clone(), crate::ledger::AccountState { balance: *balance, nonce: 0 });
                }
            }
        }
        let mut seen: BTreeSet<&str> = BTreeSet::new();
        for block in &chain {
            for addr in std::iter::once(block.farmer_addr.as_str())
                .chain(block.txs.iter().flat_map(|tx| [tx.from.as_str(), tx.to.as_str()]))
            {
                if addr.is_empty() || world.accounts.contains_key(addr) || !seen.insert(addr) {
                    continue;
                }
                if let Ok(Some((balance, nonce))) = store.load_account(addr) {
                    world
                        .accounts
                        .insert(addr.to_string(), crate::ledger::AccountState { balance, nonce });
                }
            }
        }
        tracing::info!(accounts = world.accounts.len(), "world state reconstructed");

        let tip = chain.last().expect("chain has at least genesis");
        let current_height = tip.height;
        let current_challenge = generate_challenge(hash_block(tip), current_height + 1);

        let data_dir = store.data_dir().to_path_buf();
        Ok(ChainState {
            chain,
            world,
            mempool: deps.mempool,
            consensus,
            current_height,
            current_challenge,
            store,
            genesis_hash: canonical,
            network_id: network_id.to_string(),
            health: ChainHealth::new(),
            reorg: ReorgDetector::new(),
            data_dir,
            vdf: None,
            gate: deps.gate,
            network: deps.network,
            progress: deps.progress,
        })
    }

    // =================== Block application ===================

    /// Apply a serialized block. Total: every call terminates as
    /// `Applied`, `AlreadyApplied`, or an error; already-applied blocks
    /// are a no-op. `ForkDetected` leaves state untouched so the caller
    /// can run recovery.
    pub fn apply_block(
        &mut self,
        raw: &[u8],
        source: BlockSource,
    ) -> Result<ApplyOutcome, NodeError> {
        if source == BlockSource::P2p && self.gate.ibd_running() {
            return Err(NodeError::Rejected(
                "IBD in progress - rejecting P2P block (blocks must come from IBD)".into(),
            ));
        }

        let (mut block, declared_hash) = BlockJson::parse(raw)?.into_block()?;

        if block.height == 0 {
            return self.apply_genesis(block);
        }

        if self.chain.is_empty() {
            return Err(NodeError::Rejected(format!(
                "cannot apply block {}: no genesis block exists",
                block.height
            )));
        }

        // Duplicate heights short-circuit before the continuity check so
        // replays stay idempotent.
        if (block.height as usize) < self.chain.len() {
            let existing = hash_block(&self.chain[block.height as usize]);
            let incoming = hash_block(&block);
            if existing == incoming {
                tracing::debug!(
                    height = block.height,
                    hash = %short_hex(&existing),
                    "block already exists, skipping duplicate"
                );
                return Ok(ApplyOutcome::AlreadyApplied);
            }
            return Err(NodeError::Rejected(format!(
                "block {} duplicate with different hash",
                block.height
            )));
        }

        let expected = self.current_height + 1;
        if block.height != expected {
            tracing::error!(
                expected,
                got = block.height,
                chain_len = self.chain.len(),
                "height discontinuity at block application"
            );
            return Err(NodeError::HeightDiscontinuity { expected, actual: block.height });
        }

        let tip = self.chain.last().expect("non-empty checked above");
        let prev_hash = hash_block(tip);
        let tip_cumulative_work = tip.cumulative_work;
        if block.prev_hash != prev_hash {
            tracing::error!(
                height = block.height,
                local_tip = %short_hex(&prev_hash),
                received_prev = %short_hex(&block.prev_hash),
                "FORK DETECTED: prev hash mismatch"
            );
            self.reorg.record_mismatch(block.height);
            return Err(NodeError::ForkDetected { height: block.height });
        }

        let computed = hash_block(&block);
        match declared_hash {
            Some(declared) if declared != computed => {
                tracing::error!(
                    height = block.height,
                    expected = %short_hex(&declared),
                    computed = %short_hex(&computed),
                    "block hash mismatch - fetched data corrupt or incomplete"
                );
                return Err(NodeError::HashMismatch {
                    height: block.height,
                    expected: hex32(declared),
                    computed: hex32(computed),
                });
            }
            Some(_) => {}
            None => {
                tracing::warn!(height = block.height, "hash field missing from block, skipping integrity check");
            }
        }

        let touched = self.apply_transactions(&block);

        block.cumulative_work =
            tip_cumulative_work.saturating_add(calculate_work(block.difficulty));

        self.store.commit_applied_block(
            &block,
            self.world.accounts.iter().filter(|(addr, _)| touched.contains(addr.as_str())),
        )?;

        let height = block.height;
        let difficulty = block.difficulty;
        self.chain.push(block);
        self.current_height = height;
        self.current_challenge = generate_challenge(computed, height + 1);
        self.after_apply(height, difficulty);
        Ok(ApplyOutcome::Applied)
    }

    fn apply_genesis(&mut self, block: Block) -> Result<ApplyOutcome, NodeError> {
        let incoming = hash_block(&block);
        if let Some(existing) = self.chain.first() {
            let existing_hash = hash_block(existing);
            if existing_hash == incoming {
                return Ok(ApplyOutcome::AlreadyApplied);
            }
            tracing::warn!(
                existing = %short_hex(&existing_hash),
                received = %short_hex(&incoming),
                "genesis block mismatch"
            );
            return Err(NodeError::Rejected("genesis block mismatch (wrong chain)".into()));
        }

        if let Some(expected) = crate::genesis::expected_genesis_hash(&self.network_id) {
            if incoming != expected {
                return Err(NodeError::Rejected("genesis hash mismatch (wrong chain)".into()));
            }
        }
        tracing::info!(hash = %short_hex(&incoming), "applying genesis block (height 0)");

        self.store.save_block(0, &block)?;
        if let Err(e) = self.store.save_tip_height(0) {
            tracing::warn!(err = %e, "failed to save tip height");
        }
        self.genesis_hash = incoming;
        if let Err(e) = self.store.save_genesis_hash(incoming) {
            tracing::warn!(err = %e, "failed to save genesis hash");
        }
        if let Err(e) = self.store.save_network_id(&self.network_id) {
            tracing::warn!(err = %e, "failed to save network id");
        }
        self.chain.push(block);
        self.current_height = 0;
        self.current_challenge = generate_challenge(incoming, 1);
        self.after_apply(0, 0);
        Ok(ApplyOutcome::Applied)
    }

    /// Coinbase credits unconditionally; other transactions go through
    /// full ledger verification, and invalid ones are skipped with a
    /// warning rather than failing the block. Returns the set of touched
    /// addresses for the persistence commit.
    fn apply_transactions(&mut self, block: &Block) -> BTreeSet<String> {
        let mut touched = BTreeSet::new();
        for tx in &block.txs {
            if tx.is_coinbase() {
                self.world.credit(&tx.to, tx.amount);
                touched.insert(tx.to.clone());
            } else {
                match self.world.apply_transaction(tx) {
                    Ok(()) => {
                        touched.insert(tx.from.clone());
                        touched.insert(tx.to.clone());
                    }
                    Err(e) => {
                        tracing::warn!(height = block.height, err = %e, "skipping invalid tx in block");
                    }
                }
            }
        }
        touched
    }

    fn after_apply(&mut self, height: u64, block_difficulty: u64) {
        if block_difficulty > 0 {
            let old = self.consensus.difficulty_target;
            self.consensus.difficulty_target = block_difficulty;
            if old != block_difficulty && height > 0 {
                tracing::debug!(height, from = old, to = block_difficulty, "updated difficulty from block");
            }
            if let Err(e) = self.store.save_difficulty(block_difficulty) {
                tracing::warn!(err = %e, "failed to save difficulty");
            }
        }
        self.progress.record_applied(height);
        self.health.record_block();
        metrics::BLOCKS_APPLIED.inc();
        metrics::update_tip_height(self.current_height);
        metrics::update_difficulty(self.consensus.difficulty_target);

        if height % 10_000 == 0 || (height <= 1_000 && height % 100 == 0) {
            tracing::info!(height, "applied block");
        }
    }

    // =================== Farmer submission ===================

    /// Produce a new tip block from a farmer's winning proof. Refused
    /// while IBD owns the chain.
    pub fn accept_block(
        &mut self,
        proof: Proof,
        farmer_addr: &str,
        _farmer_pubkey: &[u8],
    ) -> Result<u64, NodeError> {
        if self.gate.ibd_running() {
            return Err(NodeError::Rejected(
                "IBD in progress - cannot accept blocks (node is read-only during sync)".into(),
            ));
        }

        let next_height = self.current_height + 1;
        self.consensus.verify_proof_of_space(&proof, self.current_challenge)?;

        let pending = self.mempool.pending();
        tracing::info!(height = next_height, pending = pending.len(), "creating block");

        let coinbase = Transaction::coinbase(farmer_addr, INITIAL_BLOCK_REWARD);
        self.world.credit(farmer_addr, INITIAL_BLOCK_REWARD);
        let mut touched = BTreeSet::new();
        touched.insert(farmer_addr.to_string());

        let mut txs = vec![coinbase];
        for tx in pending {
            match self.world.apply_transaction(&tx) {
                Ok(()) => {
                    touched.insert(tx.from.clone());
                    touched.insert(tx.to.clone());
                    txs.push(tx);
                }
                Err(e) => tracing::warn!(err = %e, "skipping invalid tx"),
            }
        }

        let tip = self.chain.last().expect("chain has at least genesis");
        let prev_hash = hash_block(tip);
        let cumulative_work = tip
            .cumulative_work
            .saturating_add(calculate_work(self.consensus.difficulty_target));
        let block = Block {
            height: next_height,
            timestamp: chrono::Utc::now().timestamp(),
            prev_hash,
            difficulty: self.consensus.difficulty_target,
            challenge: self.current_challenge,
            txs,
            proof: Some(proof),
            farmer_addr: farmer_addr.to_string(),
            cumulative_work,
        };

        let new_hash = hash_block(&block);
        self.chain.push(block);
        self.current_height = next_height;
        self.mempool.clear();
        self.current_challenge = generate_challenge(new_hash, next_height + 1);

        if let Some((old, new)) = self.consensus.dampen() {
            tracing::info!(from = old, to = new, "difficulty dropped");
        }

        let block_ref = self.chain.last().expect("just pushed");
        self.store.commit_applied_block(
            block_ref,
            self.world.accounts.iter().filter(|(addr, _)| touched.contains(addr.as_str())),
        )?;
        if let Err(e) = self.store.save_difficulty(self.consensus.difficulty_target) {
            tracing::warn!(err = %e, "failed to save difficulty");
        }

        self.health.record_block();
        metrics::BLOCKS_APPLIED.inc();
        metrics::update_tip_height(self.current_height);
        metrics::update_difficulty(self.consensus.difficulty_target);

        tracing::info!(height = next_height, "block accepted");
        Ok(next_height)
    }

    /// Adopt the seed's live difficulty so a young chain farms and
    /// reports against network-accurate numbers.
    pub fn adopt_network_difficulty(&mut self, difficulty: u64) {
        if difficulty == 0 || difficulty == self.consensus.difficulty_target {
            return;
        }
        let old = self.consensus.difficulty_target;
        self.consensus.difficulty_target = difficulty;
        tracing::info!(from = old, to = difficulty, "updated consensus difficulty from network");
        if let Err(e) = self.store.save_difficulty(difficulty) {
            tracing::warn!(err = %e, "failed to save network difficulty");
        }
        metrics::update_difficulty(difficulty);
    }

    // =================== Read-only views ===================

    /// `(height, difficulty, tip_hash)`. While the chain is short and the
    /// network difficulty cache is fresh, report the network's difficulty
    /// so external observers see accurate numbers during early sync.
    pub fn get_status(&self) -> (u64, u64, Hash32) {
        let tip = self.chain.last().expect("chain has at least genesis");
        let tip_hash = hash_block(tip);
        let mut difficulty = if tip.height > 0 {
            tip.difficulty
        } else {
            self.consensus.difficulty_target
        };
        if self.current_height < EARLY_CHAIN_HEIGHT {
            if let Some(net) = self.network.fresh_difficulty(NETWORK_DIFFICULTY_MAX_AGE) {
                difficulty = net;
            }
        }
        (self.current_height, difficulty, tip_hash)
    }

    /// `(challenge, difficulty_target, next_height)` for farmers.
    pub fn get_current_challenge(&self) -> (Hash32, u64, u64) {
        (self.current_challenge, self.consensus.difficulty_target, self.current_height + 1)
    }

    pub fn current_height(&self) -> u64 {
        self.current_height
    }

    pub fn chain_len(&self) -> usize {
        self.chain.len()
    }

    pub fn tip_hash(&self) -> Hash32 {
        hash_block(self.chain.last().expect("chain has at least genesis"))
    }

    pub fn genesis_hash(&self) -> Hash32 {
        self.genesis_hash
    }

    pub fn network_id(&self) -> &str {
        &self.network_id
    }

    pub fn data_dir(&self) -> &PathBuf {
        &self.data_dir
    }

    pub fn difficulty_target(&self) -> u64 {
        self.consensus.difficulty_target
    }

    pub fn has_block(&self, height: u64) -> bool {
        (height as usize) < self.chain.len()
    }

    pub fn block_at(&self, height: u64) -> Option<&Block> {
        self.chain.get(height as usize)
    }

    pub fn recent_blocks(&self, count: usize) -> &[Block] {
        let len = self.chain.len();
        &self.chain[len.saturating_sub(count)..]
    }

    pub fn balance(&self, addr: &str) -> u64 {
        self.world.balance(addr)
    }

    pub fn account(&self, addr: &str) -> Option<crate::ledger::AccountState> {
        self.world.account(addr)
    }

    pub fn health_stats(&self) -> crate::health::HealthStats {
        self.health.stats()
    }

    pub fn reorg_mismatches(&self) -> u64 {
        self.reorg.mismatches()
    }

    pub fn mempool(&self) -> &Arc<Mempool> {
        &self.mempool
    }

    /// Mempool admission precheck against the live world state; does not
    /// mutate anything.
    pub fn validate_transaction(&self, tx: &Transaction) -> Result<(), NodeError> {
        self.world.validate_transaction(tx)
    }

    /// Serve a batch of blocks for range requests: `(blocks, tip, eof)`.
    pub fn blocks_range(&self, from_height: u64, max_blocks: u32) -> (Vec<BlockJson>, u64, bool) {
        let tip = self.current_height;
        let max = if max_blocks == 0 || max_blocks > 512 { 512 } else { max_blocks } as u64;
        let from = from_height.max(1);
        if from > tip {
            return (Vec::new(), tip, true);
        }
        let remaining = tip - from + 1;
        let count = max.min(remaining);
        let eof = count == remaining;
        let blocks = self.chain[from as usize..(from + count) as usize]
            .iter()
            .map(BlockJson::from)
            .collect();
        (blocks, tip, eof)
    }

    // =================== VDF ===================

    /// Adopt a timelord's VDF output and re-derive the current challenge
    /// from it.
    pub fn update_vdf_state(&mut self, seed: Vec<u8>, iterations: u64, output: Vec<u8>) {
        self.current_challenge = generate_challenge_bytes(&output, self.current_height + 1);
        self.vdf = Some(VdfState { seed, iterations, output });
    }

    pub fn current_vdf(&self) -> Option<&VdfState> {
        self.vdf.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::GENESIS_BLOCK_DIFFICULTY;
    use crate::genesis::GenesisAllocation;

    fn test_doc() -> GenesisDoc {
        GenesisDoc {
            network: "archivas-testnet".into(),
            timestamp: 1_690_000_000,
            initial_difficulty: 4_000_000,
            allocations: vec![GenesisAllocation { address: "arcvalice".into(), balance: 1_000 }],
        }
    }

    fn deps() -> ChainDeps {
        ChainDeps {
            mempool: Arc::new(Mempool::new()),
            gate: Arc::new(PeerGate::new()),
            network: Arc::new(NetworkCache::new()),
            progress: Arc::new(IbdProgress::new()),
        }
    }

    fn fresh_state(dir: &std::path::Path) -> ChainState {
        let store = Store::open(dir).unwrap();
        ChainState::fresh(store, &test_doc(), "archivas-testnet", deps()).unwrap()
    }

    /// A valid successor of the current tip, as the seed would serve it.
    fn next_block_json(state: &ChainState, difficulty: u64) -> Vec<u8> {
        let tip = state.block_at(state.current_height()).unwrap();
        let next_height = state.current_height() + 1;
        let challenge = generate_challenge(hash_block(tip), next_height);
        let plot_id = [6u8; 32];
        let proof = Proof {
            hash: crate::consensus::proof_hash(plot_id, challenge, 1),
            quality: 10,
            plot_id,
            index: 1,
            farmer_pubkey: [2u8; 33],
            challenge,
        };
        let block = Block {
            height: next_height,
            timestamp: 1_690_000_000 + next_height as i64 * 20,
            prev_hash: hash_block(tip),
            difficulty,
            challenge,
            txs: vec![Transaction::coinbase("arcvfarmer", INITIAL_BLOCK_REWARD)],
            proof: Some(proof),
            farmer_addr: "arcvfarmer".into(),
            cumulative_work: 0,
        };
        serde_json::to_vec(&BlockJson::from(&block)).unwrap()
    }

    fn assert_invariants(state: &ChainState) {
        let chain = &state.chain;
        assert_eq!(chain[0].height, 0);
        assert_eq!(chain[0].prev_hash, [0u8; 32]);
        assert_eq!(chain[0].difficulty, GENESIS_BLOCK_DIFFICULTY);
        assert_eq!(state.current_height() as usize, chain.len() - 1);
        for i in 1..chain.len() {
            assert_eq!(chain[i].height as usize, i);
            assert_eq!(chain[i].prev_hash, hash_block(&chain[i - 1]));
            assert_eq!(
                chain[i].cumulative_work,
                chain[i - 1].cumulative_work + calculate_work(chain[i].difficulty)
            );
        }
    }

    #[test]
    fn sequential_apply_holds_invariants() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = fresh_state(dir.path());

        for _ in 0..3 {
            let raw = next_block_json(&state, 3_000_000);
            assert_eq!(state.apply_block(&raw, BlockSource::Seed).unwrap(), ApplyOutcome::Applied);
        }
        assert_eq!(state.current_height(), 3);
        assert_invariants(&state);
        // apply updates the live target from the block
        assert_eq!(state.difficulty_target(), 3_000_000);
        // coinbase credited once per block
        assert_eq!(state.balance("arcvfarmer"), 3 * INITIAL_BLOCK_REWARD);
    }

    #[test]
    fn reapply_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = fresh_state(dir.path());
        let raw = next_block_json(&state, 3_000_000);
        assert_eq!(state.apply_block(&raw, BlockSource::Seed).unwrap(), ApplyOutcome::Applied);
        let balance = state.balance("arcvfarmer");

        assert_eq!(
            state.apply_block(&raw, BlockSource::Seed).unwrap(),
            ApplyOutcome::AlreadyApplied
        );
        assert_eq!(state.current_height(), 1);
        assert_eq!(state.balance("arcvfarmer"), balance, "no double credit on replay");
    }

    #[test]
    fn duplicate_with_different_hash_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = fresh_state(dir.path());
        let raw = next_block_json(&state, 3_000_000);
        state.apply_block(&raw, BlockSource::Seed).unwrap();

        // same height, different contents
        let mut wire: BlockJson = serde_json::from_slice(&raw).unwrap();
        wire.timestamp += 1;
        wire.hash = None;
        let err = state
            .apply_block(&serde_json::to_vec(&wire).unwrap(), BlockSource::Seed)
            .unwrap_err();
        match err {
            NodeError::Rejected(msg) => assert!(msg.contains("duplicate with different hash")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn prev_hash_mismatch_is_fork() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = fresh_state(dir.path());
        let raw = next_block_json(&state, 3_000_000);
        let mut wire: BlockJson = serde_json::from_slice(&raw).unwrap();
        wire.prev_hash = hex::encode([0xAAu8; 32]);
        wire.hash = None;

        let before = state.tip_hash();
        let err = state
            .apply_block(&serde_json::to_vec(&wire).unwrap(), BlockSource::Seed)
            .unwrap_err();
        assert!(matches!(err, NodeError::ForkDetected { height: 1 }));
        assert_eq!(state.current_height(), 0);
        assert_eq!(state.tip_hash(), before);
        assert_eq!(state.reorg_mismatches(), 1);
    }

    #[test]
    fn height_discontinuity_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = fresh_state(dir.path());
        let raw = next_block_json(&state, 3_000_000);
        let mut wire: BlockJson = serde_json::from_slice(&raw).unwrap();
        wire.height = 5;
        wire.hash = None;
        let err = state
            .apply_block(&serde_json::to_vec(&wire).unwrap(), BlockSource::Seed)
            .unwrap_err();
        assert!(matches!(err, NodeError::HeightDiscontinuity { expected: 1, actual: 5 }));
    }

    #[test]
    fn declared_hash_mismatch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = fresh_state(dir.path());
        let raw = next_block_json(&state, 3_000_000);
        let mut wire: BlockJson = serde_json::from_slice(&raw).unwrap();
        wire.hash = Some(hex::encode([0x55u8; 32]));
        let err = state
            .apply_block(&serde_json::to_vec(&wire).unwrap(), BlockSource::Seed)
            .unwrap_err();
        assert!(matches!(err, NodeError::HashMismatch { height: 1, .. }));
        assert_eq!(state.current_height(), 0);
    }

    #[test]
    fn p2p_blocks_rejected_during_ibd() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = fresh_state(dir.path());
        state.gate.set_ibd_running(true);

        let raw = next_block_json(&state, 3_000_000);
        let len_before = state.chain_len();
        let tip_before = state.tip_hash();
        let err = state.apply_block(&raw, BlockSource::P2p).unwrap_err();
        assert!(matches!(err, NodeError::Rejected(_)));
        assert_eq!(state.chain_len(), len_before);
        assert_eq!(state.tip_hash(), tip_before);

        // seed-originated blocks still flow
        assert!(state.apply_block(&raw, BlockSource::Seed).is_ok());
    }

    #[test]
    fn accept_block_refused_during_ibd() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = fresh_state(dir.path());
        state.gate.set_ibd_running(true);

        let (challenge, _, _) = state.get_current_challenge();
        let plot_id = [8u8; 32];
        let proof = Proof {
            hash: crate::consensus::proof_hash(plot_id, challenge, 2),
            quality: 100,
            plot_id,
            index: 2,
            farmer_pubkey: [3u8; 33],
            challenge,
        };
        let err = state.accept_block(proof, "arcvfarmer", &[3u8; 33]).unwrap_err();
        match err {
            NodeError::Rejected(msg) => assert!(msg.contains("IBD in progress")),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(state.current_height(), 0);
    }

    #[test]
    fn accept_block_mints_reward_and_dampens() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = fresh_state(dir.path());
        assert_eq!(state.difficulty_target(), 4_000_000);
        assert_eq!(state.balance("arcvfarmer"), 0);

        let farm = |state: &mut ChainState| {
            let (challenge, _, _) = state.get_current_challenge();
            let plot_id = [8u8; 32];
            let proof = Proof {
                hash: crate::consensus::proof_hash(plot_id, challenge, 2),
                quality: 100,
                plot_id,
                index: 2,
                farmer_pubkey: [3u8; 33],
                challenge,
            };
            state.accept_block(proof, "arcvfarmer", &[3u8; 33]).unwrap()
        };

        assert_eq!(farm(&mut state), 1);
        assert_eq!(state.balance("arcvfarmer"), INITIAL_BLOCK_REWARD);
        assert_eq!(state.difficulty_target(), 2_000_000);

        assert_eq!(farm(&mut state), 2);
        assert_eq!(state.difficulty_target(), 1_000_000);

        assert_eq!(farm(&mut state), 3);
        assert_eq!(state.difficulty_target(), 1_000_000, "dampening floors at 1e6");

        assert_invariants(&state);
    }

    #[test]
    fn accept_block_drains_mempool() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = fresh_state(dir.path());
        state
            .mempool()
            .add(Transaction {
                from: "arcvnobody".into(),
                to: "arcvdest".into(),
                amount: 10,
                fee: 1,
                nonce: 1,
                sender_pub_key: None,
                signature: None,
            })
            .unwrap();
        assert_eq!(state.mempool().len(), 1);

        let (challenge, _, _) = state.get_current_challenge();
        let plot_id = [8u8; 32];
        let proof = Proof {
            hash: crate::consensus::proof_hash(plot_id, challenge, 2),
            quality: 100,
            plot_id,
            index: 2,
            farmer_pubkey: [3u8; 33],
            challenge,
        };
        state.accept_block(proof, "arcvfarmer", &[3u8; 33]).unwrap();

        // the invalid tx was skipped but still cleared with the rest
        assert!(state.mempool().is_empty());
        let tip = state.block_at(1).unwrap();
        assert_eq!(tip.txs.len(), 1, "only the coinbase made it in");
    }

    #[test]
    fn status_prefers_fresh_network_difficulty_early() {
        let dir = tempfile::tempdir().unwrap();
        let state = fresh_state(dir.path());
        let (_, local, _) = state.get_status();
        assert_eq!(local, 4_000_000);

        state.network.set_difficulty(9_000_000);
        let (height, difficulty, _) = state.get_status();
        assert_eq!(height, 0);
        assert_eq!(difficulty, 9_000_000);
    }

    #[test]
    fn reload_from_disk_restores_chain() {
        let dir = tempfile::tempdir().unwrap();
        let d = deps();
        let tip_hash;
        {
            let store = Store::open(dir.path()).unwrap();
            let mut state =
                ChainState::fresh(store, &test_doc(), "archivas-testnet", d.clone()).unwrap();
            for _ in 0..2 {
                let raw = next_block_json(&state, 3_000_000);
                state.apply_block(&raw, BlockSource::Seed).unwrap();
            }
            tip_hash = state.tip_hash();
        }
        let store = Store::open(dir.path()).unwrap();
        let state = ChainState::load(store, &test_doc(), "archivas-testnet", d).unwrap();
        assert_eq!(state.current_height(), 2);
        assert_eq!(state.tip_hash(), tip_hash);
        assert_eq!(state.difficulty_target(), 3_000_000);
        assert_eq!(state.balance("arcvfarmer"), 2 * INITIAL_BLOCK_REWARD);
        assert_invariants(&state);
    }

    #[test]
    fn blocks_range_serving() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = fresh_state(dir.path());
        for _ in 0..4 {
            let raw = next_block_json(&state, 3_000_000);
            state.apply_block(&raw, BlockSource::Seed).unwrap();
        }

        let (blocks, tip, eof) = state.blocks_range(1, 2);
        assert_eq!(tip, 4);
        assert_eq!(blocks.len(), 2);
        assert!(!eof);
        assert_eq!(blocks[0].height, 1);

        let (blocks, _, eof) = state.blocks_range(3, 100);
        assert_eq!(blocks.len(), 2);
        assert!(eof);

        let (blocks, _, eof) = state.blocks_range(9, 10);
        assert!(blocks.is_empty());
        assert!(eof);
    }

    #[test]
    fn vdf_update_rederives_challenge() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = fresh_state(dir.path());
        let (before, _, _) = state.get_current_challenge();
        state.update_vdf_state(vec![1, 2, 3], 1000, vec![9, 9, 9]);
        let (after, _, _) = state.get_current_challenge();
        assert_ne!(before, after);
        assert_eq!(state.current_vdf().unwrap().iterations, 1000);
    }
}
