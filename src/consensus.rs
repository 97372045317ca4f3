//! Proof-of-space consensus helpers: difficulty target, per-block work,
//! challenge derivation, and proof verification.

use sha2::{Digest, Sha256};

use crate::block::Hash32;
use crate::error::NodeError;

/// Hardcoded difficulty of the genesis block itself (2^50). The consensus
/// target is seeded from the genesis file's `initial_difficulty` instead.
pub const GENESIS_BLOCK_DIFFICULTY: u64 = 1_125_899_906_842_624;

/// Floor applied when the target is dampened after a farmed block.
pub const DIFFICULTY_FLOOR: u64 = 1_000_000;

/// Reward minted by the coinbase transaction of every farmed block.
pub const INITIAL_BLOCK_REWARD: u64 = 1_000_000_000;

/// Live difficulty target. Distinct from any block's difficulty field:
/// blocks record the target that was in effect when they were farmed.
#[derive(Debug, Clone)]
pub struct Consensus {
    pub difficulty_target: u64,
}

impl Consensus {
    pub fn new(difficulty_target: u64) -> Self {
        Consensus { difficulty_target }
    }

    /// Halve the target after a locally farmed block, flooring at
    /// [`DIFFICULTY_FLOOR`]. Targets at or below the floor are left alone.
    pub fn dampen(&mut self) -> Option<(u64, u64)> {
        if self.difficulty_target > DIFFICULTY_FLOOR {
            let old = self.difficulty_target;
            self.difficulty_target = (self.difficulty_target / 2).max(DIFFICULTY_FLOOR);
            return Some((old, self.difficulty_target));
        }
        None
    }

    /// Verify a farmer's proof of space against the expected challenge.
    ///
    /// The plot lookup itself is attested by the proof hash binding; the
    /// quality is range-checked against the live target.
    pub fn verify_proof_of_space(
        &self,
        proof: &crate::block::Proof,
        challenge: Hash32,
    ) -> Result<(), NodeError> {
        if proof.challenge != challenge {
            return Err(NodeError::InvalidProof("challenge mismatch".into()));
        }
        let expected = proof_hash(proof.plot_id, proof.challenge, proof.index);
        if proof.hash != expected {
            return Err(NodeError::InvalidProof("proof hash does not bind to plot".into()));
        }
        if proof.quality >= self.difficulty_target {
            return Err(NodeError::InvalidProof(format!(
                "quality {} does not meet target {}",
                proof.quality, self.difficulty_target
            )));
        }
        Ok(())
    }
}

/// Approximate work contributed by a block: 2^64 / difficulty.
pub fn calculate_work(difficulty: u64) -> u64 {
    if difficulty == 0 {
        return 0;
    }
    u64::MAX / difficulty
}

/// Challenge for the next block: SHA-256(SHA-256(tip_hash ‖ next_height_be)).
pub fn generate_challenge(block_hash: Hash32, next_height: u64) -> Hash32 {
    let mut h = Sha256::new();
    h.update(block_hash);
    h.update(next_height.to_be_bytes());
    Sha256::digest(h.finalize()).into()
}

/// Same derivation over an arbitrary byte string, used when a timelord's
/// VDF output replaces the tip hash as the entropy source.
pub fn generate_challenge_bytes(bytes: &[u8], next_height: u64) -> Hash32 {
    let mut h = Sha256::new();
    h.update(bytes);
    h.update(next_height.to_be_bytes());
    Sha256::digest(h.finalize()).into()
}

/// Fixed challenge baked into the genesis block.
pub fn generate_genesis_challenge() -> Hash32 {
    Sha256::digest(b"archivas-genesis-challenge").into()
}

/// Deterministic binding of a proof to its plot and challenge.
pub fn proof_hash(plot_id: Hash32, challenge: Hash32, index: u64) -> Hash32 {
    let mut h = Sha256::new();
    h.update(plot_id);
    h.update(challenge);
    h.update(index.to_be_bytes());
    h.finalize().into()
}

/// Counts prev-hash divergences observed on the apply path. Purely
/// informational; fork choice still follows the seed.
#[derive(Debug, Default)]
pub struct ReorgDetector {
    mismatches: u64,
    last_height: Option<u64>,
}

impl ReorgDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_mismatch(&mut self, height: u64) {
        self.mismatches += 1;
        self.last_height = Some(height);
    }

    pub fn mismatches(&self) -> u64 {
        self.mismatches
    }

    pub fn last_height(&self) -> Option<u64> {
        self.last_height
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::Proof;

    fn winning_proof(challenge: Hash32, quality: u64) -> Proof {
        let plot_id = [5u8; 32];
        Proof {
            hash: proof_hash(plot_id, challenge, 11),
            quality,
            plot_id,
            index: 11,
            farmer_pubkey: [2u8; 33],
            challenge,
        }
    }

    #[test]
    fn work_is_inverse_of_difficulty() {
        assert!(calculate_work(1_000_000) > calculate_work(2_000_000));
        assert_eq!(calculate_work(0), 0);
        assert_eq!(calculate_work(1), u64::MAX);
    }

    #[test]
    fn challenge_depends_on_height_and_hash() {
        let h = [3u8; 32];
        assert_ne!(generate_challenge(h, 1), generate_challenge(h, 2));
        assert_ne!(generate_challenge(h, 1), generate_challenge([4u8; 32], 1));
    }

    #[test]
    fn dampening_halves_until_floor() {
        let mut cs = Consensus::new(4_000_000);
        assert_eq!(cs.dampen(), Some((4_000_000, 2_000_000)));
        assert_eq!(cs.dampen(), Some((2_000_000, 1_000_000)));
        assert_eq!(cs.dampen(), None);
        assert_eq!(cs.difficulty_target, DIFFICULTY_FLOOR);
    }

    #[test]
    fn dampening_never_undershoots_floor() {
        let mut cs = Consensus::new(1_500_000);
        assert_eq!(cs.dampen(), Some((1_500_000, 1_000_000)));
        assert_eq!(cs.difficulty_target, DIFFICULTY_FLOOR);
    }

    #[test]
    fn proof_verification() {
        let challenge = generate_genesis_challenge();
        let cs = Consensus::new(1_000_000);
        assert!(cs.verify_proof_of_space(&winning_proof(challenge, 500), challenge).is_ok());

        // quality at or above the target loses
        assert!(cs
            .verify_proof_of_space(&winning_proof(challenge, 1_000_000), challenge)
            .is_err());

        // wrong challenge
        let other = generate_challenge([1u8; 32], 9);
        assert!(cs.verify_proof_of_space(&winning_proof(other, 500), challenge).is_err());

        // tampered binding
        let mut bad = winning_proof(challenge, 500);
        bad.index = 12;
        assert!(cs.verify_proof_of_space(&bad, challenge).is_err());
    }
}
