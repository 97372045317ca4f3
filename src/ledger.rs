//! World state: the address → account map mutated by block application.

use std::collections::BTreeMap;

use secp256k1::ecdsa::Signature;
use secp256k1::{Message, PublicKey, Secp256k1, VerifyOnly};
use sha2::{Digest, Sha256};

use crate::block::Transaction;
use crate::error::NodeError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccountState {
    pub balance: u64,
    pub nonce: u64,
}

/// Accounts are created on first credit and never removed. Mutation only
/// happens under the chain write lock.
#[derive(Debug)]
pub struct WorldState {
    pub accounts: BTreeMap<String, AccountState>,
    secp: Secp256k1<VerifyOnly>,
}

impl WorldState {
    /// Fresh state from genesis allocations.
    pub fn new(allocations: &BTreeMap<String, u64>) -> Self {
        let mut accounts = BTreeMap::new();
        for (addr, balance) in allocations {
            accounts.insert(addr.clone(), AccountState { balance: *balance, nonce: 0 });
        }
        WorldState { accounts, secp: Secp256k1::verification_only() }
    }

    pub fn empty() -> Self {
        WorldState { accounts: BTreeMap::new(), secp: Secp256k1::verification_only() }
    }

    pub fn balance(&self, addr: &str) -> u64 {
        self.accounts.get(addr).map(|a| a.balance).unwrap_or(0)
    }

    pub fn account(&self, addr: &str) -> Option<AccountState> {
        self.accounts.get(addr).copied()
    }

    /// Credit without any checks; used by coinbase application.
    pub fn credit(&mut self, addr: &str, amount: u64) {
        let acc = self.accounts.entry(addr.to_string()).or_default();
        acc.balance = acc.balance.saturating_add(amount);
    }

    /// Check a non-coinbase transfer without mutating anything: signature
    /// over the signing digest, sender address binding, strict nonce, and
    /// balance covering amount + fee.
    pub fn validate_transaction(&self, tx: &Transaction) -> Result<(), NodeError> {
        if tx.is_coinbase() {
            return Err(NodeError::InvalidTransaction(
                "coinbase must not go through apply_transaction".into(),
            ));
        }

        let pk_bytes = tx
            .sender_pub_key
            .as_deref()
            .ok_or_else(|| NodeError::InvalidTransaction("missing sender public key".into()))?;
        let sig_bytes = tx
            .signature
            .as_deref()
            .ok_or_else(|| NodeError::InvalidTransaction("missing signature".into()))?;

        let pubkey = PublicKey::from_slice(pk_bytes)
            .map_err(|e| NodeError::InvalidTransaction(format!("bad public key: {e}")))?;
        let signature = Signature::from_compact(sig_bytes)
            .map_err(|e| NodeError::InvalidTransaction(format!("bad signature encoding: {e}")))?;
        let msg = Message::from_slice(&tx.signing_digest())
            .map_err(|e| NodeError::InvalidTransaction(format!("bad digest: {e}")))?;
        self.secp
            .verify_ecdsa(&msg, &signature, &pubkey)
            .map_err(|_| NodeError::InvalidTransaction("signature verification failed".into()))?;

        if derive_address(&pubkey.serialize()) != tx.from {
            return Err(NodeError::InvalidTransaction(
                "sender address does not match public key".into(),
            ));
        }

        let sender = self.accounts.get(&tx.from).copied().unwrap_or_default();
        if tx.nonce != sender.nonce + 1 {
            return Err(NodeError::InvalidTransaction(format!(
                "nonce mismatch: expected {}, got {}",
                sender.nonce + 1,
                tx.nonce
            )));
        }
        let total = tx
            .amount
            .checked_add(tx.fee)
            .ok_or_else(|| NodeError::InvalidTransaction("amount + fee overflows".into()))?;
        if sender.balance < total {
            return Err(NodeError::InvalidTransaction(format!(
                "insufficient balance: have {}, need {}",
                sender.balance, total
            )));
        }
        Ok(())
    }

    /// Verify and apply a non-coinbase transfer. Fees are burned, not
    /// redistributed.
    pub fn apply_transaction(&mut self, tx: &Transaction) -> Result<(), NodeError> {
        self.validate_transaction(tx)?;

        let total = tx.amount + tx.fee; // checked in validate
        // Debit first so a self-transfer nets out to just the fee.
        {
            let s = self.accounts.entry(tx.from.clone()).or_default();
            s.balance -= total;
            s.nonce = tx.nonce;
        }
        self.credit(&tx.to, tx.amount);
        Ok(())
    }
}

/// Farmer/wallet address from a compressed secp256k1 public key:
/// `arcv` + hex of the first 20 bytes of SHA-256(pubkey).
pub fn derive_address(pubkey: &[u8]) -> String {
    let digest = Sha256::digest(pubkey);
    format!("arcv{}", hex::encode(&digest[..20]))
}
