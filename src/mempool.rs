//! Pending transaction buffer drained by block production.

use parking_lot::Mutex;

use crate::block::Transaction;
use crate::error::NodeError;

const MEMPOOL_MAX: usize = 10_000;

#[derive(Debug, Default)]
pub struct Mempool {
    pending: Mutex<Vec<Transaction>>,
}

impl Mempool {
    pub fn new() -> Self {
        Mempool::default()
    }

    /// Queue a transaction for the next farmed block. Admission here is
    /// structural only; full verification happens on block application.
    pub fn add(&self, tx: Transaction) -> Result<(), NodeError> {
        if tx.is_coinbase() {
            return Err(NodeError::InvalidTransaction("coinbase cannot be submitted".into()));
        }
        let mut pending = self.pending.lock();
        if pending.len() >= MEMPOOL_MAX {
            return Err(NodeError::Rejected("mempool full".into()));
        }
        let digest = tx.signing_digest();
        if pending.iter().any(|t| t.signing_digest() == digest) {
            return Err(NodeError::Rejected("duplicate transaction".into()));
        }
        pending.push(tx);
        Ok(())
    }

    pub fn pending(&self) -> Vec<Transaction> {
        self.pending.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Drop everything, including transactions that turned out invalid
    /// during block assembly.
    pub fn clear(&self) {
        self.pending.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx(nonce: u64) -> Transaction {
        Transaction {
            from: "arcvsender".into(),
            to: "arcvdest".into(),
            amount: 5,
            fee: 1,
            nonce,
            sender_pub_key: None,
            signature: None,
        }
    }

    #[test]
    fn add_pending_clear() {
        let mp = Mempool::new();
        mp.add(tx(1)).unwrap();
        mp.add(tx(2)).unwrap();
        assert_eq!(mp.len(), 2);
        mp.clear();
        assert!(mp.is_empty());
    }

    #[test]
    fn rejects_duplicates_and_coinbase() {
        let mp = Mempool::new();
        mp.add(tx(1)).unwrap();
        assert!(mp.add(tx(1)).is_err());
        assert!(mp.add(Transaction::coinbase("arcvdest", 9)).is_err());
    }
}
