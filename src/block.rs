//! Block, transaction, and proof-of-space primitives plus the wire codec.
//!
//! The wire format is JSON with camelCase field names and hex-encoded byte
//! fields, matching what the seed serves from `/blocks/range`. Numeric
//! fields are accepted both as JSON numbers and as decimal strings because
//! the production seed emits strings for some of them.

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};

use crate::error::NodeError;

pub type Hash32 = [u8; 32];

/// Sentinel address used as the `from` of a block reward transaction.
pub const COINBASE_ADDR: &str = "coinbase";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub from: String,
    pub to: String,
    pub amount: u64,
    pub fee: u64,
    pub nonce: u64,
    /// Compressed secp256k1 public key; absent for coinbase.
    pub sender_pub_key: Option<Vec<u8>>,
    /// Compact ECDSA signature over [`Transaction::signing_digest`].
    pub signature: Option<Vec<u8>>,
}

impl Transaction {
    pub fn coinbase(to: impl Into<String>, amount: u64) -> Self {
        Transaction {
            from: COINBASE_ADDR.to_string(),
            to: to.into(),
            amount,
            fee: 0,
            nonce: 0,
            sender_pub_key: None,
            signature: None,
        }
    }

    pub fn is_coinbase(&self) -> bool {
        self.from == COINBASE_ADDR
    }

    /// Digest covered by the sender's signature. Field order is fixed and
    /// the separators keep `("ab","c")` and `("a","bc")` distinct.
    pub fn signing_digest(&self) -> Hash32 {
        let mut h = Sha256::new();
        h.update(self.from.as_bytes());
        h.update(b"|");
        h.update(self.to.as_bytes());
        h.update(b"|");
        h.update(self.amount.to_string().as_bytes());
        h.update(b"|");
        h.update(self.fee.to_string().as_bytes());
        h.update(b"|");
        h.update(self.nonce.to_string().as_bytes());
        h.finalize().into()
    }
}

/// Proof-of-space bundle attached to every farmed (non-genesis) block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proof {
    pub hash: Hash32,
    /// Lower is better; wins the block when below the difficulty target.
    pub quality: u64,
    pub plot_id: Hash32,
    pub index: u64,
    /// Compressed secp256k1 key of the farmer who holds the plot.
    pub farmer_pubkey: [u8; 33],
    /// Equals the containing block's challenge.
    pub challenge: Hash32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub height: u64,
    /// Unix seconds.
    pub timestamp: i64,
    pub prev_hash: Hash32,
    /// Difficulty target in effect for this block; smaller = harder.
    pub difficulty: u64,
    pub challenge: Hash32,
    pub txs: Vec<Transaction>,
    pub proof: Option<Proof>,
    /// Empty for genesis.
    pub farmer_addr: String,
    pub cumulative_work: u64,
}

/// Canonical block digest: SHA-256(SHA-256(domain-concatenation)).
///
/// Integers contribute their decimal text encoding, byte fields contribute
/// raw bytes, and the proof hash is included only when a proof is attached.
/// Transactions, farmer address, and cumulative work do not contribute, so
/// a block fetched without its proof hashes to a different value than the
/// network's canonical hash.
pub fn hash_block(b: &Block) -> Hash32 {
    let mut h = Sha256::new();
    h.update(b.height.to_string().as_bytes());
    h.update(b.timestamp.to_string().as_bytes());
    h.update(b.prev_hash);
    h.update(b.difficulty.to_string().as_bytes());
    h.update(b.challenge);
    if let Some(proof) = &b.proof {
        h.update(proof.hash);
    }
    Sha256::digest(h.finalize()).into()
}

pub fn hex32(b: Hash32) -> String {
    hex::encode(b)
}

/// First eight bytes of a hash, for log lines.
pub fn short_hex(b: &Hash32) -> String {
    hex::encode(&b[..8])
}

pub fn parse_hash32(s: &str) -> Result<Hash32, NodeError> {
    let bytes = hex::decode(s)
        .map_err(|e| NodeError::Rejected(format!("invalid hex hash: {e}")))?;
    if bytes.len() != 32 {
        return Err(NodeError::Rejected(format!(
            "hash must be 32 bytes, got {}",
            bytes.len()
        )));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}

// =================== Wire codec ===================

pub(crate) fn u64_flex<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flex {
        Num(u64),
        Float(f64),
        Text(String),
    }
    match Flex::deserialize(d)? {
        Flex::Num(n) => Ok(n),
        Flex::Float(f) => Ok(f as u64),
        Flex::Text(s) => s.parse::<u64>().map_err(DeError::custom),
    }
}

fn i64_flex<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flex {
        Num(i64),
        Float(f64),
        Text(String),
    }
    match Flex::deserialize(d)? {
        Flex::Num(n) => Ok(n),
        Flex::Float(f) => Ok(f as i64),
        Flex::Text(s) => s.parse::<i64>().map_err(DeError::custom),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxJson {
    /// "coinbase" or "transfer"; derived from `from` on ingest.
    #[serde(rename = "type", default)]
    pub tx_type: Option<String>,
    pub from: String,
    pub to: String,
    #[serde(deserialize_with = "u64_flex")]
    pub amount: u64,
    #[serde(deserialize_with = "u64_flex")]
    pub fee: u64,
    #[serde(deserialize_with = "u64_flex")]
    pub nonce: u64,
    #[serde(rename = "senderPubKey", default, skip_serializing_if = "Option::is_none")]
    pub sender_pub_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProofJson {
    pub hash: String,
    #[serde(deserialize_with = "u64_flex")]
    pub quality: u64,
    #[serde(rename = "plotID")]
    pub plot_id: String,
    #[serde(deserialize_with = "u64_flex")]
    pub index: u64,
    #[serde(rename = "farmerPubKey")]
    pub farmer_pubkey: String,
    pub challenge: String,
}

/// Strict wire form of a block. Deserialization failures are surfaced
/// before the chain is touched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockJson {
    #[serde(deserialize_with = "u64_flex")]
    pub height: u64,
    #[serde(deserialize_with = "i64_flex")]
    pub timestamp: i64,
    #[serde(rename = "prevHash")]
    pub prev_hash: String,
    #[serde(deserialize_with = "u64_flex")]
    pub difficulty: u64,
    pub challenge: String,
    #[serde(rename = "farmerAddr", default)]
    pub farmer_addr: String,
    #[serde(default)]
    pub txs: Vec<TxJson>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proof: Option<ProofJson>,
    /// Network-computed block hash, used as an integrity check on ingest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

impl ProofJson {
    pub fn into_proof(self, block_challenge: Hash32) -> Result<Proof, NodeError> {
        let hash = parse_hash32(&self.hash)
            .map_err(|_| NodeError::Rejected("invalid proof hash format".into()))?;
        let plot_id = parse_hash32(&self.plot_id)
            .map_err(|_| NodeError::Rejected("invalid plotID format".into()))?;
        let pk_bytes = hex::decode(&self.farmer_pubkey)
            .map_err(|_| NodeError::Rejected("invalid farmerPubKey hex".into()))?;
        if pk_bytes.len() != 33 {
            return Err(NodeError::Rejected(format!(
                "farmerPubKey must be 33 bytes, got {}",
                pk_bytes.len()
            )));
        }
        let mut farmer_pubkey = [0u8; 33];
        farmer_pubkey.copy_from_slice(&pk_bytes);
        Ok(Proof {
            hash,
            quality: self.quality,
            plot_id,
            index: self.index,
            farmer_pubkey,
            // The block's challenge is authoritative; the proof repeats it.
            challenge: block_challenge,
        })
    }
}

impl From<&Proof> for ProofJson {
    fn from(p: &Proof) -> Self {
        ProofJson {
            hash: hex::encode(p.hash),
            quality: p.quality,
            plot_id: hex::encode(p.plot_id),
            index: p.index,
            farmer_pubkey: hex::encode(p.farmer_pubkey),
            challenge: hex::encode(p.challenge),
        }
    }
}

impl TxJson {
    pub fn into_transaction(self) -> Result<Transaction, NodeError> {
        let sender_pub_key = match self.sender_pub_key {
            Some(s) => Some(
                hex::decode(&s)
                    .map_err(|_| NodeError::Rejected("invalid senderPubKey hex".into()))?,
            ),
            None => None,
        };
        let signature = match self.signature {
            Some(s) => Some(
                hex::decode(&s)
                    .map_err(|_| NodeError::Rejected("invalid signature hex".into()))?,
            ),
            None => None,
        };
        Ok(Transaction {
            from: self.from,
            to: self.to,
            amount: self.amount,
            fee: self.fee,
            nonce: self.nonce,
            sender_pub_key,
            signature,
        })
    }
}

impl From<&Transaction> for TxJson {
    fn from(tx: &Transaction) -> Self {
        TxJson {
            tx_type: Some(if tx.is_coinbase() { "coinbase" } else { "transfer" }.to_string()),
            from: tx.from.clone(),
            to: tx.to.clone(),
            amount: tx.amount,
            fee: tx.fee,
            nonce: tx.nonce,
            sender_pub_key: tx.sender_pub_key.as_ref().map(hex::encode),
            signature: tx.signature.as_ref().map(hex::encode),
        }
    }
}

impl BlockJson {
    pub fn parse(raw: &[u8]) -> Result<Self, NodeError> {
        if raw.is_empty() {
            return Err(NodeError::Rejected("empty block data".into()));
        }
        Ok(serde_json::from_slice(raw)?)
    }

    /// Convert into the in-memory block form. `cumulative_work` is filled
    /// by the chain on apply. Returns the network-declared hash alongside
    /// so the caller can run the integrity check.
    ///
    /// A non-genesis block without its proof cannot reproduce the
    /// network's canonical hash, so it is rejected here.
    pub fn into_block(self) -> Result<(Block, Option<Hash32>), NodeError> {
        let height = self.height;
        let prev_hash = parse_hash32(&self.prev_hash)
            .map_err(|_| NodeError::Rejected(format!("block {height}: invalid prevHash")))?;
        let challenge = parse_hash32(&self.challenge)
            .map_err(|_| NodeError::Rejected(format!("block {height}: invalid challenge")))?;
        let proof = match self.proof {
            Some(p) => Some(p.into_proof(challenge)?),
            None if height > 0 => return Err(NodeError::MissingProof(height)),
            None => None,
        };
        let declared_hash = match self.hash {
            Some(h) => Some(parse_hash32(&h).map_err(|_| {
                NodeError::Rejected(format!("block {height}: invalid hash format"))
            })?),
            None => None,
        };
        let mut txs = Vec::with_capacity(self.txs.len());
        for tx in self.txs {
            txs.push(tx.into_transaction()?);
        }
        Ok((
            Block {
                height,
                timestamp: self.timestamp,
                prev_hash,
                difficulty: self.difficulty,
                challenge,
                txs,
                proof,
                farmer_addr: self.farmer_addr,
                cumulative_work: 0,
            },
            declared_hash,
        ))
    }
}

impl From<&Block> for BlockJson {
    fn from(b: &Block) -> Self {
        BlockJson {
            height: b.height,
            timestamp: b.timestamp,
            prev_hash: hex::encode(b.prev_hash),
            difficulty: b.difficulty,
            challenge: hex::encode(b.challenge),
            farmer_addr: b.farmer_addr.clone(),
            txs: b.txs.iter().map(TxJson::from).collect(),
            proof: b.proof.as_ref().map(ProofJson::from),
            hash: Some(hex::encode(hash_block(b))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_proof(challenge: Hash32) -> Proof {
        Proof {
            hash: [7u8; 32],
            quality: 42,
            plot_id: [9u8; 32],
            index: 3,
            farmer_pubkey: [2u8; 33],
            challenge,
        }
    }

    fn sample_block(height: u64, proof: Option<Proof>) -> Block {
        Block {
            height,
            timestamp: 1_700_000_000,
            prev_hash: [1u8; 32],
            difficulty: 5_000_000,
            challenge: [4u8; 32],
            txs: vec![Transaction::coinbase("arcvfarmer", 1_000)],
            proof,
            farmer_addr: "arcvfarmer".into(),
            cumulative_work: 0,
        }
    }

    #[test]
    fn proof_presence_changes_hash() {
        let without = sample_block(5, None);
        let with = sample_block(5, Some(sample_proof([4u8; 32])));
        assert_ne!(hash_block(&without), hash_block(&with));
    }

    #[test]
    fn txs_do_not_contribute_to_hash() {
        let mut a = sample_block(5, Some(sample_proof([4u8; 32])));
        let b = a.clone();
        a.txs.push(Transaction::coinbase("arcvother", 99));
        a.farmer_addr = "arcvother".into();
        a.cumulative_work = 123;
        assert_eq!(hash_block(&a), hash_block(&b));
    }

    #[test]
    fn wire_round_trip_preserves_hash() {
        let block = sample_block(8, Some(sample_proof([4u8; 32])));
        let json = serde_json::to_vec(&BlockJson::from(&block)).unwrap();
        let (decoded, declared) = BlockJson::parse(&json).unwrap().into_block().unwrap();
        assert_eq!(declared, Some(hash_block(&block)));
        assert_eq!(hash_block(&decoded), hash_block(&block));
        assert_eq!(decoded.txs, block.txs);
    }

    #[test]
    fn accepts_string_numerics() {
        let raw = format!(
            r#"{{"height":"12","timestamp":"1700000000","prevHash":"{}","difficulty":"5000000",
                "challenge":"{}","farmerAddr":"arcvx","txs":[],
                "proof":{{"hash":"{}","quality":"9","plotID":"{}","index":"1","farmerPubKey":"{}","challenge":"{}"}}}}"#,
            hex::encode([1u8; 32]),
            hex::encode([4u8; 32]),
            hex::encode([7u8; 32]),
            hex::encode([9u8; 32]),
            hex::encode([2u8; 33]),
            hex::encode([4u8; 32]),
        );
        let (block, _) = BlockJson::parse(raw.as_bytes()).unwrap().into_block().unwrap();
        assert_eq!(block.height, 12);
        assert_eq!(block.difficulty, 5_000_000);
        assert_eq!(block.proof.as_ref().unwrap().quality, 9);
    }

    #[test]
    fn non_genesis_without_proof_is_rejected() {
        let mut wire = BlockJson::from(&sample_block(3, Some(sample_proof([4u8; 32]))));
        wire.proof = None;
        let err = wire.into_block().unwrap_err();
        assert!(matches!(err, NodeError::MissingProof(3)));
    }

    #[test]
    fn genesis_without_proof_is_fine() {
        let genesis = Block {
            height: 0,
            timestamp: 0,
            prev_hash: [0u8; 32],
            difficulty: 1,
            challenge: [0u8; 32],
            txs: vec![],
            proof: None,
            farmer_addr: String::new(),
            cumulative_work: 0,
        };
        let wire = BlockJson::from(&genesis);
        assert!(wire.into_block().is_ok());
    }

    #[test]
    fn signing_digest_separates_fields() {
        let mut a = Transaction::coinbase("x", 10);
        a.from = "ab".into();
        a.to = "c".into();
        let mut b = a.clone();
        b.from = "a".into();
        b.to = "bc".into();
        assert_ne!(a.signing_digest(), b.signing_digest());
    }
}
