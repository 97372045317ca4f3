//! Persistent chain store on sled.
//!
//! One database per data directory, string-prefixed keys, big-endian
//! fixed-width integer values and JSON block payloads:
//!
//! - `blk:<height_be8>`    -> json(BlockJson)
//! - `acct:<address>`      -> balance_be8 ++ nonce_be8
//! - `meta:tip_height`     -> u64 BE
//! - `meta:difficulty`     -> u64 BE
//! - `meta:genesis_hash`   -> 32 raw bytes
//! - `meta:network_id`     -> utf8
//!
//! Writes are not cross-key atomic. The one ordering rule that matters:
//! a block must be inserted before the tip height that references it, so
//! a crashed node never advertises a tip whose block is absent. sled
//! preserves insert order within its log, which is all we rely on.

use std::path::{Path, PathBuf};

use crate::block::{Block, BlockJson, Hash32};
use crate::error::NodeError;

const BLK_PREFIX: &str = "blk:";
const ACCT_PREFIX: &str = "acct:";
const META_TIP_HEIGHT: &str = "meta:tip_height";
const META_DIFFICULTY: &str = "meta:difficulty";
const META_GENESIS_HASH: &str = "meta:genesis_hash";
const META_NETWORK_ID: &str = "meta:network_id";

/// Marker file signalling the store is open. A stale file from a crashed
/// process is only worth a warning; sled handles real locking itself.
const LOCK_FILE: &str = "LOCK";

fn blk_key(height: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(BLK_PREFIX.len() + 8);
    key.extend_from_slice(BLK_PREFIX.as_bytes());
    key.extend_from_slice(&height.to_be_bytes());
    key
}

fn acct_key(addr: &str) -> Vec<u8> {
    format!("{ACCT_PREFIX}{addr}").into_bytes()
}

fn u64_from_be(v: &[u8]) -> Option<u64> {
    let arr: [u8; 8] = v.try_into().ok()?;
    Some(u64::from_be_bytes(arr))
}

pub struct Store {
    db: sled::Db,
    data_dir: PathBuf,
}

impl Store {
    pub fn open(data_dir: &Path) -> Result<Self, NodeError> {
        std::fs::create_dir_all(data_dir)?;

        let lock_path = data_dir.join(LOCK_FILE);
        if lock_path.exists() {
            tracing::warn!(
                path = %lock_path.display(),
                "LOCK file exists - store may be open in another process, or this is a stale lock"
            );
        }

        let db = sled::open(data_dir.join("chaindb"))?;
        std::fs::write(&lock_path, b"")?;
        Ok(Store { db, data_dir: data_dir.to_path_buf() })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    // ---- blocks ----

    pub fn save_block(&self, height: u64, block: &Block) -> Result<(), NodeError> {
        let payload = serde_json::to_vec(&BlockJson::from(block))?;
        self.db.insert(blk_key(height), payload)?;
        Ok(())
    }

    pub fn load_block(&self, height: u64) -> Result<Option<Block>, NodeError> {
        match self.db.get(blk_key(height))? {
            Some(bytes) => {
                let wire: BlockJson = serde_json::from_slice(&bytes)?;
                let (block, _) = wire.into_block()?;
                Ok(Some(block))
            }
            None => Ok(None),
        }
    }

    /// Raw stored bytes for a block, for range serving without a decode
    /// round trip.
    pub fn load_block_bytes(&self, height: u64) -> Result<Option<Vec<u8>>, NodeError> {
        Ok(self.db.get(blk_key(height))?.map(|v| v.to_vec()))
    }

    // ---- accounts ----

    pub fn save_account(&self, addr: &str, balance: u64, nonce: u64) -> Result<(), NodeError> {
        let mut value = [0u8; 16];
        value[..8].copy_from_slice(&balance.to_be_bytes());
        value[8..].copy_from_slice(&nonce.to_be_bytes());
        self.db.insert(acct_key(addr), &value[..])?;
        Ok(())
    }

    pub fn load_account(&self, addr: &str) -> Result<Option<(u64, u64)>, NodeError> {
        match self.db.get(acct_key(addr))? {
            Some(v) if v.len() == 16 => {
                let balance = u64_from_be(&v[..8]).unwrap_or(0);
                let nonce = u64_from_be(&v[8..]).unwrap_or(0);
                Ok(Some((balance, nonce)))
            }
            Some(_) => Err(NodeError::Rejected(format!("corrupt account record for {addr}"))),
            None => Ok(None),
        }
    }

    // ---- metadata ----

    pub fn save_tip_height(&self, height: u64) -> Result<(), NodeError> {
        self.db.insert(META_TIP_HEIGHT, &height.to_be_bytes()[..])?;
        Ok(())
    }

    pub fn load_tip_height(&self) -> Result<Option<u64>, NodeError> {
        Ok(self.db.get(META_TIP_HEIGHT)?.and_then(|v| u64_from_be(&v)))
    }

    pub fn save_difficulty(&self, difficulty: u64) -> Result<(), NodeError> {
        self.db.insert(META_DIFFICULTY, &difficulty.to_be_bytes()[..])?;
        Ok(())
    }

    pub fn load_difficulty(&self) -> Result<Option<u64>, NodeError> {
        Ok(self.db.get(META_DIFFICULTY)?.and_then(|v| u64_from_be(&v)))
    }

    pub fn save_genesis_hash(&self, hash: Hash32) -> Result<(), NodeError> {
        self.db.insert(META_GENESIS_HASH, &hash[..])?;
        Ok(())
    }

    pub fn load_genesis_hash(&self) -> Result<Option<Hash32>, NodeError> {
        match self.db.get(META_GENESIS_HASH)? {
            Some(v) if v.len() == 32 => {
                let mut out = [0u8; 32];
                out.copy_from_slice(&v);
                Ok(Some(out))
            }
            _ => Ok(None),
        }
    }

    pub fn save_network_id(&self, network_id: &str) -> Result<(), NodeError> {
        self.db.insert(META_NETWORK_ID, network_id.as_bytes())?;
        Ok(())
    }

    pub fn load_network_id(&self) -> Result<Option<String>, NodeError> {
        Ok(self
            .db
            .get(META_NETWORK_ID)?
            .map(|v| String::from_utf8_lossy(&v).into_owned()))
    }

    // ---- coordinated apply commit ----

    /// Commit one applied block: the block itself, every account the apply
    /// touched, then the tip height. Block write failures propagate
    /// (an advanced tip without its block would be unrecoverable); account
    /// and tip failures are logged and tolerated.
    pub fn commit_applied_block<'a>(
        &self,
        block: &Block,
        accounts: impl Iterator<Item = (&'a String, &'a crate::ledger::AccountState)>,
    ) -> Result<(), NodeError> {
        if let Err(e) = self.save_block(block.height, block) {
            tracing::error!(height = block.height, err = %e, "failed to save block to disk");
            return Err(e);
        }
        for (addr, acc) in accounts {
            if let Err(e) = self.save_account(addr, acc.balance, acc.nonce) {
                tracing::warn!(addr = %addr, err = %e, "failed to save account");
            }
        }
        if let Err(e) = self.save_tip_height(block.height) {
            tracing::warn!(err = %e, "failed to save tip height");
        }
        Ok(())
    }

    pub fn flush(&self) -> Result<(), NodeError> {
        self.db.flush()?;
        Ok(())
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        let _ = self.db.flush();
        let _ = std::fs::remove_file(self.data_dir.join(LOCK_FILE));
    }
}
