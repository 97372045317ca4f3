//! Archivas full node and farmer client.
//!
//! The node keeps a deterministic chain in sync with the network's
//! trusted seed: bulk IBD at startup, periodic catch-up afterwards, and
//! destructive in-process fork recovery whenever the local chain turns
//! out to diverge. Farmers talk to the node over its HTTP RPC to fetch
//! challenges and submit winning proofs of space.

pub mod block;
pub mod chain;
pub mod consensus;
pub mod context;
pub mod error;
pub mod farmer;
pub mod gate;
pub mod genesis;
pub mod health;
pub mod ledger;
pub mod mempool;
pub mod metrics;
pub mod node;
pub mod p2p;
pub mod recovery;
pub mod rpc;
pub mod storage;
pub mod sync;

pub use block::{hash_block, Block, BlockJson, Hash32, Proof, Transaction};
pub use chain::{ApplyOutcome, BlockSource, ChainDeps, ChainState};
pub use context::{NodeConfig, NodeContext};
pub use error::NodeError;
pub use node::Node;
