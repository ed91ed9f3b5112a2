//! `meridian-collator`: block production and verification for Meridian shards.
//!
//! One collator runs per shard. On every tick it:
//!
//! - **Proposes:** drains outbound transactions of neighbor shards from the
//!   stored cursor, then external transactions from the pool, simulating
//!   each on a read-only snapshot within the block's limits
//! - **Inserts:** re-validates the proposal against the head and commits the
//!   generated block, then evicts the included transactions from the pool
//! - **Publishes:** notifies subscribers of the new block number and sends
//!   the block on the shard's topic
//!
//! Nodes that follow a shard instead of producing it run a [`Syncer`],
//! which fetches missing ranges and replays every received block before
//! inserting it.

pub mod error;
pub mod node;
pub mod params;
pub mod pool;
pub mod proposer;
pub mod scheduler;
pub mod syncer;
pub mod topology;
pub mod validator;

pub use error::{ConfigError, PoolError, ProposerError, ValidatorError};
pub use node::Node;
pub use params::CollatorParams;
pub use pool::{DiscardReason, MemPool, TxnPool};
pub use proposer::Proposer;
pub use scheduler::Scheduler;
pub use syncer::{BlockSource, BlockTopic, Syncer};
pub use topology::{ShardTopology, TopologyKind};
pub use validator::Validator;
