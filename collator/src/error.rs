//! Collator error types.
//!
//! Transaction-level failures never surface here: they end up in receipts
//! or in the failure-receipt cache. These errors abort a whole proposal,
//! block insertion or node startup.

use meridian_primitives::{BlockNumber, FatalError, ShardId};
use meridian_storage::StorageError;

/// Failure of the transaction pool collaborator.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// The pool holds as many transactions as it may.
    #[error("transaction pool is full ({0} transactions)")]
    Full(usize),

    /// The transaction belongs to another shard's pool.
    #[error("transaction for shard {got} submitted to the pool of shard {expected}")]
    WrongShard { expected: ShardId, got: ShardId },

    #[error("no pool for shard {0}")]
    UnknownShard(ShardId),
}

/// Failure while assembling a proposal.
#[derive(Debug, thiserror::Error)]
pub enum ProposerError {
    /// Storage failure or broken invariant inside execution.
    #[error("fatal error while collating: {0}")]
    Fatal(#[from] FatalError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// The shard has no zero state yet.
    #[error("shard {0} has no blocks")]
    NoBlocks(ShardId),

    #[error("transaction pool error: {0}")]
    Pool(#[from] PoolError),
}

/// Failure while verifying, inserting or replaying a block.
#[derive(Debug, thiserror::Error)]
pub enum ValidatorError {
    /// The block is at or below the current head.
    #[error("block {0} is older than the current head")]
    OldBlock(BlockNumber),

    /// The block does not directly follow the current head.
    #[error("block {got} is out of order, expected {expected}")]
    OutOfOrder { expected: BlockNumber, got: BlockNumber },

    /// The block does not build on the current head.
    #[error("previous block hash mismatch: head is {expected}, block builds on {got}")]
    HashMismatch { expected: String, got: String },

    /// Replaying a received block produced a different result.
    #[error("{what} mismatch: expected {expected}, got {got}")]
    ReplayMismatch {
        what: &'static str,
        expected: String,
        got: String,
    },

    /// The shard has no zero state yet.
    #[error("shard {0} has no blocks")]
    NoBlocks(ShardId),

    /// Waiting for a main-shard block timed out.
    #[error("timed out waiting for main-shard block {0}")]
    Timeout(String),

    /// The node is shutting down.
    #[error("cancelled")]
    Cancelled,

    #[error("proposer error: {0}")]
    Proposer(#[from] ProposerError),

    #[error("fatal error: {0}")]
    Fatal(#[from] FatalError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// A blocking task panicked or was aborted.
    #[error("block task failed: {0}")]
    Join(String),
}

/// Invalid or unreadable node parameters.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    /// Parameters parse but cannot run a node.
    #[error("invalid config: {0}")]
    Invalid(String),
}
