//! The unit of work handed from the proposer to the block generator.

use meridian_primitives::{BlockNumber, CollatorState, Hash, Transaction};

/// Transactions selected for the next block of one shard, with the cursor
/// state the block will persist.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Proposal {
    pub prev_block_id: BlockNumber,
    pub prev_block_hash: Hash,
    pub collator_state: CollatorState,
    pub main_shard_hash: Hash,
    /// Latest block of every non-main shard, in shard order starting at 1.
    /// Filled on the main shard only.
    pub shard_hashes: Vec<Hash>,
    pub internal_txns: Vec<Transaction>,
    pub external_txns: Vec<Transaction>,
    pub forward_txns: Vec<Transaction>,
}

impl Proposal {
    pub fn is_empty(&self) -> bool {
        self.internal_txns.is_empty() && self.external_txns.is_empty() && self.forward_txns.is_empty()
    }

    pub fn txn_count(&self) -> usize {
        self.internal_txns.len() + self.external_txns.len() + self.forward_txns.len()
    }
}
