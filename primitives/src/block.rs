//! Block, receipt and persisted-account types.
//!
//! The block hash covers every header field except the consensus signature,
//! prefixed with the shard id so identical blocks on two shards differ.

use crate::bloom::Bloom;
use crate::codec::encode_block_header;
use crate::crypto::hash_blake3_parts;
use crate::error::ErrorCode;
use crate::transaction::Transaction;
use crate::types::{
    Address, BlockNumber, Gas, Hash, Seqno, ShardId, TransactionIndex, Value, ZERO_HASH,
};

/// Block header plus consensus signature.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Block {
    pub id: BlockNumber,
    pub prev_block: Hash,
    pub smart_contracts_root: Hash,
    pub in_transactions_root: Hash,
    pub out_transactions_root: Hash,
    pub out_transactions_num: TransactionIndex,
    pub receipts_root: Hash,
    pub child_blocks_root_hash: Hash,
    pub main_shard_hash: Hash,
    /// Root of the config trie. Non-zero on the main shard only.
    pub config_root: Hash,
    pub base_fee: Value,
    pub gas_used: Gas,
    /// Next expected `tx_id` per source shard.
    pub in_tx_counts: Vec<(ShardId, u64)>,
    /// Next `tx_id` to assign per destination shard.
    pub out_tx_counts: Vec<(ShardId, u64)>,
    pub logs_bloom: Bloom,
    pub signature: Vec<u8>,
}

impl Block {
    pub fn hash(&self, shard: ShardId) -> Hash {
        hash_blake3_parts(&[&shard.to_be_bytes(), &encode_block_header(self)])
    }

    pub fn is_genesis(&self) -> bool {
        self.id == 0 && self.prev_block == ZERO_HASH
    }
}

/// A log record emitted during execution.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Log {
    pub address: Address,
    pub topics: Vec<Hash>,
    pub data: Vec<u8>,
}

/// Outcome of one in-transaction, aligned by index with the block's in-transactions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub success: bool,
    pub status: ErrorCode,
    pub gas_used: Gas,
    pub forwarded: Value,
    pub txn_hash: Hash,
    pub logs: Vec<Log>,
    /// Index of the first outbound transaction this one produced.
    pub out_txn_index: u32,
    /// Number of outbound transactions this one produced.
    pub out_txn_num: u32,
    pub contract_address: Address,
    pub failed_pc: u32,
}

impl Default for Receipt {
    fn default() -> Self {
        Self {
            success: true,
            status: ErrorCode::Success,
            gas_used: Gas::ZERO,
            forwarded: Value::ZERO,
            txn_hash: ZERO_HASH,
            logs: Vec::new(),
            out_txn_index: 0,
            out_txn_num: 0,
            contract_address: Address::EMPTY,
            failed_pc: 0,
        }
    }
}

/// Cursor into one neighbor's outbound-transaction stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Neighbor {
    pub shard_id: ShardId,
    /// Block whose outbound transactions are being drained.
    pub block_number: BlockNumber,
    /// Next outbound transaction to consume inside that block.
    pub transaction_index: TransactionIndex,
}

/// Durable per-shard bookmark of how far every neighbor has been drained.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CollatorState {
    pub neighbors: Vec<Neighbor>,
}

impl CollatorState {
    pub fn neighbor(&self, shard: ShardId) -> Option<&Neighbor> {
        self.neighbors.iter().find(|n| n.shard_id == shard)
    }

    /// Position of `shard`'s cursor, appending a fresh one if absent.
    pub fn neighbor_position(&mut self, shard: ShardId) -> usize {
        match self.neighbors.iter().position(|n| n.shard_id == shard) {
            Some(pos) => pos,
            None => {
                self.neighbors.push(Neighbor {
                    shard_id: shard,
                    ..Default::default()
                });
                self.neighbors.len() - 1
            }
        }
    }
}

/// Persisted account record stored in the contract trie.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SmartContract {
    pub address: Address,
    pub balance: Value,
    pub storage_root: Hash,
    pub token_root: Hash,
    pub async_context_root: Hash,
    pub code_hash: Hash,
    pub seqno: Seqno,
    pub ext_seqno: Seqno,
    pub request_id: u64,
}

/// A block together with everything a peer needs to replay it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BlockWithExtractedData {
    pub block: Block,
    pub in_transactions: Vec<Transaction>,
    pub out_transactions: Vec<Transaction>,
    pub child_blocks: Vec<Hash>,
    /// Gas-price table a main-shard block published; empty on other shards.
    pub gas_prices: Vec<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_hash_depends_on_shard() {
        let block = Block {
            id: 3,
            gas_used: Gas(21_000),
            ..Default::default()
        };
        assert_ne!(block.hash(ShardId(1)), block.hash(ShardId(2)));
    }

    #[test]
    fn test_block_hash_ignores_signature() {
        let mut block = Block {
            id: 1,
            ..Default::default()
        };
        let before = block.hash(ShardId(1));
        block.signature = vec![1, 2, 3];
        assert_eq!(block.hash(ShardId(1)), before);
        block.base_fee = Value(11);
        assert_ne!(block.hash(ShardId(1)), before);
    }

    #[test]
    fn test_collator_state_neighbor_position() {
        let mut state = CollatorState::default();
        assert_eq!(state.neighbor_position(ShardId(2)), 0);
        assert_eq!(state.neighbor_position(ShardId(3)), 1);
        assert_eq!(state.neighbor_position(ShardId(2)), 0);
        assert_eq!(state.neighbors.len(), 2);
        assert_eq!(state.neighbor(ShardId(3)).unwrap().block_number, 0);
    }
}
