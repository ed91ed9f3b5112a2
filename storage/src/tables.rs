//! Table layout and typed accessors.
//!
//! Keys are `table byte ‖ shard id (BE) ‖ record key`. Trie nodes and
//! contract code are content-addressed and shared by every shard, so their
//! keys carry no shard id.

use meridian_primitives::codec::{Codec, CodecError, Reader};
use meridian_primitives::{Block, BlockNumber, CollatorState, Hash, ShardId, TransactionIndex};

use crate::error::StorageError;
use crate::tx::Tx;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Table {
    TrieNode = 1,
    Code = 2,
    Block = 3,
    BlockHashByNumber = 4,
    LastBlock = 5,
    CollatorState = 6,
    InTxLocation = 7,
    OutTxLocation = 8,
    ErrorByHash = 9,
    BlockTimestamp = 10,
}

impl Table {
    /// Tables holding per-shard records, i.e. what a snapshot of one shard covers.
    pub const SHARDED: [Table; 8] = [
        Table::Block,
        Table::BlockHashByNumber,
        Table::LastBlock,
        Table::CollatorState,
        Table::InTxLocation,
        Table::OutTxLocation,
        Table::ErrorByHash,
        Table::BlockTimestamp,
    ];
}

pub fn shard_prefix(table: Table, shard: ShardId) -> Vec<u8> {
    let mut key = Vec::with_capacity(5);
    key.push(table as u8);
    key.extend_from_slice(&shard.to_be_bytes());
    key
}

pub fn table_key(table: Table, shard: ShardId, record: &[u8]) -> Vec<u8> {
    let mut key = shard_prefix(table, shard);
    key.extend_from_slice(record);
    key
}

pub fn node_key(hash: &Hash) -> Vec<u8> {
    let mut key = Vec::with_capacity(33);
    key.push(Table::TrieNode as u8);
    key.extend_from_slice(hash);
    key
}

fn code_key(hash: &Hash) -> Vec<u8> {
    let mut key = Vec::with_capacity(33);
    key.push(Table::Code as u8);
    key.extend_from_slice(hash);
    key
}

/// Where a transaction landed: the block and its index in the in/out list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxLocation {
    pub block_hash: Hash,
    pub index: TransactionIndex,
}

impl Codec for TxLocation {
    fn encode_to(&self, buf: &mut Vec<u8>) {
        self.block_hash.encode_to(buf);
        self.index.encode_to(buf);
    }

    fn decode_from(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(TxLocation {
            block_hash: r.read_hash()?,
            index: r.read_u64()?,
        })
    }
}

impl Tx {
    fn get_typed<T: Codec>(&self, key: &[u8]) -> Result<Option<T>, StorageError> {
        match self.get(key)? {
            Some(bytes) => Ok(Some(T::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    // ── Blocks ──

    pub fn read_block(&self, shard: ShardId, hash: &Hash) -> Result<Option<Block>, StorageError> {
        self.get_typed(&table_key(Table::Block, shard, hash))
    }

    /// Store a block under its hash and return the hash.
    pub fn write_block(&mut self, shard: ShardId, block: &Block) -> Hash {
        let hash = block.hash(shard);
        self.put(table_key(Table::Block, shard, &hash), block.encode());
        hash
    }

    pub fn read_block_hash_by_number(
        &self,
        shard: ShardId,
        number: BlockNumber,
    ) -> Result<Option<Hash>, StorageError> {
        self.get_typed(&table_key(Table::BlockHashByNumber, shard, &number.to_be_bytes()))
    }

    pub fn write_block_hash_by_number(&mut self, shard: ShardId, number: BlockNumber, hash: &Hash) {
        self.put(
            table_key(Table::BlockHashByNumber, shard, &number.to_be_bytes()),
            hash.to_vec(),
        );
    }

    pub fn read_block_by_number(
        &self,
        shard: ShardId,
        number: BlockNumber,
    ) -> Result<Option<(Block, Hash)>, StorageError> {
        let Some(hash) = self.read_block_hash_by_number(shard, number)? else {
            return Ok(None);
        };
        Ok(self.read_block(shard, &hash)?.map(|b| (b, hash)))
    }

    pub fn read_last_block_hash(&self, shard: ShardId) -> Result<Option<Hash>, StorageError> {
        self.get_typed(&shard_prefix(Table::LastBlock, shard))
    }

    pub fn write_last_block_hash(&mut self, shard: ShardId, hash: &Hash) {
        self.put(shard_prefix(Table::LastBlock, shard), hash.to_vec());
    }

    /// Head of `shard`'s chain, if it has a genesis block.
    pub fn read_last_block(&self, shard: ShardId) -> Result<Option<(Block, Hash)>, StorageError> {
        let Some(hash) = self.read_last_block_hash(shard)? else {
            return Ok(None);
        };
        Ok(self.read_block(shard, &hash)?.map(|b| (b, hash)))
    }

    pub fn write_block_timestamp(&mut self, shard: ShardId, hash: &Hash, timestamp: u64) {
        self.put(table_key(Table::BlockTimestamp, shard, hash), timestamp.encode());
    }

    pub fn read_block_timestamp(&self, shard: ShardId, hash: &Hash) -> Result<Option<u64>, StorageError> {
        self.get_typed(&table_key(Table::BlockTimestamp, shard, hash))
    }

    // ── Collator cursor ──

    /// Missing state reads as an empty cursor set.
    pub fn read_collator_state(&self, shard: ShardId) -> Result<CollatorState, StorageError> {
        Ok(self
            .get_typed(&shard_prefix(Table::CollatorState, shard))?
            .unwrap_or_default())
    }

    pub fn write_collator_state(&mut self, shard: ShardId, state: &CollatorState) {
        self.put(shard_prefix(Table::CollatorState, shard), state.encode());
    }

    // ── Indices ──

    pub fn write_in_tx_location(&mut self, shard: ShardId, txn_hash: &Hash, loc: TxLocation) {
        self.put(table_key(Table::InTxLocation, shard, txn_hash), loc.encode());
    }

    pub fn read_in_tx_location(&self, shard: ShardId, txn_hash: &Hash) -> Result<Option<TxLocation>, StorageError> {
        self.get_typed(&table_key(Table::InTxLocation, shard, txn_hash))
    }

    pub fn write_out_tx_location(&mut self, shard: ShardId, txn_hash: &Hash, loc: TxLocation) {
        self.put(table_key(Table::OutTxLocation, shard, txn_hash), loc.encode());
    }

    pub fn read_out_tx_location(&self, shard: ShardId, txn_hash: &Hash) -> Result<Option<TxLocation>, StorageError> {
        self.get_typed(&table_key(Table::OutTxLocation, shard, txn_hash))
    }

    pub fn write_error(&mut self, shard: ShardId, txn_hash: &Hash, message: &str) {
        self.put(
            table_key(Table::ErrorByHash, shard, txn_hash),
            message.as_bytes().to_vec(),
        );
    }

    pub fn read_error(&self, shard: ShardId, txn_hash: &Hash) -> Result<Option<String>, StorageError> {
        Ok(self
            .get(&table_key(Table::ErrorByHash, shard, txn_hash))?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    // ── Code ──

    pub fn write_code(&mut self, code_hash: &Hash, code: &[u8]) {
        self.put(code_key(code_hash), code.to_vec());
    }

    pub fn read_code(&self, code_hash: &Hash) -> Result<Option<Vec<u8>>, StorageError> {
        self.get(&code_key(code_hash))
    }

    // ── Snapshots ──

    /// Every per-shard record of `shard`, as raw key/value pairs.
    pub fn export_shard(&self, shard: ShardId) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        let mut out = Vec::new();
        for table in Table::SHARDED {
            out.extend(self.scan_prefix(&shard_prefix(table, shard))?);
        }
        Ok(out)
    }
}
