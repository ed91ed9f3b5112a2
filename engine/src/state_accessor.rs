//! Cached read access to stored blocks and their contents.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

use meridian_primitives::{
    Block, BlockNumber, BlockWithExtractedData, FatalResult, Hash, Receipt, ShardId, Transaction,
};
use meridian_storage::{create_ro_tx, Database, Tx};

use crate::config::{ConfigAccessor, ParamGasPrice};
use crate::tries::{child_blocks, collect_all, collect_indexed, fetch_indexed};

/// Most blocks a single range request returns.
pub const MAX_BLOCK_RANGE: u64 = 100;

const DEFAULT_CACHE_SIZE: usize = 128;

type Key = (ShardId, Hash);

struct Caches {
    blocks: LruCache<Key, Arc<Block>>,
    in_txns: LruCache<Key, Arc<Vec<Transaction>>>,
    out_txns: LruCache<Key, Arc<Vec<Transaction>>>,
    receipts: LruCache<Key, Arc<Vec<Receipt>>>,
}

/// Read-through LRU over the block tables of every shard.
pub struct StateAccessor {
    db: Arc<dyn Database>,
    caches: Mutex<Caches>,
}

/// A receipt together with its recorded error message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiptWithError {
    pub receipt: Receipt,
    pub block_hash: Hash,
    pub error: Option<String>,
}

impl StateAccessor {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self::with_capacity(db, DEFAULT_CACHE_SIZE)
    }

    pub fn with_capacity(db: Arc<dyn Database>, capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            db,
            caches: Mutex::new(Caches {
                blocks: LruCache::new(cap),
                in_txns: LruCache::new(cap),
                out_txns: LruCache::new(cap),
                receipts: LruCache::new(cap),
            }),
        }
    }

    fn tx(&self) -> Tx {
        create_ro_tx(&self.db)
    }

    pub fn block(&self, shard: ShardId, hash: &Hash) -> FatalResult<Option<Arc<Block>>> {
        let key = (shard, *hash);
        if let Some(block) = self.caches.lock().blocks.get(&key) {
            return Ok(Some(Arc::clone(block)));
        }
        let Some(block) = self.tx().read_block(shard, hash)? else {
            return Ok(None);
        };
        let block = Arc::new(block);
        self.caches.lock().blocks.put(key, Arc::clone(&block));
        Ok(Some(block))
    }

    pub fn block_by_number(
        &self,
        shard: ShardId,
        number: BlockNumber,
    ) -> FatalResult<Option<(Arc<Block>, Hash)>> {
        let Some(hash) = self.tx().read_block_hash_by_number(shard, number)? else {
            return Ok(None);
        };
        Ok(self.block(shard, &hash)?.map(|block| (block, hash)))
    }

    pub fn last_block(&self, shard: ShardId) -> FatalResult<Option<(Arc<Block>, Hash)>> {
        let Some(hash) = self.tx().read_last_block_hash(shard)? else {
            return Ok(None);
        };
        Ok(self.block(shard, &hash)?.map(|block| (block, hash)))
    }

    pub fn in_transactions(&self, shard: ShardId, block: &Block, hash: &Hash) -> FatalResult<Arc<Vec<Transaction>>> {
        let key = (shard, *hash);
        if let Some(txns) = self.caches.lock().in_txns.get(&key) {
            return Ok(Arc::clone(txns));
        }
        let txns = Arc::new(collect_all(&self.tx(), block.in_transactions_root)?);
        self.caches.lock().in_txns.put(key, Arc::clone(&txns));
        Ok(txns)
    }

    pub fn out_transactions(&self, shard: ShardId, block: &Block, hash: &Hash) -> FatalResult<Arc<Vec<Transaction>>> {
        let key = (shard, *hash);
        if let Some(txns) = self.caches.lock().out_txns.get(&key) {
            return Ok(Arc::clone(txns));
        }
        let txns = Arc::new(collect_indexed(
            &self.tx(),
            block.out_transactions_root,
            block.out_transactions_num,
        )?);
        self.caches.lock().out_txns.put(key, Arc::clone(&txns));
        Ok(txns)
    }

    pub fn receipts(&self, shard: ShardId, block: &Block, hash: &Hash) -> FatalResult<Arc<Vec<Receipt>>> {
        let key = (shard, *hash);
        if let Some(receipts) = self.caches.lock().receipts.get(&key) {
            return Ok(Arc::clone(receipts));
        }
        let receipts = Arc::new(collect_all(&self.tx(), block.receipts_root)?);
        self.caches.lock().receipts.put(key, Arc::clone(&receipts));
        Ok(receipts)
    }

    /// Outbound transaction `index` of a block, read without caching the
    /// whole list.
    pub fn out_transaction(&self, block: &Block, index: u64) -> FatalResult<Option<Transaction>> {
        if index >= block.out_transactions_num {
            return Ok(None);
        }
        fetch_indexed(&self.tx(), block.out_transactions_root, index)
    }

    pub fn block_with_extracted_data(
        &self,
        shard: ShardId,
        hash: &Hash,
    ) -> FatalResult<Option<BlockWithExtractedData>> {
        let Some(block) = self.block(shard, hash)? else {
            return Ok(None);
        };
        let in_transactions = self.in_transactions(shard, &block, hash)?.as_ref().clone();
        let out_transactions = self.out_transactions(shard, &block, hash)?.as_ref().clone();
        let child_blocks = child_blocks(&self.tx(), &block)?
            .into_iter()
            .map(|(_, hash)| hash)
            .collect();
        let gas_prices = if shard.is_main() {
            let tx = self.tx();
            ConfigAccessor::read_only(block.config_root)
                .get::<ParamGasPrice, _>(&tx)?
                .map(|param| param.shards)
                .unwrap_or_default()
        } else {
            Vec::new()
        };
        Ok(Some(BlockWithExtractedData {
            block: block.as_ref().clone(),
            in_transactions,
            out_transactions,
            child_blocks,
            gas_prices,
        }))
    }

    /// Up to `count` consecutive blocks starting at `from`, never more than
    /// [`MAX_BLOCK_RANGE`]. Stops at the first missing block.
    pub fn block_range(
        &self,
        shard: ShardId,
        from: BlockNumber,
        count: u64,
    ) -> FatalResult<Vec<BlockWithExtractedData>> {
        let count = count.min(MAX_BLOCK_RANGE);
        let mut out = Vec::with_capacity(count as usize);
        for number in from..from.saturating_add(count) {
            let Some(hash) = self.tx().read_block_hash_by_number(shard, number)? else {
                break;
            };
            match self.block_with_extracted_data(shard, &hash)? {
                Some(data) => out.push(data),
                None => break,
            }
        }
        Ok(out)
    }

    /// An included in-transaction, found through the location index.
    pub fn in_transaction_by_hash(&self, shard: ShardId, txn_hash: &Hash) -> FatalResult<Option<Transaction>> {
        let Some(loc) = self.tx().read_in_tx_location(shard, txn_hash)? else {
            return Ok(None);
        };
        let Some(block) = self.block(shard, &loc.block_hash)? else {
            return Ok(None);
        };
        Ok(self
            .in_transactions(shard, &block, &loc.block_hash)?
            .get(loc.index as usize)
            .cloned())
    }

    /// Receipt of an included transaction with its error message, if any.
    pub fn receipt_by_hash(&self, shard: ShardId, txn_hash: &Hash) -> FatalResult<Option<ReceiptWithError>> {
        let tx = self.tx();
        let Some(loc) = tx.read_in_tx_location(shard, txn_hash)? else {
            return Ok(None);
        };
        let Some(block) = self.block(shard, &loc.block_hash)? else {
            return Ok(None);
        };
        let receipts = self.receipts(shard, &block, &loc.block_hash)?;
        let Some(receipt) = receipts.get(loc.index as usize).cloned() else {
            return Ok(None);
        };
        Ok(Some(ReceiptWithError {
            receipt,
            block_hash: loc.block_hash,
            error: tx.read_error(shard, txn_hash)?,
        }))
    }
}

impl std::fmt::Debug for StateAccessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateAccessor").finish_non_exhaustive()
    }
}
