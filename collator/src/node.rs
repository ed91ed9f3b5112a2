//! All shards of one node over a shared database.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use meridian_engine::FailureReceiptCache;
use meridian_primitives::{BlockWithExtractedData, Hash, Receipt, ShardId, Transaction};
use meridian_storage::Database;

use crate::error::{PoolError, ValidatorError};
use crate::params::CollatorParams;
use crate::pool::MemPool;
use crate::scheduler::Scheduler;
use crate::syncer::BlockTopic;
use crate::validator::Validator;

const TOPIC_CAPACITY: usize = 64;

struct Shard {
    validator: Arc<Validator>,
    pool: Arc<MemPool>,
    topic: BlockTopic,
}

pub struct Node {
    params: CollatorParams,
    shards: Vec<Shard>,
}

impl Node {
    /// Set up a validator, a pool and a block topic for every shard.
    /// `params.shard_id` is ignored.
    pub fn new(params: CollatorParams, db: Arc<dyn Database>) -> Self {
        let shards = (0..params.n_shards)
            .map(|i| {
                let shard_params = params.for_shard(ShardId(i));
                let pool = Arc::new(MemPool::new(ShardId(i), params.pool_capacity));
                let failure_receipts = FailureReceiptCache::new(params.failure_receipts_capacity);
                let validator = Arc::new(Validator::new(
                    shard_params,
                    Arc::clone(&db),
                    pool.clone(),
                    failure_receipts,
                ));
                let (topic, _) = broadcast::channel(TOPIC_CAPACITY);
                Shard { validator, pool, topic }
            })
            .collect();
        Self { params, shards }
    }

    pub fn params(&self) -> &CollatorParams {
        &self.params
    }

    /// Generate the zero state of every shard that has none, main shard
    /// first: other shards read their config from it.
    pub fn init_zero_states(&self) -> Result<(), ValidatorError> {
        for shard in &self.shards {
            if let Some(res) = shard.validator.generate_zero_state()? {
                tracing::info!(
                    shard_id = %shard.validator.shard_id(),
                    block_hash = %hex::encode(res.block_hash),
                    "zero state committed"
                );
            }
        }
        Ok(())
    }

    pub fn validator(&self, shard: ShardId) -> Option<&Arc<Validator>> {
        self.shards.get(shard.0 as usize).map(|s| &s.validator)
    }

    pub fn pool(&self, shard: ShardId) -> Option<&Arc<MemPool>> {
        self.shards.get(shard.0 as usize).map(|s| &s.pool)
    }

    /// Topic the blocks produced for `shard` are published on.
    pub fn block_topic(&self, shard: ShardId) -> Option<&BlockTopic> {
        self.shards.get(shard.0 as usize).map(|s| &s.topic)
    }

    /// Subscribe to the blocks produced for `shard`.
    pub fn subscribe_blocks(&self, shard: ShardId) -> Option<broadcast::Receiver<Arc<BlockWithExtractedData>>> {
        self.shards.get(shard.0 as usize).map(|s| s.topic.subscribe())
    }

    /// Queue an external transaction in the pool of its destination shard.
    pub fn submit(&self, txn: Transaction) -> Result<bool, PoolError> {
        let dest = txn.to.shard_id();
        let shard = self.shards.get(dest.0 as usize).ok_or(PoolError::UnknownShard(dest))?;
        shard.pool.add(txn)
    }

    /// Receipt of a transaction that failed before reaching a block.
    pub fn failure_receipt(&self, shard: ShardId, txn_hash: &Hash) -> Option<Receipt> {
        self.validator(shard)?.failure_receipts().get(txn_hash)
    }

    /// Start a collator per shard. They stop when `cancel` fires.
    pub fn spawn_collators(&self, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        self.shards
            .iter()
            .map(|shard| {
                let scheduler = Scheduler::new(Arc::clone(&shard.validator)).with_topic(shard.topic.clone());
                tokio::spawn(scheduler.run(cancel.clone()))
            })
            .collect()
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("n_shards", &self.params.n_shards)
            .field("topology", &self.params.topology)
            .finish_non_exhaustive()
    }
}
