//! Block verification and insertion for one shard.
//!
//! The [`Validator`] owns the shard's head: every block that lands in
//! storage goes through it, whether built locally from a proposal or
//! replayed from a peer. Insertions are serialized; subscribers learn the
//! number of every inserted block.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use meridian_engine::{
    BlockGenerationResult, BlockGenerator, FailureReceiptCache, Proposal, StateAccessor,
};
use meridian_primitives::{
    Block, BlockNumber, BlockWithExtractedData, CollatorState, Hash, ShardId, Transaction, ZERO_HASH,
};
use meridian_storage::{create_ro_tx, Database};

use crate::error::{ProposerError, ValidatorError};
use crate::params::CollatorParams;
use crate::pool::TxnPool;
use crate::proposer::Proposer;

const SUBSCRIPTION_CAPACITY: usize = 64;

pub struct Validator {
    params: CollatorParams,
    db: Arc<dyn Database>,
    pool: Arc<dyn TxnPool>,
    failure_receipts: FailureReceiptCache,
    accessor: Arc<StateAccessor>,
    head: RwLock<Option<(Block, Hash)>>,
    insert_lock: Mutex<()>,
    notifier: broadcast::Sender<BlockNumber>,
}

impl Validator {
    pub fn new(
        params: CollatorParams,
        db: Arc<dyn Database>,
        pool: Arc<dyn TxnPool>,
        failure_receipts: FailureReceiptCache,
    ) -> Self {
        let (notifier, _) = broadcast::channel(SUBSCRIPTION_CAPACITY);
        let accessor = Arc::new(StateAccessor::new(Arc::clone(&db)));
        Self {
            params,
            db,
            pool,
            failure_receipts,
            accessor,
            head: RwLock::new(None),
            insert_lock: Mutex::new(()),
            notifier,
        }
    }

    pub fn shard_id(&self) -> ShardId {
        self.params.shard_id
    }

    pub fn params(&self) -> &CollatorParams {
        &self.params
    }

    pub fn db(&self) -> &Arc<dyn Database> {
        &self.db
    }

    pub fn pool(&self) -> &Arc<dyn TxnPool> {
        &self.pool
    }

    pub fn failure_receipts(&self) -> &FailureReceiptCache {
        &self.failure_receipts
    }

    /// Cached read access to this node's blocks.
    pub fn accessor(&self) -> &Arc<StateAccessor> {
        &self.accessor
    }

    /// A stored block with everything a peer needs to replay it.
    pub fn block_with_extracted_data(&self, hash: &Hash) -> Result<Option<BlockWithExtractedData>, ValidatorError> {
        Ok(self.accessor.block_with_extracted_data(self.shard_id(), hash)?)
    }

    /// The shard's last block and its hash.
    pub fn last_block(&self) -> Result<(Block, Hash), ValidatorError> {
        if let Some(head) = self.head.read().as_ref() {
            return Ok(head.clone());
        }
        let head = create_ro_tx(&self.db)
            .read_last_block(self.shard_id())?
            .ok_or(ValidatorError::NoBlocks(self.shard_id()))?;
        *self.head.write() = Some(head.clone());
        Ok(head)
    }

    /// Generate and commit the zero state unless the shard already has
    /// blocks. Returns the generated block.
    pub fn generate_zero_state(&self) -> Result<Option<BlockGenerationResult>, ValidatorError> {
        let _guard = self.insert_lock.lock();
        if create_ro_tx(&self.db).read_last_block_hash(self.shard_id())?.is_some() {
            return Ok(None);
        }
        tracing::info!(shard_id = %self.shard_id(), "generating zero state");
        let res = BlockGenerator::new(self.params.block_generator_params(), Arc::clone(&self.db))?
            .generate_zero_state(&self.params.zero_state)?;
        self.on_block_commit(&res, &[]);
        Ok(Some(res))
    }

    pub fn build_proposal(&self) -> Result<Proposal, ProposerError> {
        Proposer::new(
            &self.params,
            &self.params.topology,
            self.pool.as_ref(),
            &self.failure_receipts,
        )
        .generate_proposal(&self.db)
    }

    /// Build the block `proposal` describes without persisting it.
    pub fn build_block_by_proposal(&self, proposal: &Proposal) -> Result<BlockGenerationResult, ValidatorError> {
        self.is_valid_proposal(proposal)?;
        let mut generator = BlockGenerator::new(self.params.block_generator_params(), Arc::clone(&self.db))?;
        let res = generator.build_block(proposal)?;
        generator.rollback();
        Ok(res)
    }

    /// Check that `proposal` directly extends the current head.
    pub fn is_valid_proposal(&self, proposal: &Proposal) -> Result<(), ValidatorError> {
        let (head, head_hash) = self.last_block()?;
        let block_id = proposal.prev_block_id + 1;
        if block_id <= head.id {
            tracing::trace!(shard_id = %self.shard_id(), block_number = block_id, "old block");
            return Err(ValidatorError::OldBlock(block_id));
        }
        if block_id != head.id + 1 {
            tracing::debug!(
                shard_id = %self.shard_id(),
                block_number = block_id,
                head = head.id,
                "block is out of order"
            );
            return Err(ValidatorError::OutOfOrder {
                expected: head.id + 1,
                got: block_id,
            });
        }
        if head_hash != proposal.prev_block_hash {
            tracing::error!(
                shard_id = %self.shard_id(),
                last_block = ?head,
                last_hash = %hex::encode(head_hash),
                expected_last_hash = %hex::encode(proposal.prev_block_hash),
                "previous block hash mismatch"
            );
            return Err(ValidatorError::HashMismatch {
                expected: hex::encode(head_hash),
                got: hex::encode(proposal.prev_block_hash),
            });
        }
        Ok(())
    }

    /// Generate and commit the block of a locally built proposal, then
    /// evict its external transactions from the pool.
    pub fn insert_proposal(&self, proposal: &Proposal) -> Result<BlockGenerationResult, ValidatorError> {
        let _guard = self.insert_lock.lock();
        self.is_valid_proposal(proposal)?;
        let res = BlockGenerator::new(self.params.block_generator_params(), Arc::clone(&self.db))?
            .with_failure_receipts(self.failure_receipts.clone())
            .generate_block(proposal)?;
        self.on_block_commit(&res, &proposal.external_txns);
        Ok(res)
    }

    /// Re-execute a block received from a peer and insert it if the result
    /// is identical.
    pub fn replay_block(&self, data: &BlockWithExtractedData) -> Result<BlockGenerationResult, ValidatorError> {
        let _guard = self.insert_lock.lock();
        let shard = self.shard_id();
        let block_hash = data.block.hash(shard);
        tracing::trace!(
            shard_id = %shard,
            block_number = data.block.id,
            block_hash = %hex::encode(block_hash),
            "replaying block"
        );
        if data.block.id == 0 {
            return Err(ValidatorError::OldBlock(0));
        }

        let collator_state = create_ro_tx(&self.db).read_collator_state(shard)?;
        let proposal = proposal_from_block(shard, data, collator_state);
        self.is_valid_proposal(&proposal)?;

        let mut generator = BlockGenerator::new(self.params.block_generator_params(), Arc::clone(&self.db))?;
        if shard.is_main() && !data.gas_prices.is_empty() {
            generator = generator.with_gas_prices(data.gas_prices.clone());
        }
        let res = generator.build_block(&proposal)?;
        if let Err(err) = self.check_replayed(data, block_hash, &res) {
            generator.rollback();
            return Err(err);
        }
        generator.finalize(&res)?;
        self.on_block_commit(&res, &proposal.external_txns);
        Ok(res)
    }

    fn check_replayed(
        &self,
        expected: &BlockWithExtractedData,
        expected_hash: Hash,
        got: &BlockGenerationResult,
    ) -> Result<(), ValidatorError> {
        let mismatch = |what: &'static str, expected: String, got: String| -> Result<(), ValidatorError> {
            tracing::error!(shard_id = %self.shard_id(), %what, %expected, %got, "replayed block differs");
            Err(ValidatorError::ReplayMismatch { what, expected, got })
        };
        if got.block.out_transactions_root != expected.block.out_transactions_root {
            return mismatch(
                "out transactions root",
                hex::encode(expected.block.out_transactions_root),
                hex::encode(got.block.out_transactions_root),
            );
        }
        if got.out_txns.len() != expected.out_transactions.len() {
            return mismatch(
                "out transactions count",
                expected.out_transactions.len().to_string(),
                got.out_txns.len().to_string(),
            );
        }
        if got.block.config_root != expected.block.config_root {
            return mismatch(
                "config root",
                hex::encode(expected.block.config_root),
                hex::encode(got.block.config_root),
            );
        }
        if got.block_hash != expected_hash {
            tracing::error!(
                shard_id = %self.shard_id(),
                block_number = expected.block.id,
                expected = ?expected.block,
                got = ?got.block,
                "block hash mismatch"
            );
            return Err(ValidatorError::ReplayMismatch {
                what: "block hash",
                expected: hex::encode(expected_hash),
                got: hex::encode(got.block_hash),
            });
        }
        Ok(())
    }

    /// Pool eviction follows the commit; the two are not atomic.
    fn on_block_commit(&self, res: &BlockGenerationResult, external_txns: &[Transaction]) {
        *self.head.write() = Some((res.block.clone(), res.block_hash));
        if !external_txns.is_empty() {
            if let Err(err) = self.pool.on_committed(external_txns) {
                tracing::warn!(
                    shard_id = %self.shard_id(),
                    count = external_txns.len(),
                    error = %err,
                    "failed to remove committed transactions from the pool"
                );
            }
        }
        // No subscribers is fine.
        let _ = self.notifier.send(res.block.id);
    }

    /// Numbers of blocks inserted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<BlockNumber> {
        self.notifier.subscribe()
    }

    /// Whether block `hash` of this shard is stored.
    pub fn has_block(&self, hash: &Hash) -> Result<bool, ValidatorError> {
        if *hash == ZERO_HASH {
            return Ok(true);
        }
        if let Some((_, head_hash)) = self.head.read().as_ref() {
            if head_hash == hash {
                return Ok(true);
            }
        }
        Ok(create_ro_tx(&self.db).read_block(self.shard_id(), hash)?.is_some())
    }

    /// Wait until block `hash` is stored, re-checking on every insertion
    /// and giving up after the configured timeout.
    pub async fn wait_for_block(&self, hash: &Hash, cancel: &CancellationToken) -> Result<(), ValidatorError> {
        let mut blocks = self.subscribe();
        if self.has_block(hash)? {
            return Ok(());
        }
        let timeout = tokio::time::sleep(self.params.timeout());
        tokio::pin!(timeout);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(ValidatorError::Cancelled),
                received = blocks.recv() => {
                    if let Err(broadcast::error::RecvError::Closed) = received {
                        return Err(ValidatorError::Cancelled);
                    }
                    if self.has_block(hash)? {
                        return Ok(());
                    }
                }
                _ = &mut timeout => {
                    if self.has_block(hash)? {
                        return Ok(());
                    }
                    return Err(ValidatorError::Timeout(hex::encode(hash)));
                }
            }
        }
    }
}

/// The proposal a received block was built from. Forwarded transactions are
/// the outbound ones that did not originate on this shard.
fn proposal_from_block(
    shard: ShardId,
    data: &BlockWithExtractedData,
    collator_state: CollatorState,
) -> Proposal {
    let (internal_txns, external_txns) = data
        .in_transactions
        .iter()
        .cloned()
        .partition(Transaction::is_internal);
    let forward_txns = data
        .out_transactions
        .iter()
        .filter(|txn| txn.from.shard_id() != shard)
        .cloned()
        .collect();
    Proposal {
        prev_block_id: data.block.id - 1,
        prev_block_hash: data.block.prev_block,
        collator_state,
        main_shard_hash: data.block.main_shard_hash,
        shard_hashes: data.child_blocks.clone(),
        internal_txns,
        external_txns,
        forward_txns,
    }
}

impl std::fmt::Debug for Validator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Validator")
            .field("shard_id", &self.params.shard_id)
            .field("head", &self.head.read().as_ref().map(|(b, _)| b.id))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_primitives::{Address, TransactionFlags};

    #[test]
    fn test_proposal_from_block_splits_transactions() {
        let shard = ShardId(1);
        let local = Address::from_shard_and_hash(shard, &[1u8; 32]);
        let remote = Address::from_shard_and_hash(ShardId(2), &[2u8; 32]);
        let internal = Transaction {
            flags: TransactionFlags::new(TransactionFlags::INTERNAL),
            from: remote,
            to: local,
            ..Default::default()
        };
        let external = Transaction {
            to: local,
            seqno: 4,
            ..Default::default()
        };
        let forwarded = Transaction {
            flags: TransactionFlags::new(TransactionFlags::INTERNAL),
            from: remote,
            to: Address::from_shard_and_hash(ShardId(3), &[3u8; 32]),
            ..Default::default()
        };
        let produced = Transaction {
            flags: TransactionFlags::new(TransactionFlags::INTERNAL),
            from: local,
            to: remote,
            ..Default::default()
        };
        let data = BlockWithExtractedData {
            block: Block {
                id: 5,
                prev_block: [9u8; 32],
                ..Default::default()
            },
            in_transactions: vec![internal.clone(), external.clone()],
            out_transactions: vec![forwarded.clone(), produced],
            ..Default::default()
        };

        let proposal = proposal_from_block(shard, &data, Default::default());
        assert_eq!(proposal.prev_block_id, 4);
        assert_eq!(proposal.prev_block_hash, [9u8; 32]);
        assert_eq!(proposal.internal_txns, vec![internal]);
        assert_eq!(proposal.external_txns, vec![external]);
        assert_eq!(proposal.forward_txns, vec![forwarded]);
    }
}
