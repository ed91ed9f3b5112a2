//! Assembling the next block's proposal.
//!
//! The proposer simulates every candidate transaction on a read-only
//! snapshot so it only proposes what fits the block's limits. Nothing it
//! does is persisted: the execution state and its storage transaction are
//! dropped once the proposal is returned.

use std::sync::Arc;

use meridian_engine::tries::fetch_indexed;
use meridian_engine::{validate_external_transaction, ExecutionState, FailureReceiptCache, Payer, Proposal};
use meridian_primitives::{
    Block, FatalError, Hash, ShardId, Transaction, DEFAULT_GAS_PRICE, ZERO_HASH,
};
use meridian_storage::{create_ro_tx, Database};

use crate::error::ProposerError;
use crate::params::CollatorParams;
use crate::pool::{DiscardReason, TxnPool};
use crate::topology::ShardTopology;

pub struct Proposer<'a> {
    params: &'a CollatorParams,
    topology: &'a dyn ShardTopology,
    pool: &'a dyn TxnPool,
    failure_receipts: &'a FailureReceiptCache,
}

/// One proposal under construction.
struct Collation {
    es: ExecutionState,
    proposal: Proposal,
}

impl<'a> Proposer<'a> {
    pub fn new(
        params: &'a CollatorParams,
        topology: &'a dyn ShardTopology,
        pool: &'a dyn TxnPool,
        failure_receipts: &'a FailureReceiptCache,
    ) -> Self {
        Self {
            params,
            topology,
            pool,
            failure_receipts,
        }
    }

    fn shard_id(&self) -> ShardId {
        self.params.shard_id
    }

    /// Collect neighbor and pool transactions into a proposal on top of the
    /// shard's current head.
    pub fn generate_proposal(&self, db: &Arc<dyn Database>) -> Result<Proposal, ProposerError> {
        let shard = self.shard_id();
        let _span = tracing::debug_span!("proposer", shard_id = %shard).entered();

        let block_params = self.params.block_generator_params();
        let mut es = block_params.open_state(create_ro_tx(db), true)?;
        let (prev_block, prev_hash) = es
            .tx()
            .read_last_block(shard)?
            .ok_or(ProposerError::NoBlocks(shard))?;
        if shard.is_main() {
            es.set_base_fee(DEFAULT_GAS_PRICE);
        }

        let mut c = Collation {
            es,
            proposal: Proposal {
                prev_block_id: prev_block.id,
                prev_block_hash: prev_hash,
                ..Default::default()
            },
        };
        tracing::trace!(block_number = prev_block.id + 1, "collating");

        self.fetch_last_block_hashes(&mut c)?;
        self.handle_transactions_from_neighbors(&mut c)?;
        self.handle_transactions_from_pool(&mut c)?;

        if c.proposal.is_empty() {
            tracing::trace!("no transactions collected");
        } else {
            tracing::debug!(
                internal = c.proposal.internal_txns.len(),
                external = c.proposal.external_txns.len(),
                forward = c.proposal.forward_txns.len(),
                gas_used = %c.es.gas_used(),
                "transactions collected"
            );
        }
        Ok(c.proposal)
    }

    /// The main shard links the latest block of every other shard; other
    /// shards link the latest main-shard block.
    fn fetch_last_block_hashes(&self, c: &mut Collation) -> Result<(), ProposerError> {
        let tx = c.es.tx();
        if self.shard_id().is_main() {
            c.proposal.shard_hashes = (1..self.params.n_shards)
                .map(|i| Ok(tx.read_last_block_hash(ShardId(i))?.unwrap_or(ZERO_HASH)))
                .collect::<Result<_, ProposerError>>()?;
        } else {
            c.proposal.main_shard_hash = tx.read_last_block_hash(ShardId::MAIN)?.unwrap_or(ZERO_HASH);
        }
        Ok(())
    }

    fn within_limits(&self, c: &Collation) -> bool {
        c.es.gas_used() < self.params.internal_gas_limit()
            && c.proposal.internal_txns.len() < self.params.max_internal_transactions_in_block
            && c.proposal.forward_txns.len() < self.params.max_forward_transactions_in_block
    }

    /// Drain the outbound queues of every neighbor from the stored cursor.
    ///
    /// A consumed message moves the cursor past it before the limits are
    /// checked, so a message is never taken twice. The cursor rolls to the
    /// next block only after the current block is fully drained, and never
    /// past the neighbor's last block.
    fn handle_transactions_from_neighbors(&self, c: &mut Collation) -> Result<(), ProposerError> {
        let shard = self.shard_id();
        let mut state = c.es.tx().read_collator_state(shard)?;

        for neighbor_id in self.topology.neighbors(shard, self.params.n_shards, true) {
            let pos = state.neighbor_position(neighbor_id);
            let Some((last_block, _)) = c.es.tx().read_last_block(neighbor_id)? else {
                continue;
            };

            while self.within_limits(c) {
                let neighbor = &mut state.neighbors[pos];
                if last_block.id < neighbor.block_number {
                    break;
                }
                let Some((block, _)) = c.es.tx().read_block_by_number(neighbor_id, neighbor.block_number)? else {
                    break;
                };

                let mut stop = false;
                while neighbor.transaction_index < block.out_transactions_num {
                    let txn = fetch_out_transaction(c, neighbor_id, &block, neighbor.transaction_index)?;
                    let dest = txn.to.shard_id();
                    if dest == shard {
                        self.handle_internal(c, txn)?;
                        neighbor.transaction_index += 1;
                        if !self.within_limits(c) {
                            stop = true;
                            break;
                        }
                    } else if shard != neighbor_id && self.topology.should_propagate(neighbor_id, shard, dest) {
                        if !self.within_limits(c) {
                            stop = true;
                            break;
                        }
                        c.proposal.forward_txns.push(txn);
                        neighbor.transaction_index += 1;
                    } else {
                        neighbor.transaction_index += 1;
                    }
                }

                if neighbor.transaction_index == block.out_transactions_num {
                    neighbor.block_number += 1;
                    neighbor.transaction_index = 0;
                }
                if stop {
                    break;
                }
            }
        }

        tracing::trace!(
            internal = c.proposal.internal_txns.len(),
            forward = c.proposal.forward_txns.len(),
            gas_used = %c.es.gas_used(),
            "neighbor intake done"
        );
        c.proposal.collator_state = state;
        Ok(())
    }

    /// Execute an internal transaction addressed to this shard. Invalid
    /// ones are still proposed: the block records their failure.
    fn handle_internal(&self, c: &mut Collation, txn: Transaction) -> Result<(), ProposerError> {
        let hash = c.es.add_in_transaction(txn.clone());
        match c.es.validate_internal_transaction(&txn) {
            Ok(()) => execute(c, &txn, hash, &Payer::for_transaction(&txn))?,
            Err(err) => {
                tracing::warn!(txn_hash = %hex::encode(hash), error = %err, "invalid internal transaction");
            }
        }
        c.proposal.internal_txns.push(txn);
        Ok(())
    }

    fn handle_transactions_from_pool(&self, c: &mut Collation) -> Result<(), ProposerError> {
        let shard = self.shard_id();
        let candidates = self.pool.peek(self.params.max_txns_from_pool)?;

        let mut duplicates = Vec::new();
        let mut unverified = Vec::new();
        for txn in candidates {
            let hash = txn.hash();
            if c.es.tx().read_in_tx_location(shard, &hash)?.is_some() {
                tracing::trace!(txn_hash = %hex::encode(hash), "transaction already in the chain, dropping");
                duplicates.push(hash);
                continue;
            }

            let verified = validate_external_transaction(&mut c.es, &txn).into_fatal()?;
            if verified.failed() {
                tracing::info!(
                    txn_hash = %hex::encode(hash),
                    txn_to = %txn.to,
                    status = %verified.status(),
                    "external transaction failed validation, dropping"
                );
                self.failure_receipts.add(hash, &verified);
                unverified.push(hash);
                continue;
            }

            let in_hash = c.es.add_in_transaction(txn.clone());
            execute(c, &txn, in_hash, &Payer::for_account(&txn))?;
            if c.es.gas_used() > self.params.max_gas_in_block {
                break;
            }
            c.proposal.external_txns.push(txn);
        }

        self.discard(&duplicates, DiscardReason::DuplicateHash);
        self.discard(&unverified, DiscardReason::Unverified);
        Ok(())
    }

    fn discard(&self, hashes: &[Hash], reason: DiscardReason) {
        if hashes.is_empty() {
            return;
        }
        tracing::debug!(count = hashes.len(), %reason, "removing transactions from the pool");
        if let Err(err) = self.pool.discard(hashes, reason) {
            tracing::error!(count = hashes.len(), %reason, error = %err, "failed to remove transactions from the pool");
        }
    }
}

fn fetch_out_transaction(
    c: &Collation,
    shard: ShardId,
    block: &Block,
    index: u64,
) -> Result<Transaction, ProposerError> {
    fetch_indexed(c.es.tx(), block.out_transactions_root, index)?.ok_or_else(|| {
        FatalError::not_found(format!(
            "outbound transaction {index} of block {} on shard {shard}",
            block.id
        ))
        .into()
    })
}

/// Run `txn` against the proposal's state. A failed transaction is still
/// proposed; only fatal errors abort the proposal.
fn execute(c: &mut Collation, txn: &Transaction, hash: Hash, payer: &Payer) -> Result<(), ProposerError> {
    let res = c.es.handle_transaction(txn, payer).into_fatal()?;
    if let Some(err) = &res.error {
        tracing::debug!(
            txn_hash = %hex::encode(hash),
            error = %err,
            "transaction failed, it is still proposed"
        );
    }
    assert_eq!(hash, txn.hash(), "transaction hash changed during handling");
    Ok(())
}

impl std::fmt::Debug for Proposer<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proposer")
            .field("shard_id", &self.params.shard_id)
            .finish_non_exhaustive()
    }
}
