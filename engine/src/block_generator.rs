//! Turning a proposal into a committed block.
//!
//! A [`BlockGenerator`] owns one read-write storage transaction for the
//! lifetime of one block. It replays the proposal through an
//! [`ExecutionState`], builds the block, writes the lookup indices and
//! commits everything at once. Dropping the generator (or calling
//! [`BlockGenerator::rollback`]) discards the transaction.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use meridian_primitives::{
    ChainId, FatalError, FatalResult, Gas, Hash, ShardId, Transaction, Value,
    DEFAULT_CHAIN_ID, DEFAULT_GAS_LIMIT, DEFAULT_GAS_PRICE, ZERO_HASH,
};
use meridian_storage::{create_rw_tx, Database, Tx, TxLocation};

use crate::config::{ConfigAccessor, ParamGasPrice};
use crate::execution_state::{BlockGenerationResult, ExecutionParams, ExecutionState};
use crate::failure_receipts::FailureReceiptCache;
use crate::fee::{FeeCalculator, MainFeeCalculator};
use crate::payer::Payer;
use crate::proposal::Proposal;
use crate::result::ExecutionResult;
use crate::validation::validate_external_transaction;
use crate::vm::{Interpreter, Vm};
use crate::zerostate::ZeroStateConfig;

#[derive(Clone)]
pub struct BlockGeneratorParams {
    pub shard_id: ShardId,
    pub n_shards: u32,
    pub chain_id: ChainId,
    pub gas_limit: Gas,
    pub fee_calculator: Arc<dyn FeeCalculator>,
    pub vm: Arc<dyn Vm>,
}

impl BlockGeneratorParams {
    pub fn new(shard_id: ShardId, n_shards: u32) -> Self {
        Self {
            shard_id,
            n_shards,
            chain_id: DEFAULT_CHAIN_ID,
            gas_limit: DEFAULT_GAS_LIMIT,
            fee_calculator: Arc::new(MainFeeCalculator::new()),
            vm: Arc::new(Interpreter::new()),
        }
    }

    /// Execution parameters for a state on top of `prev_block`.
    pub fn execution_params(
        &self,
        prev_block: Option<meridian_primitives::Block>,
        config: ConfigAccessor,
        read_only: bool,
    ) -> ExecutionParams {
        ExecutionParams {
            prev_block,
            config,
            fee_calculator: Arc::clone(&self.fee_calculator),
            vm: Arc::clone(&self.vm),
            gas_limit: self.gas_limit,
            chain_id: self.chain_id,
            read_only,
        }
    }

    /// Execution state on top of the shard's last block in `tx`.
    ///
    /// The config comes from the main-shard block the previous block points
    /// at, so every node replaying the block sees the same parameters. The
    /// main shard and the zero state use the latest main-shard block.
    pub fn open_state(&self, tx: Tx, read_only: bool) -> FatalResult<ExecutionState> {
        let shard = self.shard_id;
        let prev_block = tx.read_last_block(shard)?.map(|(block, _)| block);
        let main_hash = match &prev_block {
            Some(block) if !shard.is_main() => block.main_shard_hash,
            _ => ZERO_HASH,
        };
        let config = ConfigAccessor::for_main_block(&tx, &main_hash, read_only || !shard.is_main())?;
        ExecutionState::new(tx, shard, self.execution_params(prev_block, config, read_only))
    }
}

impl std::fmt::Debug for BlockGeneratorParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockGeneratorParams")
            .field("shard_id", &self.shard_id)
            .field("n_shards", &self.n_shards)
            .field("chain_id", &self.chain_id)
            .field("gas_limit", &self.gas_limit)
            .finish_non_exhaustive()
    }
}

/// Per-block statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockCounters {
    pub internal_txns: u64,
    pub external_txns: u64,
    pub deploy_txns: u64,
    pub exec_txns: u64,
    pub coins_used: Value,
}

pub struct BlockGenerator {
    params: BlockGeneratorParams,
    db: Arc<dyn Database>,
    es: ExecutionState,
    counters: BlockCounters,
    failure_receipts: Option<FailureReceiptCache>,
    gas_prices: Option<Vec<Value>>,
    built: bool,
}

impl BlockGenerator {
    /// Open a read-write transaction and an execution state on top of the
    /// shard's last block.
    pub fn new(params: BlockGeneratorParams, db: Arc<dyn Database>) -> FatalResult<Self> {
        let es = params.open_state(create_rw_tx(&db), false)?;
        Ok(Self {
            params,
            db,
            es,
            counters: BlockCounters::default(),
            failure_receipts: None,
            gas_prices: None,
            built: false,
        })
    }

    /// Record dropped external transactions in `cache`.
    pub fn with_failure_receipts(mut self, cache: FailureReceiptCache) -> Self {
        self.failure_receipts = Some(cache);
        self
    }

    /// Publish `prices` instead of collecting them from the other shards.
    /// Used when replaying a main-shard block produced elsewhere.
    pub fn with_gas_prices(mut self, prices: Vec<Value>) -> Self {
        self.gas_prices = Some(prices);
        self
    }

    pub fn counters(&self) -> &BlockCounters {
        &self.counters
    }

    pub fn execution_state(&self) -> &ExecutionState {
        &self.es
    }

    /// Discard everything staged so far.
    pub fn rollback(self) {
        tracing::debug!(shard_id = %self.params.shard_id, "block generation rolled back");
        self.es.into_tx().rollback();
    }

    /// Build and commit block zero from `config`.
    pub fn generate_zero_state(mut self, config: &ZeroStateConfig) -> FatalResult<BlockGenerationResult> {
        let shard = self.params.shard_id;
        if !shard.is_main() {
            if let Some(main_hash) = self.es.tx().read_block_hash_by_number(ShardId::MAIN, 0)? {
                self.es.set_main_shard_hash(main_hash);
            }
        }
        self.es.generate_zero_state(config)?;
        self.built = true;
        let res = self.es.build_block(0)?;
        self.finalize(&res)?;
        tracing::info!(
            shard_id = %shard,
            block_hash = %hex::encode(res.block_hash),
            "zero state generated"
        );
        Ok(res)
    }

    /// Replay `proposal` and commit the resulting block.
    pub fn generate_block(mut self, proposal: &Proposal) -> FatalResult<BlockGenerationResult> {
        let res = self.build_block(proposal)?;
        self.finalize(&res)?;
        Ok(res)
    }

    /// Replay `proposal` and build the block without persisting it. Follow
    /// with [`finalize`](Self::finalize) to commit, or drop to discard.
    pub fn build_block(&mut self, proposal: &Proposal) -> FatalResult<BlockGenerationResult> {
        let shard = self.params.shard_id;
        let _span = tracing::debug_span!("build_block", shard_id = %shard).entered();

        if self.built {
            return Err(FatalError::invariant("block generator already built a block"));
        }
        if proposal.prev_block_hash != self.es.prev_block() {
            return Err(FatalError::invariant(format!(
                "proposal builds on {}, last block is {}",
                hex::encode(proposal.prev_block_hash),
                hex::encode(self.es.prev_block())
            )));
        }
        let block_id = proposal
            .prev_block_id
            .checked_add(1)
            .ok_or_else(|| FatalError::invariant("block number overflow"))?;
        if block_id != self.es.block_number() {
            return Err(FatalError::invariant(format!(
                "proposal is for block {block_id}, state expects {}",
                self.es.block_number()
            )));
        }
        self.built = true;

        if shard.is_main() {
            self.update_gas_prices()?;
        }
        self.es.set_main_shard_hash(proposal.main_shard_hash);

        for txn in &proposal.internal_txns {
            self.handle_txn(txn, true)?;
        }
        for txn in &proposal.external_txns {
            self.handle_txn(txn, false)?;
        }
        for txn in &proposal.forward_txns {
            self.es.append_forward_transaction(txn.clone());
        }
        for (i, hash) in proposal.shard_hashes.iter().enumerate() {
            self.es.set_child_shard_block(ShardId(i as u32 + 1), *hash);
        }

        self.es.tx_mut().write_collator_state(shard, &proposal.collator_state);
        self.es.build_block(block_id)
    }

    /// Latest base fee of every shard, falling back to the default price for
    /// shards without blocks.
    pub fn collect_gas_prices(&self) -> FatalResult<Vec<Value>> {
        (0..self.params.n_shards)
            .map(|shard| {
                Ok(self
                    .es
                    .tx()
                    .read_last_block(ShardId(shard))?
                    .map(|(block, _)| block.base_fee)
                    .unwrap_or(DEFAULT_GAS_PRICE))
            })
            .collect()
    }

    fn update_gas_prices(&mut self) -> FatalResult<()> {
        let shards = match self.gas_prices.take() {
            Some(prices) => prices,
            None => self.collect_gas_prices()?,
        };
        tracing::debug!(prices = ?shards, "publishing gas prices");
        self.es.config_mut().set(&ParamGasPrice { shards })?;
        self.es.set_base_fee(DEFAULT_GAS_PRICE);
        Ok(())
    }

    fn handle_txn(&mut self, txn: &Transaction, internal: bool) -> FatalResult<()> {
        let hash = self.es.add_in_transaction(txn.clone());
        let res = if internal {
            self.counters.internal_txns += 1;
            match self.es.validate_internal_transaction(txn) {
                Ok(()) => self.es.handle_transaction(txn, &Payer::for_transaction(txn)),
                Err(err) => {
                    tracing::warn!(
                        txn_hash = %hex::encode(hash),
                        error = %err,
                        "internal transaction failed validation"
                    );
                    ExecutionResult::new().with_error(err)
                }
            }
        } else {
            self.counters.external_txns += 1;
            let verified = validate_external_transaction(&mut self.es, txn);
            if verified.failed() {
                verified
            } else {
                let mut res = self.es.handle_transaction(txn, &Payer::for_account(txn));
                res.add_used(verified.gas_used);
                res
            }
        };
        if txn.is_deploy() {
            self.counters.deploy_txns += 1;
        } else {
            self.counters.exec_txns += 1;
        }

        let res = res.into_fatal()?;
        self.counters.coins_used = self.counters.coins_used.saturating_add(res.coins_used());
        self.handle_result(txn, hash, &res);
        Ok(())
    }

    /// External transactions that burned nothing leave no trace in the block.
    fn handle_result(&mut self, txn: &Transaction, hash: Hash, res: &ExecutionResult) {
        if txn.is_external() && res.gas_used == Gas::ZERO && res.failed() {
            tracing::debug!(
                txn_hash = %hex::encode(hash),
                txn_to = %txn.to,
                status = %res.status(),
                "external transaction dropped"
            );
            self.es.drop_in_transaction();
            if let Some(cache) = &self.failure_receipts {
                cache.add(hash, res);
            }
            return;
        }
        if let Some(err) = &res.error {
            tracing::debug!(
                txn_hash = %hex::encode(hash),
                txn_to = %txn.to,
                error = %err,
                "transaction failed"
            );
        }
        self.es.add_receipt(res);
    }

    /// Persist a block built by this generator: the block, its indices and
    /// the collator state in one storage transaction, then the timestamp.
    pub fn finalize(mut self, res: &BlockGenerationResult) -> FatalResult<()> {
        let shard = self.params.shard_id;
        self.es.commit_block(res)?;

        let mut tx = self.es.into_tx();
        postprocess(&mut tx, shard, res);
        tx.commit()?;

        let mut tx = create_rw_tx(&self.db);
        tx.write_block_timestamp(shard, &res.block_hash, unix_now());
        tx.commit()?;

        let counters = &self.counters;
        tracing::info!(
            shard_id = %shard,
            block_number = res.block.id,
            block_hash = %hex::encode(res.block_hash),
            internal = counters.internal_txns,
            external = counters.external_txns,
            deploys = counters.deploy_txns,
            executions = counters.exec_txns,
            coins_used = %counters.coins_used,
            out_txns = res.out_txns.len(),
            "block committed"
        );
        Ok(())
    }
}

/// Number and location indices of a freshly built block.
fn postprocess(tx: &mut Tx, shard: ShardId, res: &BlockGenerationResult) {
    tx.write_block_hash_by_number(shard, res.block.id, &res.block_hash);
    tx.write_last_block_hash(shard, &res.block_hash);
    for (index, hash) in res.in_txn_hashes.iter().enumerate() {
        let loc = TxLocation {
            block_hash: res.block_hash,
            index: index as u64,
        };
        tx.write_in_tx_location(shard, hash, loc);
    }
    for (index, hash) in res.out_txn_hashes.iter().enumerate() {
        let loc = TxLocation {
            block_hash: res.block_hash,
            index: index as u64,
        };
        tx.write_out_tx_location(shard, hash, loc);
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl std::fmt::Debug for BlockGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockGenerator")
            .field("params", &self.params)
            .field("counters", &self.counters)
            .finish_non_exhaustive()
    }
}
