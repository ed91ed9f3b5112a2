//! Mutable state of one shard while a block is being built.
//!
//! An [`ExecutionState`] owns the storage transaction, the account cache and
//! the journal. Transactions are handled one at a time through
//! [`ExecutionState::handle_transaction`]; every mutation is journaled so a
//! failed transaction can be rolled back exactly. [`ExecutionState::build_block`]
//! folds the accumulated changes into tries and a block header.

mod build;
mod handle;
mod host;

pub use build::BlockGenerationResult;

use std::collections::BTreeMap;
use std::sync::Arc;

use meridian_primitives::{
    Address, AsyncContext, Block, BlockNumber, ChainId, FatalError, FatalResult, Gas, Hash,
    MerkleTrie, OutboundTransaction, Receipt, Seqno, ShardId, SmartContract, TokenId,
    Transaction, Value, DEFAULT_CHAIN_ID, DEFAULT_GAS_LIMIT, DEFAULT_GAS_PRICE, ZERO_HASH,
};
use meridian_primitives::{ErrorCode, ExecError, Log};
use meridian_storage::Tx;

use crate::account::AccountState;
use crate::config::ConfigAccessor;
use crate::fee::{FeeCalculator, MainFeeCalculator};
use crate::journal::{Journal, JournalEntry, RevisionId};
use crate::result::{ExecutionResult, TxnResult};
use crate::vm::{BlockContext, Interpreter, Vm};

/// Everything an execution state needs besides the storage transaction.
pub struct ExecutionParams {
    /// Block this one builds on; `None` for the zero state.
    pub prev_block: Option<Block>,
    pub config: ConfigAccessor,
    pub fee_calculator: Arc<dyn FeeCalculator>,
    pub vm: Arc<dyn Vm>,
    pub gas_limit: Gas,
    pub chain_id: ChainId,
    /// Simulation mode: the gas price ignores the max-fee cap. Unrelated to
    /// whether the storage transaction can be committed.
    pub read_only: bool,
}

impl Default for ExecutionParams {
    fn default() -> Self {
        Self {
            prev_block: None,
            config: ConfigAccessor::stub(),
            fee_calculator: Arc::new(MainFeeCalculator::new()),
            vm: Arc::new(Interpreter::new()),
            gas_limit: DEFAULT_GAS_LIMIT,
            chain_id: DEFAULT_CHAIN_ID,
            read_only: false,
        }
    }
}

pub struct ExecutionState {
    tx: Tx,
    shard_id: ShardId,
    chain_id: ChainId,
    gas_limit: Gas,
    read_only: bool,

    prev_block: Hash,
    prev_config_root: Hash,
    block_number: BlockNumber,
    main_shard_hash: Hash,
    child_shard_blocks: BTreeMap<ShardId, Hash>,

    base_fee: Value,
    gas_price: Value,
    gas_used: Gas,

    contract_trie: MerkleTrie,
    accounts: BTreeMap<Address, AccountState>,

    in_transactions: Vec<Transaction>,
    in_transaction_hashes: Vec<Hash>,
    in_transaction_hash: Hash,
    /// Keyed by the in-transaction that produced them; forwarded
    /// transactions live under [`ZERO_HASH`].
    out_transactions: BTreeMap<Hash, Vec<OutboundTransaction>>,
    logs: BTreeMap<Hash, Vec<Log>>,
    receipts: Vec<Receipt>,
    errors: BTreeMap<Hash, String>,
    transient: BTreeMap<(Address, Hash), Hash>,
    refund: u64,

    journal: Journal,
    revert_id: RevisionId,
    was_await_call: bool,
    txn_fee_credit: Value,

    in_tx_counts: BTreeMap<ShardId, u64>,
    out_tx_counts: BTreeMap<ShardId, u64>,

    config: ConfigAccessor,
    fee_calculator: Arc<dyn FeeCalculator>,
    vm: Arc<dyn Vm>,
}

impl ExecutionState {
    pub fn new(tx: Tx, shard_id: ShardId, params: ExecutionParams) -> FatalResult<Self> {
        let ExecutionParams {
            prev_block,
            config,
            fee_calculator,
            vm,
            gas_limit,
            chain_id,
            read_only,
        } = params;

        let mut es = Self {
            tx,
            shard_id,
            chain_id,
            gas_limit,
            read_only,
            prev_block: ZERO_HASH,
            prev_config_root: ZERO_HASH,
            block_number: 0,
            main_shard_hash: ZERO_HASH,
            child_shard_blocks: BTreeMap::new(),
            base_fee: DEFAULT_GAS_PRICE,
            gas_price: DEFAULT_GAS_PRICE,
            gas_used: Gas::ZERO,
            contract_trie: MerkleTrie::empty(),
            accounts: BTreeMap::new(),
            in_transactions: Vec::new(),
            in_transaction_hashes: Vec::new(),
            in_transaction_hash: ZERO_HASH,
            out_transactions: BTreeMap::new(),
            logs: BTreeMap::new(),
            receipts: Vec::new(),
            errors: BTreeMap::new(),
            transient: BTreeMap::new(),
            refund: 0,
            journal: Journal::new(),
            revert_id: 0,
            was_await_call: false,
            txn_fee_credit: Value::ZERO,
            in_tx_counts: BTreeMap::new(),
            out_tx_counts: BTreeMap::new(),
            config,
            fee_calculator,
            vm,
        };

        if let Some(prev) = prev_block {
            es.prev_block = prev.hash(shard_id);
            es.prev_config_root = prev.config_root;
            es.block_number = prev.id + 1;
            es.main_shard_hash = prev.main_shard_hash;
            es.base_fee = es.fee_calculator.calculate_base_fee(&prev);
            es.contract_trie = MerkleTrie::new(prev.smart_contracts_root);
            es.in_tx_counts = prev.in_tx_counts.iter().copied().collect();
            es.out_tx_counts = prev.out_tx_counts.iter().copied().collect();
        }
        es.gas_price = es.base_fee;

        tracing::debug!(
            shard_id = %shard_id,
            block_number = es.block_number,
            base_fee = %es.base_fee,
            read_only,
            "execution state created"
        );
        Ok(es)
    }

    // ── Block-level accessors ──

    pub fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    pub fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    pub fn block_number(&self) -> BlockNumber {
        self.block_number
    }

    pub fn prev_block(&self) -> Hash {
        self.prev_block
    }

    pub fn base_fee(&self) -> Value {
        self.base_fee
    }

    pub fn set_base_fee(&mut self, fee: Value) {
        self.base_fee = fee;
    }

    pub fn gas_price(&self) -> Value {
        self.gas_price
    }

    pub fn gas_used(&self) -> Gas {
        self.gas_used
    }

    pub fn main_shard_hash(&self) -> Hash {
        self.main_shard_hash
    }

    pub fn set_main_shard_hash(&mut self, hash: Hash) {
        self.main_shard_hash = hash;
    }

    pub fn set_child_shard_block(&mut self, shard: ShardId, hash: Hash) {
        self.child_shard_blocks.insert(shard, hash);
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn config(&self) -> &ConfigAccessor {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut ConfigAccessor {
        &mut self.config
    }

    pub fn tx(&self) -> &Tx {
        &self.tx
    }

    pub fn tx_mut(&mut self) -> &mut Tx {
        &mut self.tx
    }

    /// Give up the state and hand back its storage transaction.
    pub fn into_tx(self) -> Tx {
        self.tx
    }

    pub fn in_tx_count(&self, shard: ShardId) -> u64 {
        self.in_tx_counts.get(&shard).copied().unwrap_or(0)
    }

    pub fn out_tx_count(&self, shard: ShardId) -> u64 {
        self.out_tx_counts.get(&shard).copied().unwrap_or(0)
    }

    pub(crate) fn block_context(&self) -> BlockContext {
        BlockContext {
            shard_id: self.shard_id,
            block_number: self.block_number,
            gas_limit: self.gas_limit,
            base_fee: self.base_fee,
            gas_price: self.gas_price,
            prev_block: self.prev_block,
        }
    }

    // ── Accounts ──

    /// Pull `address` into the cache from the contract trie. Returns whether
    /// the account exists. Loading is not journaled.
    fn load_account(&mut self, address: Address) -> FatalResult<bool> {
        if self.accounts.contains_key(&address) {
            return Ok(true);
        }
        let contract = self
            .contract_trie
            .get_value::<SmartContract, _>(&self.tx, address.as_bytes())?;
        match contract {
            Some(contract) => {
                let account = AccountState::from_contract(&contract, &self.tx)?;
                self.accounts.insert(address, account);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Account, journal and store for a mutation, creating the account if needed.
    fn parts(&mut self, address: Address) -> FatalResult<(&mut AccountState, &mut Journal, &Tx)> {
        if !self.load_account(address)? {
            self.journal.append(JournalEntry::CreateAccount { address });
            self.accounts.insert(address, AccountState::new(address));
        }
        let account = self
            .accounts
            .get_mut(&address)
            .ok_or_else(|| FatalError::invariant(format!("account {address} vanished")))?;
        Ok((account, &mut self.journal, &self.tx))
    }

    pub fn account_exists(&mut self, address: Address) -> FatalResult<bool> {
        self.load_account(address)
    }

    /// Create an empty account at `address` unless one exists.
    pub fn create_account(&mut self, address: Address) -> FatalResult<()> {
        self.parts(address).map(|_| ())
    }

    pub fn balance(&mut self, address: Address) -> FatalResult<Value> {
        Ok(if self.load_account(address)? {
            self.accounts.get(&address).map(|a| a.balance()).unwrap_or_default()
        } else {
            Value::ZERO
        })
    }

    pub fn add_balance(&mut self, address: Address, amount: Value) -> TxnResult<()> {
        if amount.is_zero() {
            return Ok(());
        }
        let (account, journal, _) = self.parts(address)?;
        account.add_balance(journal, amount)?;
        Ok(())
    }

    pub fn sub_balance(&mut self, address: Address, amount: Value) -> TxnResult<()> {
        if amount.is_zero() {
            return Ok(());
        }
        if !self.load_account(address)? {
            return Err(ExecError::verbose(
                ErrorCode::InsufficientBalance,
                format!("{address} has no account"),
            )
            .into());
        }
        let (account, journal, _) = self.parts(address)?;
        account.sub_balance(journal, amount)?;
        Ok(())
    }

    pub fn code(&mut self, address: Address) -> FatalResult<Vec<u8>> {
        Ok(if self.load_account(address)? {
            self.accounts.get(&address).map(|a| a.code().to_vec()).unwrap_or_default()
        } else {
            Vec::new()
        })
    }

    pub fn set_code(&mut self, address: Address, code: Vec<u8>) -> FatalResult<()> {
        let (account, journal, _) = self.parts(address)?;
        account.set_code(journal, code);
        Ok(())
    }

    /// A contract exists once it has code.
    pub fn contract_exists(&mut self, address: Address) -> FatalResult<bool> {
        Ok(self.load_account(address)?
            && self.accounts.get(&address).is_some_and(|a| !a.code().is_empty()))
    }

    pub(crate) fn mark_new_contract(&mut self, address: Address) -> FatalResult<()> {
        let (account, journal, _) = self.parts(address)?;
        account.mark_new_contract(journal);
        Ok(())
    }

    pub fn seqno(&mut self, address: Address) -> FatalResult<Seqno> {
        Ok(if self.load_account(address)? {
            self.accounts.get(&address).map(|a| a.seqno()).unwrap_or(0)
        } else {
            0
        })
    }

    pub fn set_seqno(&mut self, address: Address, seqno: Seqno) -> FatalResult<()> {
        let (account, journal, _) = self.parts(address)?;
        account.set_seqno(journal, seqno);
        Ok(())
    }

    pub fn ext_seqno(&mut self, address: Address) -> FatalResult<Seqno> {
        Ok(if self.load_account(address)? {
            self.accounts.get(&address).map(|a| a.ext_seqno()).unwrap_or(0)
        } else {
            0
        })
    }

    pub fn set_ext_seqno(&mut self, address: Address, seqno: Seqno) -> FatalResult<()> {
        let (account, journal, _) = self.parts(address)?;
        account.set_ext_seqno(journal, seqno);
        Ok(())
    }

    pub fn get_state(&mut self, address: Address, key: &Hash) -> FatalResult<Hash> {
        if !self.load_account(address)? {
            return Ok(ZERO_HASH);
        }
        match self.accounts.get_mut(&address) {
            Some(account) => account.get_state(&self.tx, key),
            None => Ok(ZERO_HASH),
        }
    }

    pub fn set_state(&mut self, address: Address, key: Hash, value: Hash) -> FatalResult<()> {
        let (account, journal, store) = self.parts(address)?;
        account.set_state(journal, store, key, value)
    }

    pub fn token_balance(&mut self, address: Address, token: &TokenId) -> FatalResult<Value> {
        if !self.load_account(address)? {
            return Ok(Value::ZERO);
        }
        match self.accounts.get_mut(&address) {
            Some(account) => account.token_balance(&self.tx, token),
            None => Ok(Value::ZERO),
        }
    }

    pub fn tokens(&mut self, address: Address) -> FatalResult<BTreeMap<TokenId, Value>> {
        if !self.load_account(address)? {
            return Ok(BTreeMap::new());
        }
        match self.accounts.get(&address) {
            Some(account) => account.tokens(&self.tx),
            None => Ok(BTreeMap::new()),
        }
    }

    pub fn add_token(&mut self, address: Address, token: TokenId, amount: Value) -> TxnResult<()> {
        if amount.is_zero() {
            return Ok(());
        }
        let (account, journal, store) = self.parts(address)?;
        let balance = account.token_balance(store, &token)?;
        let new_balance = balance.checked_add(amount).ok_or_else(|| {
            ExecError::verbose(ErrorCode::BalanceOverflow, format!("token {token}: {balance} + {amount}"))
        })?;
        account.set_token_balance(journal, token, new_balance);
        Ok(())
    }

    pub fn sub_token(&mut self, address: Address, token: TokenId, amount: Value) -> TxnResult<()> {
        if amount.is_zero() {
            return Ok(());
        }
        let (account, journal, store) = self.parts(address)?;
        let balance = account.token_balance(store, &token)?;
        let new_balance = balance.checked_sub(amount).ok_or_else(|| {
            ExecError::verbose(
                ErrorCode::InsufficientBalance,
                format!("token {token}: {balance} < {amount}"),
            )
        })?;
        account.set_token_balance(journal, token, new_balance);
        Ok(())
    }

    pub fn set_async_context(
        &mut self,
        address: Address,
        request_id: u64,
        context: AsyncContext,
    ) -> FatalResult<()> {
        let (account, journal, _) = self.parts(address)?;
        account.set_async_context(journal, request_id, context);
        Ok(())
    }

    pub fn take_async_context(&mut self, address: Address, request_id: u64) -> FatalResult<Option<AsyncContext>> {
        if !self.load_account(address)? {
            return Ok(None);
        }
        let (account, journal, store) = self.parts(address)?;
        account.take_async_context(journal, store, request_id)
    }

    pub fn fetch_request_id(&mut self, address: Address) -> TxnResult<u64> {
        let (account, journal, _) = self.parts(address)?;
        Ok(account.fetch_request_id(journal)?)
    }

    pub fn self_destruct(&mut self, address: Address) -> FatalResult<()> {
        if !self.load_account(address)? {
            return Ok(());
        }
        let (account, journal, _) = self.parts(address)?;
        account.self_destruct(journal);
        Ok(())
    }

    // ── Block-scoped bookkeeping ──

    pub fn transient_state(&self, address: Address, key: &Hash) -> Hash {
        self.transient.get(&(address, *key)).copied().unwrap_or(ZERO_HASH)
    }

    pub fn set_transient_state(&mut self, address: Address, key: Hash, value: Hash) {
        let prev = self.transient_state(address, &key);
        if prev == value {
            return;
        }
        self.journal.append(JournalEntry::TransientStorage { address, key, prev });
        self.put_transient(address, key, value);
    }

    fn put_transient(&mut self, address: Address, key: Hash, value: Hash) {
        if value == ZERO_HASH {
            self.transient.remove(&(address, key));
        } else {
            self.transient.insert((address, key), value);
        }
    }

    pub fn add_log(&mut self, log: Log) {
        self.journal.append(JournalEntry::AddLog {
            txn_hash: self.in_transaction_hash,
        });
        self.logs.entry(self.in_transaction_hash).or_default().push(log);
    }

    pub fn logs(&self, txn_hash: &Hash) -> &[Log] {
        self.logs.get(txn_hash).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn refund(&self) -> u64 {
        self.refund
    }

    pub fn add_refund(&mut self, gas: u64) {
        self.journal.append(JournalEntry::Refund { prev: self.refund });
        self.refund = self.refund.saturating_add(gas);
    }

    pub fn sub_refund(&mut self, gas: u64) {
        self.journal.append(JournalEntry::Refund { prev: self.refund });
        self.refund = self.refund.saturating_sub(gas);
    }

    // ── Journal ──

    pub fn snapshot(&mut self) -> RevisionId {
        self.journal.snapshot()
    }

    /// Undo every mutation made since `id` was taken. `id` and any later
    /// revision become invalid.
    pub fn revert_to_snapshot(&mut self, id: RevisionId) {
        for entry in self.journal.revert_to(id) {
            self.undo(entry);
        }
    }

    fn undo(&mut self, entry: JournalEntry) {
        match entry {
            JournalEntry::CreateAccount { address } => {
                self.accounts.remove(&address);
            }
            JournalEntry::TransientStorage { address, key, prev } => {
                self.put_transient(address, key, prev);
            }
            JournalEntry::Refund { prev } => self.refund = prev,
            JournalEntry::AddLog { txn_hash } => {
                if let Some(logs) = self.logs.get_mut(&txn_hash) {
                    logs.pop();
                }
            }
            JournalEntry::OutTransaction { parent, index } => {
                if let Some(outs) = self.out_transactions.get_mut(&parent) {
                    outs.truncate(index);
                }
            }
            entry => self.undo_account(entry),
        }
    }

    fn undo_account(&mut self, entry: JournalEntry) {
        let address = match &entry {
            JournalEntry::CreateContract { address }
            | JournalEntry::SelfDestruct { address, .. }
            | JournalEntry::Balance { address, .. }
            | JournalEntry::Token { address, .. }
            | JournalEntry::Seqno { address, .. }
            | JournalEntry::ExtSeqno { address, .. }
            | JournalEntry::Code { address, .. }
            | JournalEntry::Storage { address, .. }
            | JournalEntry::AsyncContext { address, .. }
            | JournalEntry::RequestId { address, .. } => *address,
            _ => return,
        };
        let Some(account) = self.accounts.get_mut(&address) else {
            return;
        };
        match entry {
            JournalEntry::CreateContract { .. } => account.clear_new_contract(),
            JournalEntry::SelfDestruct { prev, prev_balance, .. } => {
                account.restore_self_destruct(prev, prev_balance)
            }
            JournalEntry::Balance { prev, .. } => account.restore_balance(prev),
            JournalEntry::Token { token, prev, .. } => account.restore_token(token, prev),
            JournalEntry::Seqno { prev, .. } => account.restore_seqno(prev),
            JournalEntry::ExtSeqno { prev, .. } => account.restore_ext_seqno(prev),
            JournalEntry::Code { prev_hash, prev_code, .. } => account.restore_code(prev_hash, prev_code),
            JournalEntry::Storage { key, prev, .. } => account.restore_state(key, prev),
            JournalEntry::AsyncContext { request_id, prev, .. } => {
                account.restore_async_context(request_id, prev)
            }
            JournalEntry::RequestId { prev, .. } => account.restore_request_id(prev),
            _ => {}
        }
    }

    // ── In-transactions and receipts ──

    /// Register `txn` as the transaction being handled. Outbound
    /// transactions and logs are attributed to it until the next call.
    pub fn add_in_transaction(&mut self, txn: Transaction) -> Hash {
        let hash = txn.hash();
        self.in_transactions.push(txn);
        self.in_transaction_hashes.push(hash);
        self.in_transaction_hash = hash;
        hash
    }

    /// Forget the last in-transaction and everything attributed to it.
    pub fn drop_in_transaction(&mut self) {
        if let Some(hash) = self.in_transaction_hashes.pop() {
            self.in_transactions.pop();
            self.out_transactions.remove(&hash);
            self.logs.remove(&hash);
        }
        self.in_transaction_hash = self.in_transaction_hashes.last().copied().unwrap_or(ZERO_HASH);
    }

    pub fn in_transaction(&self) -> Option<&Transaction> {
        self.in_transactions.last()
    }

    pub fn in_transaction_hash(&self) -> Hash {
        self.in_transaction_hash
    }

    pub fn in_transactions(&self) -> &[Transaction] {
        &self.in_transactions
    }

    pub fn receipts(&self) -> &[Receipt] {
        &self.receipts
    }

    pub fn out_transactions(&self, parent: &Hash) -> &[OutboundTransaction] {
        self.out_transactions.get(parent).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Pass a neighbor's transaction through this shard unchanged.
    pub fn append_forward_transaction(&mut self, txn: Transaction) {
        let outbound = txn.to_outbound(meridian_primitives::ForwardKind::None);
        tracing::trace!(txn_hash = %hex::encode(outbound.hash), "forwarding transaction");
        self.out_transactions.entry(ZERO_HASH).or_default().push(outbound);
    }

    /// Record the receipt of the current in-transaction.
    pub fn add_receipt(&mut self, res: &ExecutionResult) {
        let hash = self.in_transaction_hash;
        let contract_address = self.in_transaction().map(|t| t.to).unwrap_or(Address::EMPTY);
        let receipt = Receipt {
            success: !res.failed(),
            status: res.status(),
            gas_used: res.gas_used,
            forwarded: res.coins_forwarded,
            txn_hash: hash,
            logs: self.logs(&hash).to_vec(),
            out_txn_index: 0,
            out_txn_num: 0,
            contract_address,
            failed_pc: res.failed_pc,
        };
        if let Some(err) = &res.error {
            self.errors.insert(hash, err.to_string());
        } else if let Some(fatal) = &res.fatal {
            self.errors.insert(hash, fatal.to_string());
        }
        self.receipts.push(receipt);
    }

    /// Error message recorded for `txn_hash` in this block.
    pub fn error_message(&self, txn_hash: &Hash) -> Option<&str> {
        self.errors.get(txn_hash).map(String::as_str)
    }
}

impl std::fmt::Debug for ExecutionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionState")
            .field("shard_id", &self.shard_id)
            .field("block_number", &self.block_number)
            .field("accounts", &self.accounts.len())
            .field("in_transactions", &self.in_transactions.len())
            .finish_non_exhaustive()
    }
}
