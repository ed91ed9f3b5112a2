//! Per-address mutable account record.
//!
//! An [`AccountState`] is materialized from the contract trie the first time
//! an execution state touches its address. Storage slots, token balances and
//! async contexts are read lazily from their tries and cached; every setter
//! journals the previous value first. [`AccountState::commit`] flushes the
//! caches into the tries and returns the persisted record.

use std::collections::BTreeMap;

use meridian_primitives::crypto::hash_blake3;
use meridian_primitives::{
    Address, AsyncContext, ErrorCode, ExecError, FatalError, FatalResult, Hash, MerkleTrie,
    NodeStore, Seqno, SmartContract, TokenId, Value, ZERO_HASH,
};
use meridian_storage::Tx;

use crate::journal::{Journal, JournalEntry};

/// Hash under which `code` is stored. Empty code hashes to [`ZERO_HASH`].
pub fn code_hash(code: &[u8]) -> Hash {
    if code.is_empty() {
        ZERO_HASH
    } else {
        hash_blake3(code)
    }
}

fn request_key(request_id: u64) -> [u8; 8] {
    request_id.to_be_bytes()
}

#[derive(Debug, Clone)]
pub struct AccountState {
    address: Address,
    balance: Value,
    code: Vec<u8>,
    code_hash: Hash,
    seqno: Seqno,
    ext_seqno: Seqno,
    request_id: u64,

    storage_trie: MerkleTrie,
    token_trie: MerkleTrie,
    async_context_trie: MerkleTrie,

    storage: BTreeMap<Hash, Hash>,
    tokens: BTreeMap<TokenId, Value>,
    /// `None` marks a context consumed in this block, deleted on commit.
    async_contexts: BTreeMap<u64, Option<AsyncContext>>,

    self_destructed: bool,
    new_contract: bool,
}

impl AccountState {
    /// A fresh account with nothing behind it.
    pub fn new(address: Address) -> Self {
        Self {
            address,
            balance: Value::ZERO,
            code: Vec::new(),
            code_hash: ZERO_HASH,
            seqno: 0,
            ext_seqno: 0,
            request_id: 0,
            storage_trie: MerkleTrie::empty(),
            token_trie: MerkleTrie::empty(),
            async_context_trie: MerkleTrie::empty(),
            storage: BTreeMap::new(),
            tokens: BTreeMap::new(),
            async_contexts: BTreeMap::new(),
            self_destructed: false,
            new_contract: false,
        }
    }

    /// Materialize a persisted account. Code is loaded eagerly.
    pub fn from_contract(contract: &SmartContract, tx: &Tx) -> FatalResult<Self> {
        let code = if contract.code_hash == ZERO_HASH {
            Vec::new()
        } else {
            tx.read_code(&contract.code_hash)?.ok_or_else(|| {
                FatalError::not_found(format!("code of {}", contract.address))
            })?
        };
        Ok(Self {
            address: contract.address,
            balance: contract.balance,
            code,
            code_hash: contract.code_hash,
            seqno: contract.seqno,
            ext_seqno: contract.ext_seqno,
            request_id: contract.request_id,
            storage_trie: MerkleTrie::new(contract.storage_root),
            token_trie: MerkleTrie::new(contract.token_root),
            async_context_trie: MerkleTrie::new(contract.async_context_root),
            storage: BTreeMap::new(),
            tokens: BTreeMap::new(),
            async_contexts: BTreeMap::new(),
            self_destructed: false,
            new_contract: false,
        })
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn balance(&self) -> Value {
        self.balance
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    pub fn code_hash(&self) -> Hash {
        self.code_hash
    }

    pub fn seqno(&self) -> Seqno {
        self.seqno
    }

    pub fn ext_seqno(&self) -> Seqno {
        self.ext_seqno
    }

    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    /// Root of the committed storage trie; pending slot writes are not included.
    pub fn storage_root(&self) -> Hash {
        self.storage_trie.root()
    }

    pub fn is_new_contract(&self) -> bool {
        self.new_contract
    }

    pub fn is_self_destructed(&self) -> bool {
        self.self_destructed
    }

    /// An account with no code, no seqno and no balance.
    pub fn is_empty(&self) -> bool {
        self.seqno == 0 && self.balance.is_zero() && self.code.is_empty()
    }

    // ── Balance ──

    pub fn set_balance(&mut self, journal: &mut Journal, balance: Value) {
        journal.append(JournalEntry::Balance {
            address: self.address,
            prev: self.balance,
        });
        self.balance = balance;
    }

    pub fn add_balance(&mut self, journal: &mut Journal, amount: Value) -> Result<(), ExecError> {
        if amount.is_zero() {
            return Ok(());
        }
        let new_balance = self.balance.checked_add(amount).ok_or_else(|| {
            ExecError::verbose(
                ErrorCode::BalanceOverflow,
                format!("{} + {}", self.balance, amount),
            )
        })?;
        tracing::trace!(address = %self.address, %amount, balance = %new_balance, "balance increased");
        self.set_balance(journal, new_balance);
        Ok(())
    }

    pub fn sub_balance(&mut self, journal: &mut Journal, amount: Value) -> Result<(), ExecError> {
        if amount.is_zero() {
            return Ok(());
        }
        let new_balance = self.balance.checked_sub(amount).ok_or_else(|| {
            ExecError::verbose(
                ErrorCode::InsufficientBalance,
                format!("{} < {}", self.balance, amount),
            )
        })?;
        tracing::trace!(address = %self.address, %amount, balance = %new_balance, "balance decreased");
        self.set_balance(journal, new_balance);
        Ok(())
    }

    // ── Seqnos and request ids ──

    pub fn set_seqno(&mut self, journal: &mut Journal, seqno: Seqno) {
        journal.append(JournalEntry::Seqno {
            address: self.address,
            prev: self.seqno,
        });
        self.seqno = seqno;
    }

    pub fn set_ext_seqno(&mut self, journal: &mut Journal, seqno: Seqno) {
        journal.append(JournalEntry::ExtSeqno {
            address: self.address,
            prev: self.ext_seqno,
        });
        self.ext_seqno = seqno;
    }

    /// Allocate the next request id of this account.
    pub fn fetch_request_id(&mut self, journal: &mut Journal) -> Result<u64, ExecError> {
        let next = self.request_id.checked_add(1).ok_or_else(|| {
            ExecError::verbose(ErrorCode::SeqnoOverflow, format!("request id of {}", self.address))
        })?;
        journal.append(JournalEntry::RequestId {
            address: self.address,
            prev: self.request_id,
        });
        self.request_id = next;
        Ok(next)
    }

    // ── Code ──

    pub fn set_code(&mut self, journal: &mut Journal, code: Vec<u8>) {
        journal.append(JournalEntry::Code {
            address: self.address,
            prev_hash: self.code_hash,
            prev_code: std::mem::take(&mut self.code),
        });
        self.code_hash = code_hash(&code);
        self.code = code;
    }

    pub fn mark_new_contract(&mut self, journal: &mut Journal) {
        if !self.new_contract {
            self.new_contract = true;
            journal.append(JournalEntry::CreateContract {
                address: self.address,
            });
        }
    }

    /// Flag the account for deletion at commit and burn its balance.
    pub fn self_destruct(&mut self, journal: &mut Journal) {
        journal.append(JournalEntry::SelfDestruct {
            address: self.address,
            prev: self.self_destructed,
            prev_balance: self.balance,
        });
        self.self_destructed = true;
        self.balance = Value::ZERO;
    }

    // ── Storage ──

    pub fn get_state<S: NodeStore + ?Sized>(&mut self, store: &S, key: &Hash) -> FatalResult<Hash> {
        if let Some(value) = self.storage.get(key) {
            return Ok(*value);
        }
        let value = self.committed_state(store, key)?;
        self.storage.insert(*key, value);
        Ok(value)
    }

    /// Slot value as of the start of the block.
    pub fn committed_state<S: NodeStore + ?Sized>(&self, store: &S, key: &Hash) -> FatalResult<Hash> {
        Ok(self.storage_trie.get_value::<Hash, _>(store, key)?.unwrap_or(ZERO_HASH))
    }

    /// Write a slot. Writing the current value is not journaled.
    pub fn set_state<S: NodeStore + ?Sized>(
        &mut self,
        journal: &mut Journal,
        store: &S,
        key: Hash,
        value: Hash,
    ) -> FatalResult<()> {
        let prev = self.get_state(store, &key)?;
        if prev == value {
            return Ok(());
        }
        journal.append(JournalEntry::Storage {
            address: self.address,
            key,
            prev,
        });
        self.storage.insert(key, value);
        Ok(())
    }

    // ── Tokens ──

    pub fn token_balance<S: NodeStore + ?Sized>(&mut self, store: &S, token: &TokenId) -> FatalResult<Value> {
        if let Some(value) = self.tokens.get(token) {
            return Ok(*value);
        }
        let value = self
            .token_trie
            .get_value::<Value, _>(store, token.as_bytes())?
            .unwrap_or(Value::ZERO);
        self.tokens.insert(*token, value);
        Ok(value)
    }

    pub fn set_token_balance(&mut self, journal: &mut Journal, token: TokenId, amount: Value) {
        journal.append(JournalEntry::Token {
            address: self.address,
            token,
            prev: self.tokens.get(&token).copied(),
        });
        self.tokens.insert(token, amount);
    }

    /// Every token balance, pending writes included.
    pub fn tokens<S: NodeStore + ?Sized>(&self, store: &S) -> FatalResult<BTreeMap<TokenId, Value>> {
        let mut out = BTreeMap::new();
        for (key, value) in self.token_trie.entries(store)? {
            let token = Address::from_bytes(key.as_slice().try_into().map_err(|_| {
                FatalError::invariant("token trie key is not an address")
            })?);
            out.insert(token, <Value as meridian_primitives::Codec>::decode(&value)?);
        }
        out.extend(self.tokens.iter().map(|(k, v)| (*k, *v)));
        Ok(out)
    }

    // ── Async contexts ──

    pub fn set_async_context(&mut self, journal: &mut Journal, request_id: u64, context: AsyncContext) {
        journal.append(JournalEntry::AsyncContext {
            address: self.address,
            request_id,
            prev: self.async_contexts.get(&request_id).cloned(),
        });
        self.async_contexts.insert(request_id, Some(context));
    }

    /// Remove and return the context stored under `request_id`.
    pub fn take_async_context<S: NodeStore + ?Sized>(
        &mut self,
        journal: &mut Journal,
        store: &S,
        request_id: u64,
    ) -> FatalResult<Option<AsyncContext>> {
        let cached = self.async_contexts.get(&request_id).cloned();
        let context = match &cached {
            Some(ctx) => ctx.clone(),
            None => self
                .async_context_trie
                .get_value::<AsyncContext, _>(store, &request_key(request_id))?,
        };
        journal.append(JournalEntry::AsyncContext {
            address: self.address,
            request_id,
            prev: cached,
        });
        self.async_contexts.insert(request_id, None);
        Ok(context)
    }

    // ── Undo hooks used when reverting the journal ──

    pub(crate) fn restore_balance(&mut self, prev: Value) {
        self.balance = prev;
    }

    pub(crate) fn restore_seqno(&mut self, prev: Seqno) {
        self.seqno = prev;
    }

    pub(crate) fn restore_ext_seqno(&mut self, prev: Seqno) {
        self.ext_seqno = prev;
    }

    pub(crate) fn restore_request_id(&mut self, prev: u64) {
        self.request_id = prev;
    }

    pub(crate) fn restore_code(&mut self, prev_hash: Hash, prev_code: Vec<u8>) {
        self.code_hash = prev_hash;
        self.code = prev_code;
    }

    pub(crate) fn restore_state(&mut self, key: Hash, prev: Hash) {
        self.storage.insert(key, prev);
    }

    pub(crate) fn restore_token(&mut self, token: TokenId, prev: Option<Value>) {
        match prev {
            Some(v) => self.tokens.insert(token, v),
            None => self.tokens.remove(&token),
        };
    }

    pub(crate) fn restore_async_context(&mut self, request_id: u64, prev: Option<Option<AsyncContext>>) {
        match prev {
            Some(v) => self.async_contexts.insert(request_id, v),
            None => self.async_contexts.remove(&request_id),
        };
    }

    pub(crate) fn restore_self_destruct(&mut self, prev: bool, prev_balance: Value) {
        self.self_destructed = prev;
        self.balance = prev_balance;
    }

    pub(crate) fn clear_new_contract(&mut self) {
        self.new_contract = false;
    }

    // ── Commit ──

    /// Flush cached slots, tokens and async contexts into their tries, write
    /// the code, and return the record stored in the contract trie.
    pub fn commit(&mut self, tx: &mut Tx) -> FatalResult<SmartContract> {
        for (key, value) in &self.storage {
            if *value == ZERO_HASH {
                self.storage_trie.delete(tx, key)?;
            } else {
                self.storage_trie.set_value(tx, key, value)?;
            }
        }
        for (request_id, context) in &self.async_contexts {
            let key = request_key(*request_id);
            match context {
                Some(ctx) => self.async_context_trie.set_value(tx, &key, ctx)?,
                None => self.async_context_trie.delete(tx, &key)?,
            }
        }
        for (token, amount) in &self.tokens {
            if amount.is_zero() {
                self.token_trie.delete(tx, token.as_bytes())?;
            } else {
                self.token_trie.set_value(tx, token.as_bytes(), amount)?;
            }
        }
        if !self.code.is_empty() {
            tx.write_code(&self.code_hash, &self.code);
        }

        Ok(SmartContract {
            address: self.address,
            balance: self.balance,
            storage_root: self.storage_trie.root(),
            token_root: self.token_trie.root(),
            async_context_root: self.async_context_trie.root(),
            code_hash: self.code_hash,
            seqno: self.seqno,
            ext_seqno: self.ext_seqno,
            request_id: self.request_id,
        })
    }
}
