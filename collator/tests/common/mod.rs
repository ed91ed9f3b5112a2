//! Shared test helpers for collator integration tests.
//!
//! Provides deterministic wallets, a funded zero state, signed external
//! calls, ready-to-collate nodes and a pool that records discards.

#![allow(dead_code)]

use std::sync::Arc;

use parking_lot::Mutex;

use meridian_collator::{CollatorParams, DiscardReason, MemPool, Node, PoolError, TxnPool, Validator};
use meridian_engine::vm::{Program, SendMessage};
use meridian_engine::zerostate::{ContractDescr, ZeroStateConfig};
use meridian_engine::FailureReceiptCache;
use meridian_primitives::crypto::sign_ed25519;
use meridian_primitives::{Address, Hash, ShardId, Transaction, Value};
use meridian_storage::{Database, MemDb};

pub const N_SHARDS: u32 = 3;

pub const WALLET_BALANCE: Value = Value(1_000_000_000_000);

// ── Deterministic Keypairs ──

pub fn deterministic_keypair(seed: u8) -> (ed25519_dalek::VerifyingKey, ed25519_dalek::SigningKey) {
    let signing_key = ed25519_dalek::SigningKey::from_bytes(&[seed; 32]);
    let verifying_key = signing_key.verifying_key();
    (verifying_key, signing_key)
}

pub fn wallet(seed: u8, shard: u32) -> ContractDescr {
    let (vk, _) = deterministic_keypair(seed);
    ContractDescr {
        name: format!("wallet-{seed}-{shard}"),
        address: None,
        shard: ShardId(shard),
        value: WALLET_BALANCE,
        code: Program::wallet(&vk.to_bytes()),
    }
}

pub fn wallet_address(seed: u8, shard: u32) -> Address {
    wallet(seed, shard).address()
}

/// Wallets for seeds 1 and 2 on every shard.
pub fn zero_state() -> ZeroStateConfig {
    let mut config = ZeroStateConfig::default();
    for shard in 0..N_SHARDS {
        config.contracts.push(wallet(1, shard));
        config.contracts.push(wallet(2, shard));
    }
    config
}

// ── Transactions ──

pub fn external_call(seed: u8, shard: u32, seqno: u64, program: Vec<u8>) -> Transaction {
    let (_, sk) = deterministic_keypair(seed);
    let mut txn = Transaction {
        to: wallet_address(seed, shard),
        seqno,
        data: program,
        fee_credit: Value(10_000_000),
        max_fee_per_gas: Value(1_000),
        ..Default::default()
    };
    txn.signature = sign_ed25519(&txn.signing_hash(), &sk).to_vec();
    txn
}

/// Storage bump on the seed-`seed` wallet of `shard`.
pub fn bump(seed: u8, shard: u32, seqno: u64) -> Transaction {
    external_call(seed, shard, seqno, Program::new().sinc([seqno as u8; 32]).build())
}

/// Transfer from the seed-1 wallet of `from` to the seed-2 wallet of `to`.
pub fn transfer(from: u32, to: u32, seqno: u64, value: Value) -> Transaction {
    transfers(from, to, seqno, &[value])
}

/// One external call sending every amount of `values` as its own message.
pub fn transfers(from: u32, to: u32, seqno: u64, values: &[Value]) -> Transaction {
    let program = values
        .iter()
        .fold(Program::new(), |p, value| {
            p.send(&SendMessage {
                to: wallet_address(2, to),
                value: *value,
                ..Default::default()
            })
        })
        .build();
    external_call(1, from, seqno, program)
}

// ── Nodes ──

pub fn params() -> CollatorParams {
    CollatorParams {
        n_shards: N_SHARDS,
        zero_state: zero_state(),
        ..Default::default()
    }
}

/// Node over a fresh database with every zero state committed.
pub fn node_with(params: CollatorParams) -> Node {
    let node = Node::new(params, MemDb::shared());
    node.init_zero_states().unwrap();
    node
}

pub fn node() -> Node {
    node_with(params())
}

pub fn validator(node: &Node, shard: u32) -> Arc<Validator> {
    Arc::clone(node.validator(ShardId(shard)).unwrap())
}

// ── Recording Pool ──

/// [`MemPool`] that remembers every discard.
pub struct RecordingPool {
    pub inner: MemPool,
    pub discarded: Mutex<Vec<(Hash, DiscardReason)>>,
}

impl RecordingPool {
    pub fn new(shard: u32) -> Self {
        Self {
            inner: MemPool::new(ShardId(shard), 100),
            discarded: Mutex::new(Vec::new()),
        }
    }
}

impl TxnPool for RecordingPool {
    fn peek(&self, n: usize) -> Result<Vec<Transaction>, PoolError> {
        self.inner.peek(n)
    }

    fn on_committed(&self, committed: &[Transaction]) -> Result<(), PoolError> {
        self.inner.on_committed(committed)
    }

    fn discard(&self, hashes: &[Hash], reason: DiscardReason) -> Result<(), PoolError> {
        self.discarded.lock().extend(hashes.iter().map(|h| (*h, reason)));
        self.inner.discard(hashes, reason)
    }
}

/// Standalone validator of `shard` over `db`, using `pool`.
pub fn validator_with_pool(db: &Arc<dyn Database>, shard: u32, pool: Arc<RecordingPool>) -> Arc<Validator> {
    let validator = Arc::new(Validator::new(
        params().for_shard(ShardId(shard)),
        Arc::clone(db),
        pool,
        FailureReceiptCache::new(16),
    ));
    validator.generate_zero_state().unwrap();
    validator
}

/// Database with the zero state of every shard committed.
pub fn genesis_db() -> Arc<dyn Database> {
    let db = MemDb::shared();
    for shard in 0..N_SHARDS {
        let pool = Arc::new(MemPool::new(ShardId(shard), 10));
        Validator::new(
            params().for_shard(ShardId(shard)),
            Arc::clone(&db),
            pool,
            FailureReceiptCache::new(16),
        )
        .generate_zero_state()
        .unwrap();
    }
    db
}
