//! Shared test helpers for integration tests.
//!
//! Provides deterministic keypairs, a funded zero state, transaction
//! builders and block-generation shortcuts used across the test files.

#![allow(dead_code)]

use std::sync::Arc;

use meridian_engine::vm::Program;
use meridian_engine::zerostate::{ContractDescr, ZeroStateConfig};
use meridian_engine::{BlockGenerationResult, BlockGenerator, BlockGeneratorParams, Proposal};
use meridian_primitives::crypto::sign_ed25519;
use meridian_primitives::{Address, ShardId, Transaction, Value};
use meridian_storage::{create_ro_tx, Database, MemDb};

pub const N_SHARDS: u32 = 3;

/// Balance every wallet starts with.
pub const WALLET_BALANCE: Value = Value(1_000_000_000_000);

// ── Deterministic Keypairs ──

/// Create a deterministic Ed25519 signing key from a single seed byte.
pub fn deterministic_keypair(seed: u8) -> (ed25519_dalek::VerifyingKey, ed25519_dalek::SigningKey) {
    let signing_key = ed25519_dalek::SigningKey::from_bytes(&[seed; 32]);
    let verifying_key = signing_key.verifying_key();
    (verifying_key, signing_key)
}

/// Wallet contract of the seed-`seed` key on `shard`.
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

/// Zero state with wallets for seeds 1 and 2 on every shard.
pub fn zero_state() -> ZeroStateConfig {
    let mut config = ZeroStateConfig::default();
    for shard in 0..N_SHARDS {
        config.contracts.push(wallet(1, shard));
        config.contracts.push(wallet(2, shard));
    }
    config
}

pub fn wallet_address(seed: u8, shard: u32) -> Address {
    wallet(seed, shard).address()
}

// ── Transactions ──

/// Signed external call to the seed-`seed` wallet running `program`.
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

// ── Blocks ──

/// Fresh database with the zero state of every shard committed.
pub fn genesis_db() -> Arc<dyn Database> {
    genesis_db_with(&zero_state())
}

pub fn genesis_db_with(config: &ZeroStateConfig) -> Arc<dyn Database> {
    let db = MemDb::shared();
    for shard in 0..N_SHARDS {
        BlockGenerator::new(BlockGeneratorParams::new(ShardId(shard), N_SHARDS), Arc::clone(&db))
            .unwrap()
            .generate_zero_state(config)
            .unwrap();
    }
    db
}

/// Empty proposal on top of the last block of `shard`.
pub fn proposal_on_head(db: &Arc<dyn Database>, shard: u32) -> Proposal {
    let tx = create_ro_tx(db);
    let (block, hash) = tx.read_last_block(ShardId(shard)).unwrap().unwrap();
    Proposal {
        prev_block_id: block.id,
        prev_block_hash: hash,
        main_shard_hash: block.main_shard_hash,
        collator_state: tx.read_collator_state(ShardId(shard)).unwrap(),
        ..Default::default()
    }
}

pub fn generate(db: &Arc<dyn Database>, shard: u32, proposal: &Proposal) -> BlockGenerationResult {
    BlockGenerator::new(BlockGeneratorParams::new(ShardId(shard), N_SHARDS), Arc::clone(db))
        .unwrap()
        .generate_block(proposal)
        .unwrap()
}
