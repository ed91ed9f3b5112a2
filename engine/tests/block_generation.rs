//! Integration tests for block generation: proposal replay, indices,
//! failure receipts and the main-shard config.

mod common;

use std::sync::Arc;

use meridian_engine::config::ParamGasPrice;
use meridian_engine::vm::Program;
use meridian_engine::zerostate::ContractDescr;
use meridian_engine::{
    BlockGenerator, BlockGeneratorParams, ConfigAccessor, FailureReceiptCache, StateAccessor,
};
use meridian_primitives::{ErrorCode, Gas, ShardId, Transaction, TransactionFlags, Value, ZERO_HASH};
use meridian_storage::create_ro_tx;

use common::*;

#[test]
fn test_zero_state_creates_funded_wallets() {
    let db = genesis_db();
    let tx = create_ro_tx(&db);
    for shard in 0..N_SHARDS {
        let (block, hash) = tx.read_last_block(ShardId(shard)).unwrap().unwrap();
        assert_eq!(block.id, 0);
        assert_eq!(tx.read_block_hash_by_number(ShardId(shard), 0).unwrap(), Some(hash));
        assert!(tx.read_block_timestamp(ShardId(shard), &hash).unwrap().is_some());
        if shard != 0 {
            let (main, main_hash) = tx.read_last_block(ShardId::MAIN).unwrap().unwrap();
            assert_eq!(main.id, 0);
            assert_eq!(block.main_shard_hash, main_hash);
        }
    }
}

#[test]
fn test_external_call_is_included_and_indexed() {
    let db = genesis_db();
    let program = Program::new().sinc([7u8; 32]).build();
    let txn = external_call(1, 1, 0, program);

    let mut proposal = proposal_on_head(&db, 1);
    proposal.external_txns.push(txn.clone());
    let res = generate(&db, 1, &proposal);

    assert_eq!(res.block.id, 1);
    assert_eq!(res.receipts.len(), 1);
    assert!(res.receipts[0].success, "{:?}", res.receipts[0].status);
    assert_eq!(res.in_txn_hashes, vec![txn.hash()]);

    let tx = create_ro_tx(&db);
    let loc = tx.read_in_tx_location(ShardId(1), &txn.hash()).unwrap().unwrap();
    assert_eq!(loc.block_hash, res.block_hash);
    assert_eq!(loc.index, 0);
    assert_eq!(tx.read_last_block_hash(ShardId(1)).unwrap(), Some(res.block_hash));

    let accessor = StateAccessor::new(Arc::clone(&db));
    let receipt = accessor.receipt_by_hash(ShardId(1), &txn.hash()).unwrap().unwrap();
    assert_eq!(receipt.receipt, res.receipts[0]);
    assert_eq!(receipt.error, None);
}

#[test]
fn test_stale_proposal_is_rejected() {
    let db = genesis_db();
    let mut proposal = proposal_on_head(&db, 1);
    proposal.prev_block_hash = [9u8; 32];
    let generator =
        BlockGenerator::new(BlockGeneratorParams::new(ShardId(1), N_SHARDS), Arc::clone(&db)).unwrap();
    assert!(generator.generate_block(&proposal).is_err());

    let tx = create_ro_tx(&db);
    assert_eq!(tx.read_last_block(ShardId(1)).unwrap().unwrap().0.id, 0);
}

#[test]
fn test_unverified_external_is_dropped_into_failure_cache() {
    let db = genesis_db();
    // Wrong seqno: rejected before any gas is spent.
    let txn = external_call(1, 1, 5, Vec::new());
    let mut proposal = proposal_on_head(&db, 1);
    proposal.external_txns.push(txn.clone());

    let cache = FailureReceiptCache::new(16);
    let res = BlockGenerator::new(BlockGeneratorParams::new(ShardId(1), N_SHARDS), Arc::clone(&db))
        .unwrap()
        .with_failure_receipts(cache.clone())
        .generate_block(&proposal)
        .unwrap();

    assert!(res.in_txns.is_empty());
    assert!(res.receipts.is_empty());
    let receipt = cache.get(&txn.hash()).unwrap();
    assert_eq!(receipt.status, ErrorCode::SeqnoGap);
    assert!(create_ro_tx(&db).read_in_tx_location(ShardId(1), &txn.hash()).unwrap().is_none());
}

#[test]
fn test_forged_signature_is_dropped_without_gas() {
    let db = genesis_db();
    let mut txn = external_call(1, 1, 0, Program::new().sinc([3u8; 32]).build());
    txn.signature = vec![0; 64];
    let mut proposal = proposal_on_head(&db, 1);
    proposal.external_txns.push(txn.clone());

    let cache = FailureReceiptCache::new(16);
    let res = BlockGenerator::new(BlockGeneratorParams::new(ShardId(1), N_SHARDS), Arc::clone(&db))
        .unwrap()
        .with_failure_receipts(cache.clone())
        .generate_block(&proposal)
        .unwrap();

    assert!(res.in_txns.is_empty());
    assert!(res.receipts.is_empty());
    assert_eq!(res.block.gas_used, Gas::ZERO);
    let receipt = cache.get(&txn.hash()).unwrap();
    assert!(!receipt.success);
    assert_eq!(receipt.status, ErrorCode::ExternalVerificationFailed);
    assert_eq!(receipt.gas_used, Gas::ZERO);
    assert!(create_ro_tx(&db).read_in_tx_location(ShardId(1), &txn.hash()).unwrap().is_none());
}

#[test]
fn test_external_to_codeless_account_skips_verification() {
    let codeless = ContractDescr {
        name: "codeless".into(),
        address: None,
        shard: ShardId(1),
        value: Value(500_000_000_000),
        code: Vec::new(),
    };
    let mut config = zero_state();
    config.contracts.push(codeless.clone());
    let db = genesis_db_with(&config);

    let txn = Transaction {
        to: codeless.address(),
        value: Value::ZERO,
        fee_credit: Value(1_000_000),
        max_fee_per_gas: Value(100),
        ..Default::default()
    };
    let mut proposal = proposal_on_head(&db, 1);
    proposal.external_txns.push(txn.clone());
    let res = generate(&db, 1, &proposal);

    assert_eq!(res.in_txn_hashes, vec![txn.hash()]);
    assert_eq!(res.receipts.len(), 1);
    assert!(res.receipts[0].success, "{:?}", res.receipts[0].status);

    // Data with no value still needs code to run.
    let mut call = txn.clone();
    call.data = vec![1, 2, 3];
    let mut proposal = proposal_on_head(&db, 1);
    proposal.external_txns.push(call.clone());
    let cache = FailureReceiptCache::new(16);
    let res = BlockGenerator::new(BlockGeneratorParams::new(ShardId(1), N_SHARDS), Arc::clone(&db))
        .unwrap()
        .with_failure_receipts(cache.clone())
        .generate_block(&proposal)
        .unwrap();
    assert!(res.receipts.is_empty());
    assert_eq!(cache.get(&call.hash()).unwrap().status, ErrorCode::ContractDoesNotExist);
}

#[test]
fn test_internal_with_tx_id_gap_is_receipted_as_failed() {
    let db = genesis_db();
    let txn = Transaction {
        flags: TransactionFlags::new(TransactionFlags::INTERNAL),
        from: wallet_address(1, 2),
        to: wallet_address(2, 1),
        tx_id: 3,
        max_fee_per_gas: Value(1_000),
        ..Default::default()
    };
    let mut proposal = proposal_on_head(&db, 1);
    proposal.internal_txns.push(txn);
    let res = generate(&db, 1, &proposal);

    assert_eq!(res.receipts.len(), 1);
    assert!(!res.receipts[0].success);
    assert_eq!(res.receipts[0].status, ErrorCode::TxIdGap);
    let error = create_ro_tx(&db).read_error(ShardId(1), &res.in_txn_hashes[0]).unwrap();
    assert!(error.is_some());
}

#[test]
fn test_main_shard_publishes_gas_prices() {
    let db = genesis_db();
    let proposal = proposal_on_head(&db, 0);
    let res = generate(&db, 0, &proposal);
    assert_ne!(res.block.config_root, ZERO_HASH);

    let tx = create_ro_tx(&db);
    let config = ConfigAccessor::for_main_block(&tx, &res.block_hash, true).unwrap();
    let prices = config.get::<ParamGasPrice, _>(&tx).unwrap().unwrap();
    assert_eq!(prices.shards.len(), N_SHARDS as usize);
    assert!(prices.shards.iter().all(|p| *p > Value::ZERO));
}

#[test]
fn test_forwarded_transactions_come_first() {
    let db = genesis_db();
    let send = Program::new()
        .send(&meridian_engine::vm::SendMessage {
            to: wallet_address(2, 2),
            value: Value(5),
            ..Default::default()
        })
        .build();
    let txn = external_call(1, 1, 0, send);
    let forward = Transaction {
        flags: TransactionFlags::new(TransactionFlags::INTERNAL),
        from: wallet_address(1, 0),
        to: wallet_address(1, 2),
        ..Default::default()
    };

    let mut proposal = proposal_on_head(&db, 1);
    proposal.external_txns.push(txn);
    proposal.forward_txns.push(forward.clone());
    let res = generate(&db, 1, &proposal);

    assert!(res.receipts[0].success, "{:?}", res.receipts[0].status);
    assert_eq!(res.out_txns[0], forward);
    assert!(res.out_txns.len() >= 2);
    assert_eq!(res.receipts[0].out_txn_index, 1);
    let tx = create_ro_tx(&db);
    for (i, hash) in res.out_txn_hashes.iter().enumerate() {
        let loc = tx.read_out_tx_location(ShardId(1), hash).unwrap().unwrap();
        assert_eq!(loc.index, i as u64);
    }
}

#[test]
fn test_block_range_stops_at_head() {
    let db = genesis_db();
    for _ in 0..3 {
        let proposal = proposal_on_head(&db, 2);
        generate(&db, 2, &proposal);
    }
    let accessor = StateAccessor::new(Arc::clone(&db));
    let blocks = accessor.block_range(ShardId(2), 1, 10).unwrap();
    assert_eq!(blocks.len(), 3);
    assert_eq!(blocks[0].block.id, 1);
    assert_eq!(blocks[2].block.id, 3);
    assert!(accessor.block_range(ShardId(2), 4, 10).unwrap().is_empty());
}

#[test]
fn test_built_block_is_persisted_only_on_finalize() {
    let db = genesis_db();
    let proposal = proposal_on_head(&db, 1);
    let mut generator =
        BlockGenerator::new(BlockGeneratorParams::new(ShardId(1), N_SHARDS), Arc::clone(&db)).unwrap();
    let res = generator.build_block(&proposal).unwrap();
    assert!(generator.build_block(&proposal).is_err());
    assert_eq!(create_ro_tx(&db).read_last_block(ShardId(1)).unwrap().unwrap().0.id, 0);

    generator.finalize(&res).unwrap();
    let tx = create_ro_tx(&db);
    assert_eq!(tx.read_last_block_hash(ShardId(1)).unwrap(), Some(res.block_hash));
}

#[test]
fn test_replayed_gas_prices_override_collected_ones() {
    let db = genesis_db();
    let proposal = proposal_on_head(&db, 0);
    let prices = vec![Value(11), Value(12), Value(13)];
    let res = BlockGenerator::new(BlockGeneratorParams::new(ShardId::MAIN, N_SHARDS), Arc::clone(&db))
        .unwrap()
        .with_gas_prices(prices.clone())
        .generate_block(&proposal)
        .unwrap();

    let tx = create_ro_tx(&db);
    let config = ConfigAccessor::for_main_block(&tx, &res.block_hash, true).unwrap();
    let published = config.get::<ParamGasPrice, _>(&tx).unwrap().unwrap();
    assert_eq!(published.shards, prices);
}
