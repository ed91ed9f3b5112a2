//! Integration tests for collation: pool and neighbor intake, block limits,
//! insertion and replay.

mod common;

use std::sync::Arc;

use meridian_collator::{CollatorParams, DiscardReason, PoolError, TopologyKind, TxnPool, ValidatorError};
use meridian_engine::Proposal;
use meridian_primitives::{ErrorCode, Gas, ShardId, Value};
use meridian_storage::create_ro_tx;

use common::*;

#[test]
fn test_pool_transaction_is_collated_then_evicted() {
    let node = node();
    let v = validator(&node, 1);
    let txn = bump(1, 1, 0);
    assert!(node.submit(txn.clone()).unwrap());

    let proposal = v.build_proposal().unwrap();
    assert_eq!(proposal.external_txns, vec![txn.clone()]);
    // Peeking leaves the pool untouched.
    assert_eq!(node.pool(ShardId(1)).unwrap().len(), 1);

    let res = v.insert_proposal(&proposal).unwrap();
    assert_eq!(res.block.id, 1);
    assert!(res.receipts[0].success, "{:?}", res.receipts[0].status);
    assert!(node.pool(ShardId(1)).unwrap().is_empty());
    assert_eq!(v.last_block().unwrap().1, res.block_hash);
}

#[test]
fn test_gas_cap_stops_pool_intake() {
    // Gas of one storage bump, measured on a separate node.
    let reference = node();
    let pv = validator(&reference, 1);
    reference.submit(bump(1, 1, 0)).unwrap();
    let one = pv.insert_proposal(&pv.build_proposal().unwrap()).unwrap().block.gas_used;
    assert!(one > Gas::ZERO);

    let node = node_with(CollatorParams {
        max_gas_in_block: Gas(one.0 * 3 / 2),
        ..params()
    });
    let v = validator(&node, 1);
    let first = bump(1, 1, 0);
    let second = bump(1, 1, 1);
    node.submit(first.clone()).unwrap();
    node.submit(second.clone()).unwrap();

    let proposal = v.build_proposal().unwrap();
    assert_eq!(proposal.external_txns, vec![first]);
    v.insert_proposal(&proposal).unwrap();

    let pool = node.pool(ShardId(1)).unwrap();
    assert_eq!(pool.len(), 1);
    assert!(pool.contains(&second.hash()));

    let proposal = v.build_proposal().unwrap();
    assert_eq!(proposal.external_txns, vec![second]);
}

#[test]
fn test_neighbor_message_is_consumed_once() {
    let node = node();
    let sender = validator(&node, 1);
    let receiver = validator(&node, 2);
    let dest = wallet_address(2, 2);

    node.submit(transfer(1, 2, 0, Value(5))).unwrap();
    let res = sender.insert_proposal(&sender.build_proposal().unwrap()).unwrap();
    assert!(res.out_txns.iter().any(|t| t.to == dest));

    let first = receiver.build_proposal().unwrap();
    let to_dest = |p: &meridian_engine::Proposal| p.internal_txns.iter().filter(|t| t.to == dest).count();
    assert_eq!(to_dest(&first), 1);
    let cursor = |p: &meridian_engine::Proposal| {
        p.collator_state
            .neighbors
            .iter()
            .find(|n| n.shard_id == ShardId(1))
            .map(|n| (n.block_number, n.transaction_index))
            .unwrap()
    };
    let after_first = cursor(&first);
    assert!(after_first > (res.block.id, 0));

    receiver.insert_proposal(&first).unwrap();
    let stored = create_ro_tx(receiver.db()).read_collator_state(ShardId(2)).unwrap();
    assert_eq!(stored, first.collator_state);

    let second = receiver.build_proposal().unwrap();
    assert_eq!(to_dest(&second), 0);
    assert!(cursor(&second) >= after_first);
}

/// Values of the proposed internal transactions addressed to `dest`.
fn internal_values(p: &Proposal, dest: meridian_primitives::Address) -> Vec<Value> {
    p.internal_txns.iter().filter(|t| t.to == dest).map(|t| t.value).collect()
}

fn forward_values(p: &Proposal) -> Vec<Value> {
    p.forward_txns.iter().map(|t| t.value).collect()
}

fn cursor(p: &Proposal, shard: u32) -> Option<(u64, u64)> {
    p.collator_state
        .neighbors
        .iter()
        .find(|n| n.shard_id == ShardId(shard))
        .map(|n| (n.block_number, n.transaction_index))
}

#[test]
fn test_internal_count_limit_resumes_mid_block() {
    let node = node_with(CollatorParams {
        max_internal_transactions_in_block: 1,
        ..params()
    });
    let sender = validator(&node, 1);
    let receiver = validator(&node, 2);
    let dest = wallet_address(2, 2);

    node.submit(transfers(1, 2, 0, &[Value(5), Value(6)])).unwrap();
    let sent = sender.insert_proposal(&sender.build_proposal().unwrap()).unwrap();
    assert_eq!(sent.out_txns.iter().filter(|t| t.to == dest).count(), 2);

    let first = receiver.build_proposal().unwrap();
    assert_eq!(first.internal_txns.len(), 1);
    assert_eq!(internal_values(&first, dest), vec![Value(5)]);
    assert_eq!(cursor(&first, 1), Some((sent.block.id, 1)));
    receiver.insert_proposal(&first).unwrap();

    let second = receiver.build_proposal().unwrap();
    assert_eq!(internal_values(&second, dest), vec![Value(6)]);
    assert_eq!(cursor(&second, 1), Some((sent.block.id + 1, 0)));
    receiver.insert_proposal(&second).unwrap();

    let third = receiver.build_proposal().unwrap();
    assert!(internal_values(&third, dest).is_empty());
}

#[test]
fn test_zero_internal_gas_skips_neighbor_intake() {
    let node = node_with(CollatorParams {
        max_internal_gas_in_block: Gas::ZERO,
        ..params()
    });
    let sender = validator(&node, 1);
    let receiver = validator(&node, 2);
    let dest = wallet_address(2, 2);

    node.submit(transfer(1, 2, 0, Value(5))).unwrap();
    sender.insert_proposal(&sender.build_proposal().unwrap()).unwrap();

    // The cap covers neighbor intake only: the pool is still drained.
    let local = bump(1, 2, 0);
    node.submit(local.clone()).unwrap();
    let proposal = receiver.build_proposal().unwrap();
    assert!(internal_values(&proposal, dest).is_empty());
    assert_eq!(cursor(&proposal, 1), Some((0, 0)));
    assert_eq!(proposal.external_txns, vec![local]);
}

#[test]
fn test_line_topology_relays_through_middle_shard() {
    let node = node_with(CollatorParams {
        topology: TopologyKind::Line,
        ..params()
    });
    let main = validator(&node, 0);
    let middle = validator(&node, 1);
    let last = validator(&node, 2);
    let dest = wallet_address(2, 2);

    node.submit(transfer(0, 2, 0, Value(5))).unwrap();
    let sent = main.insert_proposal(&main.build_proposal().unwrap()).unwrap();
    let message = sent.out_txns.iter().find(|t| t.to == dest).unwrap().clone();

    // Shard 2 is not a neighbor of the main shard on a line.
    assert!(internal_values(&last.build_proposal().unwrap(), dest).is_empty());

    let relay = middle.build_proposal().unwrap();
    assert_eq!(relay.forward_txns, vec![message.clone()]);
    assert!(relay.internal_txns.is_empty());
    let relayed = middle.insert_proposal(&relay).unwrap();
    assert_eq!(relayed.out_txns[0], message);

    let delivered = last.build_proposal().unwrap();
    assert_eq!(internal_values(&delivered, dest), vec![Value(5)]);
    assert!(delivered.forward_txns.is_empty());
}

#[test]
fn test_forward_limit_resumes_mid_block() {
    let node = node_with(CollatorParams {
        topology: TopologyKind::Line,
        max_forward_transactions_in_block: 1,
        ..params()
    });
    let main = validator(&node, 0);
    let middle = validator(&node, 1);

    node.submit(transfers(0, 2, 0, &[Value(5), Value(6)])).unwrap();
    let sent = main.insert_proposal(&main.build_proposal().unwrap()).unwrap();

    let first = middle.build_proposal().unwrap();
    assert_eq!(forward_values(&first), vec![Value(5)]);
    assert_eq!(cursor(&first, 0), Some((sent.block.id, 1)));
    middle.insert_proposal(&first).unwrap();

    let second = middle.build_proposal().unwrap();
    assert_eq!(forward_values(&second), vec![Value(6)]);
    middle.insert_proposal(&second).unwrap();

    let third = middle.build_proposal().unwrap();
    assert!(third.forward_txns.is_empty());
}

#[test]
fn test_included_transaction_is_discarded_as_duplicate() {
    let db = genesis_db();
    let pool = Arc::new(RecordingPool::new(1));
    let v = validator_with_pool(&db, 1, Arc::clone(&pool));

    let txn = bump(1, 1, 0);
    pool.inner.add(txn.clone()).unwrap();
    v.insert_proposal(&v.build_proposal().unwrap()).unwrap();
    assert!(pool.inner.is_empty());

    // Resubmitted after inclusion.
    pool.inner.add(txn.clone()).unwrap();
    let proposal = v.build_proposal().unwrap();
    assert!(proposal.external_txns.is_empty());
    assert_eq!(*pool.discarded.lock(), vec![(txn.hash(), DiscardReason::DuplicateHash)]);
    assert!(pool.inner.is_empty());
}

#[test]
fn test_unverified_transaction_gets_failure_receipt() {
    let db = genesis_db();
    let pool = Arc::new(RecordingPool::new(1));
    let v = validator_with_pool(&db, 1, Arc::clone(&pool));

    let txn = bump(1, 1, 7);
    pool.inner.add(txn.clone()).unwrap();
    let proposal = v.build_proposal().unwrap();

    assert!(proposal.external_txns.is_empty());
    assert_eq!(*pool.discarded.lock(), vec![(txn.hash(), DiscardReason::Unverified)]);
    let receipt = v.failure_receipts().get(&txn.hash()).unwrap();
    assert!(!receipt.success);
    assert_eq!(receipt.status, ErrorCode::SeqnoGap);
}

#[test]
fn test_stale_proposal_is_rejected() {
    let node = node();
    let v = validator(&node, 1);
    let proposal = v.build_proposal().unwrap();
    v.insert_proposal(&proposal).unwrap();

    assert!(matches!(v.insert_proposal(&proposal), Err(ValidatorError::OldBlock(1))));

    let mut skipped = v.build_proposal().unwrap();
    skipped.prev_block_id += 1;
    assert!(matches!(
        v.is_valid_proposal(&skipped),
        Err(ValidatorError::OutOfOrder { expected: 2, got: 3 })
    ));

    let mut forked = v.build_proposal().unwrap();
    forked.prev_block_hash = [9u8; 32];
    assert!(matches!(v.insert_proposal(&forked), Err(ValidatorError::HashMismatch { .. })));
}

#[test]
fn test_build_block_by_proposal_does_not_persist() {
    let node = node();
    let v = validator(&node, 1);
    node.submit(bump(1, 1, 0)).unwrap();
    let proposal = v.build_proposal().unwrap();

    let built = v.build_block_by_proposal(&proposal).unwrap();
    assert_eq!(v.last_block().unwrap().0.id, 0);

    let inserted = v.insert_proposal(&proposal).unwrap();
    assert_eq!(inserted.block_hash, built.block_hash);
}

#[test]
fn test_replayed_block_matches_producer() {
    let producer = node();
    let follower = node();
    for shard in [0, 1] {
        let pv = validator(&producer, shard);
        producer.submit(bump(1, shard, 0)).unwrap();
        let res = pv.insert_proposal(&pv.build_proposal().unwrap()).unwrap();
        let data = pv.block_with_extracted_data(&res.block_hash).unwrap().unwrap();

        let fv = validator(&follower, shard);
        let mut tampered = data.clone();
        tampered.in_transactions.clear();
        assert!(matches!(
            fv.replay_block(&tampered),
            Err(ValidatorError::ReplayMismatch { .. })
        ));
        assert_eq!(fv.last_block().unwrap().0.id, 0);

        let replayed = fv.replay_block(&data).unwrap();
        assert_eq!(replayed.block_hash, res.block_hash);
        assert_eq!(fv.last_block().unwrap().1, res.block_hash);

        assert!(matches!(fv.replay_block(&data), Err(ValidatorError::OldBlock(1))));
    }
}

#[test]
fn test_node_routes_submissions_by_shard() {
    let node = node();
    let txn = bump(1, 2, 0);
    assert!(node.submit(txn.clone()).unwrap());
    assert!(!node.submit(txn.clone()).unwrap());
    assert!(node.pool(ShardId(1)).unwrap().is_empty());
    assert_eq!(node.pool(ShardId(2)).unwrap().peek(10).unwrap(), vec![txn]);

    let mut stray = bump(1, 1, 0);
    stray.to = meridian_primitives::Address::from_shard_and_hash(ShardId(9), &[1u8; 32]);
    assert!(matches!(node.submit(stray), Err(PoolError::UnknownShard(ShardId(9)))));
}

#[test]
fn test_zero_state_is_generated_once() {
    let node = node();
    for shard in 0..N_SHARDS {
        let v = validator(&node, shard);
        assert_eq!(v.last_block().unwrap().0.id, 0);
        assert!(v.generate_zero_state().unwrap().is_none());
    }
    let main_hash = validator(&node, 0).last_block().unwrap().1;
    assert_eq!(validator(&node, 2).last_block().unwrap().0.main_shard_hash, main_hash);
}
