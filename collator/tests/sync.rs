//! Async integration tests: range sync, topic following, block
//! subscriptions and the collation loop.

mod common;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use meridian_collator::{BlockSource, CollatorParams, Scheduler, Syncer, ValidatorError};
use meridian_primitives::ShardId;

use common::*;

/// Produce `n` blocks on `shard` of `node`, each with one storage bump.
fn produce(node: &meridian_collator::Node, shard: u32, n: u64) {
    let v = validator(node, shard);
    let start = v.last_block().unwrap().0.id;
    for seqno in start..start + n {
        node.submit(bump(1, shard, seqno)).unwrap();
        v.insert_proposal(&v.build_proposal().unwrap()).unwrap();
    }
}

#[tokio::test]
async fn test_fetch_blocks_catches_up_with_source() {
    let producer = node();
    produce(&producer, 1, 3);
    let follower = node();

    let source: Arc<dyn BlockSource> = validator(&producer, 1).accessor().clone();
    let syncer = Syncer::new(validator(&follower, 1), source).with_main(validator(&follower, 0));
    let cancel = CancellationToken::new();

    assert_eq!(syncer.fetch_blocks(&cancel).await.unwrap(), 3);
    assert_eq!(
        validator(&follower, 1).last_block().unwrap().1,
        validator(&producer, 1).last_block().unwrap().1
    );
    // Nothing newer.
    assert_eq!(syncer.fetch_blocks(&cancel).await.unwrap(), 0);
}

#[tokio::test]
async fn test_out_of_order_block_triggers_fetch() {
    let producer = node();
    produce(&producer, 2, 2);
    let follower = node();

    let pv = validator(&producer, 2);
    let head = pv.last_block().unwrap().1;
    let latest = Arc::new(pv.block_with_extracted_data(&head).unwrap().unwrap());
    let source: Arc<dyn BlockSource> = pv.accessor().clone();
    let syncer = Syncer::new(validator(&follower, 2), source);
    let cancel = CancellationToken::new();

    // Block 2 arrives before block 1: the gap is fetched instead.
    assert!(!syncer.process_block(Arc::clone(&latest), &cancel).await.unwrap());
    assert_eq!(validator(&follower, 2).last_block().unwrap().1, head);
    // Already applied.
    assert!(!syncer.process_block(latest, &cancel).await.unwrap());
}

#[tokio::test]
async fn test_syncer_follows_published_blocks() {
    let producer = node();
    let follower = node();
    let pv = validator(&producer, 1);
    let fv = validator(&follower, 1);

    let topic = producer.subscribe_blocks(ShardId(1)).unwrap();
    let source: Arc<dyn BlockSource> = pv.accessor().clone();
    let syncer = Syncer::new(Arc::clone(&fv), source).with_main(validator(&follower, 0));
    let cancel = CancellationToken::new();
    let task = tokio::spawn(syncer.run(topic, cancel.clone()));

    let scheduler = Scheduler::new(Arc::clone(&pv)).with_topic(producer_topic(&producer));
    producer.submit(bump(1, 1, 0)).unwrap();
    let res = scheduler.collate_once(&cancel).await.unwrap();

    fv.wait_for_block(&res.block_hash, &cancel).await.unwrap();
    assert_eq!(fv.last_block().unwrap().1, res.block_hash);

    cancel.cancel();
    task.await.unwrap().unwrap();
}

fn producer_topic(node: &meridian_collator::Node) -> meridian_collator::BlockTopic {
    node.block_topic(ShardId(1)).unwrap().clone()
}

#[tokio::test]
async fn test_subscribers_see_inserted_blocks() {
    let node = node();
    let v = validator(&node, 1);
    let mut blocks = v.subscribe();

    produce(&node, 1, 2);
    assert_eq!(blocks.recv().await.unwrap(), 1);
    assert_eq!(blocks.recv().await.unwrap(), 2);
}

#[tokio::test]
async fn test_wait_for_block_gives_up() {
    let node = node_with(CollatorParams {
        timeout_ms: 20,
        ..params()
    });
    let v = validator(&node, 1);
    let cancel = CancellationToken::new();

    let head = v.last_block().unwrap().1;
    v.wait_for_block(&head, &cancel).await.unwrap();

    let missing = [7u8; 32];
    assert!(matches!(
        v.wait_for_block(&missing, &cancel).await,
        Err(ValidatorError::Timeout(_))
    ));

    cancel.cancel();
    assert!(matches!(
        v.wait_for_block(&missing, &cancel).await,
        Err(ValidatorError::Cancelled)
    ));
}

#[tokio::test]
async fn test_cancelled_scheduler_commits_nothing() {
    let node = node();
    let v = validator(&node, 1);
    node.submit(bump(1, 1, 0)).unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    Scheduler::new(Arc::clone(&v)).run(cancel).await;

    assert_eq!(v.last_block().unwrap().0.id, 0);
    assert_eq!(node.pool(ShardId(1)).unwrap().len(), 1);
}

#[tokio::test]
async fn test_spawned_collators_produce_until_cancelled() {
    let node = node_with(CollatorParams {
        collator_tick_period_ms: 5,
        ..params()
    });
    let v = validator(&node, 1);
    let mut blocks = v.subscribe();
    let cancel = CancellationToken::new();
    let handles = node.spawn_collators(&cancel);

    assert_eq!(blocks.recv().await.unwrap(), 1);
    cancel.cancel();
    for handle in handles {
        handle.await.unwrap();
    }
    let head = v.last_block().unwrap().0.id;
    assert!(head >= 1);
}
