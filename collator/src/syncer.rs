//! Following a shard produced by another node.
//!
//! A syncer catches up by pulling ranges of blocks from a [`BlockSource`],
//! then replays blocks published on the shard's topic as they arrive. Every
//! block is re-executed by the local [`Validator`] and only inserted when
//! the result matches. Blocks of non-main shards wait for the main-shard
//! block their configuration comes from.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use meridian_engine::state_accessor::MAX_BLOCK_RANGE;
use meridian_engine::StateAccessor;
use meridian_primitives::{BlockNumber, BlockWithExtractedData, FatalError, ShardId};

use crate::error::ValidatorError;
use crate::validator::Validator;

/// Where missing blocks are fetched from.
pub trait BlockSource: Send + Sync {
    /// Up to `count` consecutive blocks of `shard` starting at `from`.
    /// An empty result means the source has nothing newer.
    fn fetch_blocks(
        &self,
        shard: ShardId,
        from: BlockNumber,
        count: u64,
    ) -> Result<Vec<BlockWithExtractedData>, FatalError>;
}

impl BlockSource for StateAccessor {
    fn fetch_blocks(
        &self,
        shard: ShardId,
        from: BlockNumber,
        count: u64,
    ) -> Result<Vec<BlockWithExtractedData>, FatalError> {
        self.block_range(shard, from, count)
    }
}

/// Topic of blocks published by a shard's producer.
pub type BlockTopic = broadcast::Sender<Arc<BlockWithExtractedData>>;

pub struct Syncer {
    validator: Arc<Validator>,
    main: Option<Arc<Validator>>,
    source: Arc<dyn BlockSource>,
}

impl Syncer {
    pub fn new(validator: Arc<Validator>, source: Arc<dyn BlockSource>) -> Self {
        Self {
            validator,
            main: None,
            source,
        }
    }

    /// Validator of the main shard on this node, used to wait for the
    /// main-shard blocks a replay depends on.
    pub fn with_main(mut self, main: Arc<Validator>) -> Self {
        self.main = Some(main);
        self
    }

    fn shard_id(&self) -> ShardId {
        self.validator.shard_id()
    }

    /// Pull and replay blocks until the source has nothing newer. Returns
    /// the number of inserted blocks.
    pub async fn fetch_blocks(&self, cancel: &CancellationToken) -> Result<usize, ValidatorError> {
        let shard = self.shard_id();
        let mut inserted = 0;
        loop {
            let (head, _) = self.validator.last_block()?;
            let source = Arc::clone(&self.source);
            let from = head.id + 1;
            let blocks = tokio::task::spawn_blocking(move || source.fetch_blocks(shard, from, MAX_BLOCK_RANGE))
                .await
                .map_err(|err| ValidatorError::Join(err.to_string()))??;
            if blocks.is_empty() {
                break;
            }
            tracing::debug!(shard_id = %shard, from, count = blocks.len(), "fetched blocks");
            for data in blocks {
                if data.block.id == 0 {
                    continue;
                }
                self.replay(Arc::new(data), cancel).await?;
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    /// Handle one block received from the topic. Returns whether it was
    /// inserted; a block ahead of the head triggers a fetch instead.
    pub async fn process_block(
        &self,
        data: Arc<BlockWithExtractedData>,
        cancel: &CancellationToken,
    ) -> Result<bool, ValidatorError> {
        let (head, _) = self.validator.last_block()?;
        if data.block.id <= head.id {
            tracing::trace!(shard_id = %self.shard_id(), block_number = data.block.id, "skipping old block");
            return Ok(false);
        }
        if data.block.id != head.id + 1 {
            tracing::debug!(
                shard_id = %self.shard_id(),
                block_number = data.block.id,
                head = head.id,
                "received block out of order, fetching"
            );
            self.fetch_blocks(cancel).await?;
            return Ok(false);
        }
        self.replay(data, cancel).await?;
        Ok(true)
    }

    async fn replay(&self, data: Arc<BlockWithExtractedData>, cancel: &CancellationToken) -> Result<(), ValidatorError> {
        if let Some(main) = &self.main {
            // The block executes under the config of the main block its
            // predecessor references.
            let (head, _) = self.validator.last_block()?;
            main.wait_for_block(&head.main_shard_hash, cancel).await?;
        }
        let validator = Arc::clone(&self.validator);
        let res = tokio::task::spawn_blocking(move || validator.replay_block(&data))
            .await
            .map_err(|err| ValidatorError::Join(err.to_string()))??;
        tracing::debug!(
            shard_id = %self.shard_id(),
            block_number = res.block.id,
            block_hash = %hex::encode(res.block_hash),
            "block replayed"
        );
        Ok(())
    }

    /// Catch up, then follow `topic` until cancelled. A lagging subscriber
    /// falls back to fetching.
    pub async fn run(
        self,
        mut topic: broadcast::Receiver<Arc<BlockWithExtractedData>>,
        cancel: CancellationToken,
    ) -> Result<(), ValidatorError> {
        let shard = self.shard_id();
        tracing::info!(shard_id = %shard, "starting sync");
        match self.fetch_blocks(&cancel).await {
            Ok(_) | Err(ValidatorError::Timeout(_)) => {}
            Err(ValidatorError::Cancelled) => return Ok(()),
            Err(err) => return Err(err),
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!(shard_id = %shard, "stopping sync");
                    return Ok(());
                }
                received = topic.recv() => {
                    let result = match received {
                        Ok(data) => self.process_block(data, &cancel).await.map(|_| ()),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(shard_id = %shard, skipped, "block topic lagged, fetching");
                            self.fetch_blocks(&cancel).await.map(|_| ())
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            tracing::info!(shard_id = %shard, "block topic closed");
                            return Ok(());
                        }
                    };
                    match result {
                        Ok(()) => {}
                        Err(ValidatorError::Cancelled) => return Ok(()),
                        Err(err @ (ValidatorError::ReplayMismatch { .. } | ValidatorError::HashMismatch { .. })) => {
                            tracing::error!(shard_id = %shard, error = %err, "received block rejected");
                            return Err(err);
                        }
                        Err(err) => {
                            tracing::warn!(shard_id = %shard, error = %err, "failed to process block");
                        }
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for Syncer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Syncer")
            .field("shard_id", &self.shard_id())
            .field("follows_main", &self.main.is_some())
            .finish_non_exhaustive()
    }
}
