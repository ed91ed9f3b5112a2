//! Periodic block production for one shard.

use std::sync::Arc;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use meridian_engine::BlockGenerationResult;

use crate::error::ValidatorError;
use crate::syncer::BlockTopic;
use crate::validator::Validator;

/// Builds and inserts a block on every tick of the collator period.
pub struct Scheduler {
    validator: Arc<Validator>,
    topic: Option<BlockTopic>,
}

impl Scheduler {
    pub fn new(validator: Arc<Validator>) -> Self {
        Self { validator, topic: None }
    }

    /// Publish every produced block on `topic`.
    pub fn with_topic(mut self, topic: BlockTopic) -> Self {
        self.topic = Some(topic);
        self
    }

    /// Produce one block. A cancellation observed before insertion drops
    /// the proposal; nothing is persisted.
    pub async fn collate_once(&self, cancel: &CancellationToken) -> Result<BlockGenerationResult, ValidatorError> {
        let validator = Arc::clone(&self.validator);
        let cancel = cancel.clone();
        let res = tokio::task::spawn_blocking(move || -> Result<BlockGenerationResult, ValidatorError> {
            let proposal = validator.build_proposal()?;
            if cancel.is_cancelled() {
                return Err(ValidatorError::Cancelled);
            }
            validator.insert_proposal(&proposal)
        })
        .await
        .map_err(|err| ValidatorError::Join(err.to_string()))??;

        if let Some(topic) = &self.topic {
            match self.validator.block_with_extracted_data(&res.block_hash)? {
                Some(data) => {
                    // No subscribers is fine.
                    let _ = topic.send(Arc::new(data));
                }
                None => tracing::warn!(
                    shard_id = %self.validator.shard_id(),
                    block_hash = %hex::encode(res.block_hash),
                    "produced block not found for publishing"
                ),
            }
        }
        Ok(res)
    }

    /// Collate on every tick until cancelled. Per-block errors are logged
    /// and the next tick tries again.
    pub async fn run(self, cancel: CancellationToken) {
        let shard = self.validator.shard_id();
        let period = self.validator.params().tick_period();
        tracing::info!(shard_id = %shard, period_ms = period.as_millis() as u64, "starting collator");

        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match self.collate_once(&cancel).await {
                        Ok(res) => tracing::trace!(
                            shard_id = %shard,
                            block_number = res.block.id,
                            block_hash = %hex::encode(res.block_hash),
                            "collated"
                        ),
                        Err(ValidatorError::Cancelled) => break,
                        Err(err) => tracing::error!(shard_id = %shard, error = %err, "failed to collate block"),
                    }
                }
            }
        }
        tracing::info!(shard_id = %shard, "collator stopped");
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("shard_id", &self.validator.shard_id())
            .field("publishes", &self.topic.is_some())
            .finish()
    }
}
