//! Collator and node parameters.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use meridian_engine::zerostate::ZeroStateConfig;
use meridian_engine::BlockGeneratorParams;
use meridian_primitives::{ChainId, Gas, ShardId, DEFAULT_CHAIN_ID, DEFAULT_GAS_LIMIT, DEFAULT_MAX_GAS_IN_BLOCK};

use crate::error::ConfigError;
use crate::topology::TopologyKind;

/// Parameters of one shard's collator. Loaded from JSON; every field has a
/// default, so a config file only names what it changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollatorParams {
    pub shard_id: ShardId,
    pub n_shards: u32,
    pub chain_id: ChainId,

    /// Gas cap of a whole block; pool intake stops past it.
    pub max_gas_in_block: Gas,
    /// Gas cap of neighbor intake. Never above `max_gas_in_block`.
    pub max_internal_gas_in_block: Gas,
    pub max_internal_transactions_in_block: usize,
    pub max_forward_transactions_in_block: usize,
    /// Candidates peeked from the pool per proposal.
    pub max_txns_from_pool: usize,
    /// Gas limit of a single transaction.
    pub gas_limit: Gas,

    pub collator_tick_period_ms: u64,
    /// How long a replay waits for the main-shard block it depends on.
    pub timeout_ms: u64,

    pub topology: TopologyKind,
    pub pool_capacity: usize,
    pub failure_receipts_capacity: usize,

    /// Default log filter when `RUST_LOG` is unset.
    pub log_level: String,

    pub zero_state: ZeroStateConfig,
}

impl Default for CollatorParams {
    fn default() -> Self {
        Self {
            shard_id: ShardId::MAIN,
            n_shards: 1,
            chain_id: DEFAULT_CHAIN_ID,
            max_gas_in_block: DEFAULT_MAX_GAS_IN_BLOCK, // 200M
            max_internal_gas_in_block: Gas(100_000_000),
            max_internal_transactions_in_block: 1000,
            max_forward_transactions_in_block: 200,
            max_txns_from_pool: 1000,
            gas_limit: DEFAULT_GAS_LIMIT,
            collator_tick_period_ms: 2000,
            timeout_ms: 10_000,
            topology: TopologyKind::Trivial,
            pool_capacity: 10_000,
            failure_receipts_capacity: 1000,
            log_level: "info".to_string(),
            zero_state: ZeroStateConfig::default(),
        }
    }
}

impl CollatorParams {
    /// Read and validate parameters from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path)?;
        Self::from_json(&data)
    }

    pub fn from_json(data: &str) -> Result<Self, ConfigError> {
        let params: Self = serde_json::from_str(data)?;
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.n_shards == 0 {
            return Err(ConfigError::Invalid("n_shards must be at least 1".into()));
        }
        if self.shard_id.0 >= self.n_shards {
            return Err(ConfigError::Invalid(format!(
                "shard {} out of range for {} shards",
                self.shard_id, self.n_shards
            )));
        }
        if self.collator_tick_period_ms == 0 {
            return Err(ConfigError::Invalid("collator_tick_period_ms must be positive".into()));
        }
        if self.max_gas_in_block == Gas::ZERO {
            return Err(ConfigError::Invalid("max_gas_in_block must be positive".into()));
        }
        if self.pool_capacity == 0 {
            return Err(ConfigError::Invalid("pool_capacity must be positive".into()));
        }
        for contract in &self.zero_state.contracts {
            if contract.shard.0 >= self.n_shards {
                return Err(ConfigError::Invalid(format!(
                    "zero-state contract {} lives on shard {} of {}",
                    contract.name, contract.shard, self.n_shards
                )));
            }
        }
        Ok(())
    }

    /// The same parameters for another shard of the node.
    pub fn for_shard(&self, shard_id: ShardId) -> Self {
        Self {
            shard_id,
            ..self.clone()
        }
    }

    pub fn internal_gas_limit(&self) -> Gas {
        self.max_internal_gas_in_block.min(self.max_gas_in_block)
    }

    pub fn tick_period(&self) -> Duration {
        Duration::from_millis(self.collator_tick_period_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn block_generator_params(&self) -> BlockGeneratorParams {
        BlockGeneratorParams {
            chain_id: self.chain_id,
            gas_limit: self.gas_limit,
            ..BlockGeneratorParams::new(self.shard_id, self.n_shards)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_params() {
        let params = CollatorParams::default();
        assert_eq!(params.max_gas_in_block, Gas(200_000_000));
        assert_eq!(params.max_internal_gas_in_block, Gas(100_000_000));
        assert_eq!(params.max_internal_transactions_in_block, 1000);
        assert_eq!(params.max_forward_transactions_in_block, 200);
        assert_eq!(params.max_txns_from_pool, 1000);
        assert!(params.validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let params =
            CollatorParams::from_json(r#"{"n_shards": 4, "topology": "line", "max_gas_in_block": 5000}"#)
                .unwrap();
        assert_eq!(params.n_shards, 4);
        assert_eq!(params.topology, TopologyKind::Line);
        assert_eq!(params.max_gas_in_block, Gas(5000));
        assert_eq!(params.internal_gas_limit(), Gas(5000));
        assert_eq!(params.max_txns_from_pool, 1000);
    }

    #[test]
    fn test_shard_out_of_range_rejected() {
        let err = CollatorParams::from_json(r#"{"n_shards": 2, "shard_id": 2}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_malformed_json_rejected() {
        let err = CollatorParams::from_json("{").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
