//! Genesis state of a shard.
//!
//! The zero state is described by a [`ZeroStateConfig`], usually loaded from
//! the node's JSON parameters. Every shard reads the same config and keeps
//! only the contracts whose address lands on it.

use serde::{Deserialize, Serialize};

use meridian_primitives::transaction::create_address;
use meridian_primitives::{
    Address, DeployPayload, FatalError, FatalResult, ShardId, Value, DEFAULT_GAS_PRICE, ZERO_HASH,
};

use crate::config::{ParamGasPrice, ParamValidators};
use crate::execution_state::ExecutionState;

/// A contract present from block zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractDescr {
    pub name: String,
    /// Fixed address; derived from the code and shard when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<Address>,
    #[serde(default)]
    pub shard: ShardId,
    #[serde(default)]
    pub value: Value,
    /// Hex-encoded contract code.
    #[serde(default, with = "hex::serde")]
    pub code: Vec<u8>,
}

impl ContractDescr {
    pub fn address(&self) -> Address {
        self.address.unwrap_or_else(|| {
            create_address(self.shard, &DeployPayload::new(&self.code, ZERO_HASH))
        })
    }
}

/// Main-shard parameters published in the genesis config trie.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigParams {
    #[serde(default)]
    pub validators: ParamValidators,
    #[serde(default)]
    pub gas_price: ParamGasPrice,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZeroStateConfig {
    #[serde(default)]
    pub config: ConfigParams,
    #[serde(default)]
    pub contracts: Vec<ContractDescr>,
}

impl ZeroStateConfig {
    pub fn find_contract(&self, name: &str) -> Option<&ContractDescr> {
        self.contracts.iter().find(|c| c.name == name)
    }

    /// Address of the contract called `name`, if configured.
    pub fn contract_address(&self, name: &str) -> Option<Address> {
        self.find_contract(name).map(ContractDescr::address)
    }

    /// Genesis gas price of `shard`.
    pub fn gas_price(&self, shard: ShardId) -> FatalResult<Value> {
        let shards = &self.config.gas_price.shards;
        if shards.is_empty() {
            return Ok(DEFAULT_GAS_PRICE);
        }
        shards.get(shard.0 as usize).copied().ok_or_else(|| {
            FatalError::Config(format!(
                "gas price table has {} entries, shard {shard} has none",
                shards.len()
            ))
        })
    }
}

impl ExecutionState {
    /// Populate an empty state from `config`. The main shard also publishes
    /// the validator set and the gas-price table.
    pub fn generate_zero_state(&mut self, config: &ZeroStateConfig) -> FatalResult<()> {
        let shard = self.shard_id();
        if shard.is_main() {
            self.config_mut().set(&config.config.validators)?;
            self.config_mut().set(&config.config.gas_price)?;
        }
        self.set_base_fee(config.gas_price(shard)?);

        for contract in &config.contracts {
            let address = contract.address();
            if address.shard_id() != shard {
                continue;
            }
            self.create_account(address)?;
            self.mark_new_contract(address)?;
            self.add_balance(address, contract.value)
                .map_err(|err| FatalError::Config(format!("funding {}: {err}", contract.name)))?;
            self.set_code(address, contract.code.clone())?;
            tracing::debug!(
                shard_id = %shard,
                name = %contract.name,
                address = %address,
                value = %contract.value,
                "zero state contract created"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigAccessor;
    use crate::execution_state::ExecutionParams;
    use meridian_storage::{create_rw_tx, MemDb};

    const CONFIG: &str = r#"{
        "config": { "gas_price": { "shards": ["10", "12", "14"] } },
        "contracts": [
            { "name": "Faucet", "shard": 1, "value": "1000000", "code": "0102" },
            { "name": "MainWallet", "shard": 0, "value": "5", "code": "03" }
        ]
    }"#;

    #[test]
    fn test_zero_state_keeps_own_shard_contracts() {
        let config: ZeroStateConfig = serde_json::from_str(CONFIG).unwrap();
        let db = MemDb::shared();
        let mut es = ExecutionState::new(create_rw_tx(&db), ShardId(1), ExecutionParams::default()).unwrap();
        es.generate_zero_state(&config).unwrap();

        let faucet = config.contract_address("Faucet").unwrap();
        let wallet = config.contract_address("MainWallet").unwrap();
        assert_eq!(faucet.shard_id(), ShardId(1));
        assert_eq!(es.balance(faucet).unwrap(), Value(1_000_000));
        assert_eq!(es.code(faucet).unwrap(), vec![1, 2]);
        assert!(!es.account_exists(wallet).unwrap());
        assert_eq!(es.base_fee(), Value(12));
    }

    #[test]
    fn test_zero_state_publishes_main_config() {
        let config: ZeroStateConfig = serde_json::from_str(CONFIG).unwrap();
        let db = MemDb::shared();
        let params = ExecutionParams {
            config: ConfigAccessor::new(ZERO_HASH),
            ..Default::default()
        };
        let mut es = ExecutionState::new(create_rw_tx(&db), ShardId::MAIN, params).unwrap();
        es.generate_zero_state(&config).unwrap();
        assert_eq!(es.config().gas_price(es.tx(), ShardId(2)).unwrap(), Value(14));
    }

    #[test]
    fn test_short_gas_price_table_is_rejected() {
        let config: ZeroStateConfig = serde_json::from_str(CONFIG).unwrap();
        assert!(config.gas_price(ShardId(7)).is_err());
    }
}
