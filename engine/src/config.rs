//! Main-shard configuration parameters.
//!
//! Parameters live in a trie keyed by parameter name. The trie root is the
//! `config_root` of main-shard blocks; every shard reads the parameters of
//! the main-shard block its own block links to.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use meridian_primitives::codec::{write_u64, write_vec, Reader};
use meridian_primitives::{
    Address, Codec, CodecError, FatalError, FatalResult, Hash, MerkleTrie, NodeStore, ShardId,
    Value, DEFAULT_GAS_PRICE, ZERO_HASH,
};
use meridian_storage::Tx;

/// A typed configuration parameter stored under [`ConfigParam::NAME`].
pub trait ConfigParam: Codec {
    const NAME: &'static str;
}

/// Gas price of every shard, indexed by shard id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamGasPrice {
    pub shards: Vec<Value>,
}

impl ParamGasPrice {
    pub fn price(&self, shard: ShardId) -> Value {
        self.shards
            .get(shard.0 as usize)
            .copied()
            .unwrap_or(DEFAULT_GAS_PRICE)
    }
}

impl ConfigParam for ParamGasPrice {
    const NAME: &'static str = "gas_price";
}

impl Codec for ParamGasPrice {
    fn encode_to(&self, buf: &mut Vec<u8>) {
        write_vec(buf, &self.shards);
    }

    fn decode_from(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            shards: r.read_vec()?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorInfo {
    #[serde(with = "hex::serde")]
    pub public_key: [u8; 32],
    pub withdrawal_address: Address,
}

impl Codec for ValidatorInfo {
    fn encode_to(&self, buf: &mut Vec<u8>) {
        self.public_key.encode_to(buf);
        self.withdrawal_address.encode_to(buf);
    }

    fn decode_from(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            public_key: Hash::decode_from(r)?,
            withdrawal_address: Address::decode_from(r)?,
        })
    }
}

/// Validator set of the whole network.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamValidators {
    pub validators: Vec<ValidatorInfo>,
}

impl ConfigParam for ParamValidators {
    const NAME: &'static str = "validators";
}

impl Codec for ParamValidators {
    fn encode_to(&self, buf: &mut Vec<u8>) {
        write_vec(buf, &self.validators);
    }

    fn decode_from(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            validators: r.read_vec()?,
        })
    }
}

/// Last L1 block seen by the relayer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamL1BlockInfo {
    pub number: u64,
    pub timestamp: u64,
    pub base_fee: Value,
    pub blob_base_fee: Value,
    pub state_root: Hash,
}

impl ConfigParam for ParamL1BlockInfo {
    const NAME: &'static str = "l1block";
}

impl Codec for ParamL1BlockInfo {
    fn encode_to(&self, buf: &mut Vec<u8>) {
        write_u64(buf, self.number);
        write_u64(buf, self.timestamp);
        self.base_fee.encode_to(buf);
        self.blob_base_fee.encode_to(buf);
        self.state_root.encode_to(buf);
    }

    fn decode_from(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            number: r.read_u64()?,
            timestamp: r.read_u64()?,
            base_fee: Value::decode_from(r)?,
            blob_base_fee: Value::decode_from(r)?,
            state_root: r.read_hash()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    ReadWrite,
    ReadOnly,
    Stub,
}

/// Reads and writes configuration parameters over a config trie.
///
/// Reads are lazy: each parameter is fetched from the trie when first asked
/// for, never the whole set. Writes are buffered until [`commit`](Self::commit).
#[derive(Debug, Clone)]
pub struct ConfigAccessor {
    trie: MerkleTrie,
    writes: BTreeMap<&'static str, Vec<u8>>,
    mode: Mode,
}

impl ConfigAccessor {
    pub fn new(root: Hash) -> Self {
        Self {
            trie: MerkleTrie::new(root),
            writes: BTreeMap::new(),
            mode: Mode::ReadWrite,
        }
    }

    pub fn read_only(root: Hash) -> Self {
        Self {
            mode: Mode::ReadOnly,
            ..Self::new(root)
        }
    }

    /// Accessor with no backing trie: every parameter is absent and
    /// commits leave the root untouched.
    pub fn stub() -> Self {
        Self {
            mode: Mode::Stub,
            ..Self::new(ZERO_HASH)
        }
    }

    /// Accessor over the config of the main-shard block `main_shard_hash`,
    /// or of the latest main-shard block when the hash is zero.
    pub fn for_main_block(tx: &Tx, main_shard_hash: &Hash, read_only: bool) -> FatalResult<Self> {
        let block = if *main_shard_hash == ZERO_HASH {
            tx.read_last_block(ShardId::MAIN)?.map(|(block, _)| block)
        } else {
            tx.read_block(ShardId::MAIN, main_shard_hash)?
        };
        let root = block.map(|b| b.config_root).unwrap_or(ZERO_HASH);
        Ok(if read_only {
            Self::read_only(root)
        } else {
            Self::new(root)
        })
    }

    pub fn root(&self) -> Hash {
        self.trie.root()
    }

    pub fn get_data<S: NodeStore + ?Sized>(
        &self,
        store: &S,
        name: &'static str,
    ) -> FatalResult<Option<Vec<u8>>> {
        if self.mode == Mode::Stub {
            return Ok(None);
        }
        if let Some(data) = self.writes.get(name) {
            return Ok(Some(data.clone()));
        }
        self.trie.get(store, name.as_bytes())
    }

    pub fn set_data(&mut self, name: &'static str, data: Vec<u8>) -> FatalResult<()> {
        match self.mode {
            Mode::ReadOnly => Err(FatalError::Config(format!(
                "cannot set {name}: accessor is read-only"
            ))),
            Mode::Stub => Ok(()),
            Mode::ReadWrite => {
                self.writes.insert(name, data);
                Ok(())
            }
        }
    }

    pub fn get<P: ConfigParam, S: NodeStore + ?Sized>(&self, store: &S) -> FatalResult<Option<P>> {
        match self.get_data(store, P::NAME)? {
            Some(data) => Ok(Some(P::decode(&data)?)),
            None => Ok(None),
        }
    }

    pub fn set<P: ConfigParam>(&mut self, param: &P) -> FatalResult<()> {
        self.set_data(P::NAME, param.encode())
    }

    /// Gas price of `shard` from the published table, or the default price.
    pub fn gas_price<S: NodeStore + ?Sized>(&self, store: &S, shard: ShardId) -> FatalResult<Value> {
        Ok(self
            .get::<ParamGasPrice, _>(store)?
            .map(|table| table.price(shard))
            .unwrap_or(DEFAULT_GAS_PRICE))
    }

    pub fn is_dirty(&self) -> bool {
        !self.writes.is_empty()
    }

    /// Apply buffered writes on top of `base_root` and return the new root.
    /// Without writes `base_root` is returned unchanged.
    pub fn commit(&mut self, tx: &mut Tx, base_root: Hash) -> FatalResult<Hash> {
        if self.writes.is_empty() {
            return Ok(base_root);
        }
        let mut trie = MerkleTrie::new(base_root);
        for (name, data) in std::mem::take(&mut self.writes) {
            trie.set(tx, name.as_bytes(), &data)?;
        }
        tracing::debug!(root = %hex::encode(trie.root()), "config committed");
        self.trie = trie;
        Ok(self.trie.root())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_storage::{create_rw_tx, MemDb};

    #[test]
    fn test_write_then_read_back() {
        let db = MemDb::shared();
        let mut tx = create_rw_tx(&db);

        let mut config = ConfigAccessor::new(ZERO_HASH);
        let table = ParamGasPrice {
            shards: vec![Value(10), Value(25)],
        };
        config.set(&table).unwrap();
        // Visible before commit.
        assert_eq!(config.get::<ParamGasPrice, _>(&tx).unwrap(), Some(table.clone()));

        let root = config.commit(&mut tx, ZERO_HASH).unwrap();
        assert_ne!(root, ZERO_HASH);

        let reader = ConfigAccessor::read_only(root);
        assert_eq!(reader.gas_price(&tx, ShardId(1)).unwrap(), Value(25));
        assert_eq!(reader.gas_price(&tx, ShardId(7)).unwrap(), DEFAULT_GAS_PRICE);
        assert_eq!(reader.get::<ParamValidators, _>(&tx).unwrap(), None);
    }

    #[test]
    fn test_commit_without_writes_keeps_root() {
        let db = MemDb::shared();
        let mut tx = create_rw_tx(&db);
        let mut config = ConfigAccessor::new(ZERO_HASH);
        assert_eq!(config.commit(&mut tx, [3u8; 32]).unwrap(), [3u8; 32]);
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let mut config = ConfigAccessor::read_only(ZERO_HASH);
        let err = config.set(&ParamValidators::default()).unwrap_err();
        assert!(matches!(err, FatalError::Config(_)));
    }

    #[test]
    fn test_stub_has_no_params() {
        let db = MemDb::shared();
        let tx = create_rw_tx(&db);
        let mut config = ConfigAccessor::stub();
        config.set(&ParamGasPrice { shards: vec![Value(99)] }).unwrap();
        assert_eq!(config.get::<ParamGasPrice, _>(&tx).unwrap(), None);
        assert_eq!(config.gas_price(&tx, ShardId::MAIN).unwrap(), DEFAULT_GAS_PRICE);
    }

    #[test]
    fn test_validators_roundtrip_json() {
        let param = ParamValidators {
            validators: vec![ValidatorInfo {
                public_key: [5u8; 32],
                withdrawal_address: Address([1u8; 20]),
            }],
        };
        let json = serde_json::to_string(&param).unwrap();
        assert!(json.contains(&"05".repeat(32)));
        let back: ParamValidators = serde_json::from_str(&json).unwrap();
        assert_eq!(back, param);
        assert_eq!(ParamValidators::decode(&param.encode()).unwrap(), param);
    }
}
