//! Core value types shared by every Meridian crate.
//!
//! Addresses carry their owning shard in the two high-order bytes, so any
//! component can route a transaction without consulting state.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::crypto::hash_blake3;

/// 32-byte hash used for block hashes, trie roots and transaction hashes.
pub type Hash = [u8; 32];

/// Block number within one shard's chain.
pub type BlockNumber = u64;

/// Position of a transaction inside a block's in/out transaction trie.
pub type TransactionIndex = u64;

/// Per-account message ordering counter.
pub type Seqno = u64;

/// Chain identifier carried by external transactions.
pub type ChainId = u64;

/// The chain id every external transaction must carry.
pub const DEFAULT_CHAIN_ID: ChainId = 0;

/// A zero-valued hash, also the root of an empty trie.
pub const ZERO_HASH: Hash = [0u8; 32];

/// Convert a `Hash` to a 0x-prefixed hex string for display purposes.
pub fn hash_to_hex(hash: &Hash) -> String {
    format!("0x{}", hex::encode(hash))
}

/// Short form of a hash for log fields.
pub fn short_hex(hash: &Hash) -> String {
    hex::encode(&hash[..6])
}

// ── ShardId ──

/// Identifier of a shard. Shard 0 is the main shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShardId(pub u32);

impl ShardId {
    /// The coordinating shard that publishes the gas-price table and config.
    pub const MAIN: ShardId = ShardId(0);

    pub fn is_main(self) -> bool {
        self == Self::MAIN
    }

    pub fn to_be_bytes(self) -> [u8; 4] {
        self.0.to_be_bytes()
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Address ──

/// Length of an address in bytes.
pub const ADDRESS_LEN: usize = 20;

/// Number of leading address bytes that encode the shard id.
pub const SHARD_ID_LEN: usize = 2;

/// Account address. The first two bytes are the big-endian shard id.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address(pub [u8; ADDRESS_LEN]);

impl Address {
    /// The empty address, used as "not set" for refund and bounce targets.
    pub const EMPTY: Address = Address([0u8; ADDRESS_LEN]);

    pub fn from_bytes(bytes: [u8; ADDRESS_LEN]) -> Self {
        Self(bytes)
    }

    /// Build an address on `shard` from the tail of `hash`.
    pub fn from_shard_and_hash(shard: ShardId, hash: &Hash) -> Self {
        let mut bytes = [0u8; ADDRESS_LEN];
        bytes[..SHARD_ID_LEN].copy_from_slice(&(shard.0 as u16).to_be_bytes());
        bytes[SHARD_ID_LEN..].copy_from_slice(&hash[32 - (ADDRESS_LEN - SHARD_ID_LEN)..]);
        Self(bytes)
    }

    /// The shard that owns this address.
    pub fn shard_id(&self) -> ShardId {
        ShardId(u16::from_be_bytes([self.0[0], self.0[1]]) as u32)
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::EMPTY
    }

    pub fn as_bytes(&self) -> &[u8; ADDRESS_LEN] {
        &self.0
    }

    /// Hash of the address, used as the key in the contract trie.
    pub fn hash(&self) -> Hash {
        hash_blake3(&self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self)
    }
}

/// Error parsing an address from its hex form.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid address: {0}")]
pub struct ParseAddressError(String);

impl FromStr for Address {
    type Err = ParseAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(raw).map_err(|e| ParseAddressError(e.to_string()))?;
        let arr: [u8; ADDRESS_LEN] = bytes
            .try_into()
            .map_err(|_| ParseAddressError(format!("expected {ADDRESS_LEN} bytes")))?;
        Ok(Self(arr))
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Token identifiers are the addresses of the minting contracts.
pub type TokenId = Address;

// ── Value ──

/// Native currency amount. All arithmetic is overflow-checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Value(pub u128);

impl Value {
    pub const ZERO: Value = Value(0);

    pub fn new(v: u128) -> Self {
        Self(v)
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, other: Value) -> Option<Value> {
        self.0.checked_add(other.0).map(Value)
    }

    pub fn checked_sub(self, other: Value) -> Option<Value> {
        self.0.checked_sub(other.0).map(Value)
    }

    pub fn saturating_sub(self, other: Value) -> Value {
        Value(self.0.saturating_sub(other.0))
    }

    pub fn saturating_add(self, other: Value) -> Value {
        Value(self.0.saturating_add(other.0))
    }

    /// Amount of gas this value buys at `price`. Zero price buys nothing.
    pub fn to_gas(self, price: Value) -> Gas {
        if price.is_zero() {
            return Gas::ZERO;
        }
        Gas(u64::try_from(self.0 / price.0).unwrap_or(u64::MAX))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse::<u128>().map(Value).map_err(serde::de::Error::custom)
    }
}

// ── Gas ──

/// Units of execution work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Gas(pub u64);

impl Gas {
    pub const ZERO: Gas = Gas(0);

    pub fn checked_add(self, other: Gas) -> Option<Gas> {
        self.0.checked_add(other.0).map(Gas)
    }

    pub fn saturating_add(self, other: Gas) -> Gas {
        Gas(self.0.saturating_add(other.0))
    }

    pub fn saturating_sub(self, other: Gas) -> Gas {
        Gas(self.0.saturating_sub(other.0))
    }

    /// Price of this much gas. Saturates instead of wrapping.
    pub fn to_value(self, price: Value) -> Value {
        Value((self.0 as u128).saturating_mul(price.0))
    }
}

impl fmt::Display for Gas {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Protocol minimum base fee per unit of gas.
pub const DEFAULT_GAS_PRICE: Value = Value(10);

/// Block gas limit the fee curve is normalized against.
pub const DEFAULT_GAS_LIMIT: Gas = Gas(30_000_000);

/// Default cap on gas executed by one proposal.
pub const DEFAULT_MAX_GAS_IN_BLOCK: Gas = Gas(200_000_000);

/// Gas budget for the `verifyExternal` static call.
pub const EXTERNAL_VERIFICATION_MAX_GAS: Gas = Gas(100_000);
