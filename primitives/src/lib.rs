//! `meridian-primitives`: foundational types for the Meridian sharded ledger.
//!
//! This crate provides the canonical value types, error codes, transactions,
//! blocks, the deterministic binary codec, the persistent Merkle trie, the
//! logs bloom, gas accounting and crypto helpers shared by storage, the
//! execution engine and the collator.

pub mod types;
pub mod error;
pub mod crypto;
pub mod codec;
pub mod transaction;
pub mod block;
pub mod bloom;
pub mod gas;
pub mod merkle;

// Re-export commonly used types at the crate root for convenience.
pub use types::{
    Address, BlockNumber, ChainId, Gas, Hash, Seqno, ShardId, TokenId, TransactionIndex, Value,
    DEFAULT_CHAIN_ID, DEFAULT_GAS_LIMIT, DEFAULT_GAS_PRICE, DEFAULT_MAX_GAS_IN_BLOCK,
    EXTERNAL_VERIFICATION_MAX_GAS, ZERO_HASH,
};
pub use error::{ErrorCode, ExecError, FatalError, FatalResult};
pub use codec::{Codec, CodecError};
pub use transaction::{
    AsyncContext, AsyncRequestInfo, AsyncResponsePayload, DeployPayload, ForwardKind,
    InternalTransactionPayload, OutboundTransaction, TokenBalance, Transaction, TransactionFlags,
    TransactionKind,
};
pub use block::{Block, BlockWithExtractedData, CollatorState, Log, Neighbor, Receipt, SmartContract};
pub use bloom::Bloom;
pub use gas::GasMeter;
pub use merkle::{MerkleTrie, NodeStore};
