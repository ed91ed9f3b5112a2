//! `meridian-engine`: deterministic per-shard execution.
//!
//! This crate implements the state transition of one shard:
//! `f(prev_block, proposal) -> (block, receipts, outbound transactions)`.
//!
//! Transactions are applied one at a time to an [`ExecutionState`], which
//! journals every mutation so a failed transaction is rolled back exactly.
//! The [`BlockGenerator`] replays a [`Proposal`] through it and commits the
//! resulting block in a single storage transaction.
//!
//! ## Architecture
//!
//! - [`journal`]: reversible log of state mutations
//! - [`account`]: per-account cached state with lazy storage tries
//! - [`fee`]: base-fee curve and priority fee
//! - [`payer`]: who pays for a transaction's gas
//! - [`vm`]: VM collaborator trait and the reference interpreter
//! - [`config`]: main-shard parameters in the config trie
//! - [`execution_state`]: transaction handling and block building
//! - [`validation`]: admission checks for external and deploy transactions
//! - [`block_generator`]: proposal replay, indices and commit
//! - [`state_accessor`]: cached read access to stored blocks
//! - [`failure_receipts`]: receipts of transactions that never entered a block
//! - [`zerostate`]: genesis state

pub mod account;
pub mod block_generator;
pub mod config;
pub mod execution_state;
pub mod failure_receipts;
pub mod fee;
pub mod journal;
pub mod payer;
pub mod proposal;
pub mod result;
pub mod state_accessor;
pub mod tries;
pub mod validation;
pub mod vm;
pub mod zerostate;

pub use block_generator::{BlockCounters, BlockGenerator, BlockGeneratorParams};
pub use config::ConfigAccessor;
pub use execution_state::{BlockGenerationResult, ExecutionParams, ExecutionState};
pub use failure_receipts::FailureReceiptCache;
pub use fee::{FeeCalculator, MainFeeCalculator};
pub use payer::Payer;
pub use proposal::Proposal;
pub use result::{ExecutionResult, TxnError, TxnResult};
pub use state_accessor::StateAccessor;
pub use validation::validate_external_transaction;
pub use vm::{Interpreter, Vm, VmHost};
pub use zerostate::ZeroStateConfig;
