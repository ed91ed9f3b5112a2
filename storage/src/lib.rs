//! `meridian-storage`: the transactional key-value layer under the ledger.
//!
//! This crate provides:
//!
//! - `Database` trait: a backend that hands out snapshots and applies atomic batches
//! - `Tx`: read-only / read-write transaction with a write overlay
//! - `StateStore` trait: read access to one committed snapshot
//! - `MemDb`: in-memory copy-on-write backend
//! - `Table` layout and typed accessors for blocks, indices, cursors and code
//! - `StorageError`: converts into the engine's `FatalError`

pub mod error;
pub mod state_store;
pub mod overlay;
pub mod mem_store;
pub mod tx;
pub mod tables;

// Re-export commonly used types at the crate root.
pub use error::StorageError;
pub use state_store::StateStore;
pub use overlay::{OverlayResult, StateOverlay};
pub use mem_store::{MemDb, MemSnapshot};
pub use tx::{create_ro_tx, create_rw_tx, Database, Tx, TxMode};
pub use tables::{Table, TxLocation};
