//! Storage-side error type.
//!
//! Every storage failure is fatal to the block being built: it converts into
//! [`FatalError`] and aborts the enclosing proposal or block generation.

use meridian_primitives::{CodecError, FatalError};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    /// Commit attempted on a read-only transaction.
    #[error("transaction is read-only")]
    ReadOnly,

    /// Backend I/O failure.
    #[error("backend failure: {0}")]
    Backend(String),

    /// Stored bytes failed to decode.
    #[error("corrupt record: {0}")]
    Codec(#[from] CodecError),
}

impl From<StorageError> for FatalError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::Codec(c) => FatalError::Codec(c),
            other => FatalError::Storage(other.to_string()),
        }
    }
}
