//! Read access to a consistent view of the key space.
//!
//! A [`StateStore`] is what a transaction reads through before consulting its
//! own write overlay: a snapshot of committed state that never changes
//! underneath the reader.

use crate::error::StorageError;

/// Abstraction over one committed snapshot.
///
/// Implementations must be deterministic: the same key always returns the
/// same value for the lifetime of the snapshot.
pub trait StateStore: Send + Sync {
    /// Returns `Ok(None)` if the key does not exist.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError>;

    /// Default implementation uses `get()`, but backends may optimize this.
    fn contains(&self, key: &[u8]) -> Result<bool, StorageError> {
        Ok(self.get(key)?.is_some())
    }

    /// Every entry whose key starts with `prefix`, in key order.
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError>;
}
