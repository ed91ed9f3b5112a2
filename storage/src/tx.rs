//! Storage transactions.
//!
//! A [`Tx`] reads a fixed snapshot through its own write overlay. Read-write
//! transactions publish the overlay as one atomic batch on [`Tx::commit`];
//! read-only transactions may still buffer scratch writes (trie nodes of a
//! speculative block, for instance) but can never commit them.

use std::collections::BTreeMap;
use std::sync::Arc;

use meridian_primitives::merkle::NodeStore;
use meridian_primitives::{FatalResult, Hash};

use crate::error::StorageError;
use crate::overlay::{OverlayResult, StateOverlay};
use crate::state_store::StateStore;
use crate::tables::node_key;

/// A transactional key-value backend.
pub trait Database: Send + Sync {
    /// A consistent view of the committed key space.
    fn snapshot(&self) -> Arc<dyn StateStore>;

    /// Apply a batch atomically. `None` deletes the key.
    fn write_batch(&self, writes: BTreeMap<Vec<u8>, Option<Vec<u8>>>) -> Result<(), StorageError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxMode {
    ReadOnly,
    ReadWrite,
}

/// Open a transaction that never publishes its writes.
pub fn create_ro_tx(db: &Arc<dyn Database>) -> Tx {
    Tx::open(db, TxMode::ReadOnly)
}

/// Open a transaction whose writes are published on commit.
pub fn create_rw_tx(db: &Arc<dyn Database>) -> Tx {
    Tx::open(db, TxMode::ReadWrite)
}

pub struct Tx {
    db: Arc<dyn Database>,
    snapshot: Arc<dyn StateStore>,
    overlay: StateOverlay,
    mode: TxMode,
}

impl Tx {
    fn open(db: &Arc<dyn Database>, mode: TxMode) -> Self {
        Self {
            db: Arc::clone(db),
            snapshot: db.snapshot(),
            overlay: StateOverlay::new(),
            mode,
        }
    }

    pub fn mode(&self) -> TxMode {
        self.mode
    }

    pub fn is_read_only(&self) -> bool {
        self.mode == TxMode::ReadOnly
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        match self.overlay.get(key) {
            OverlayResult::Found(v) => Ok(Some(v)),
            OverlayResult::Deleted => Ok(None),
            OverlayResult::NotInOverlay => self.snapshot.get(key),
        }
    }

    pub fn contains(&self, key: &[u8]) -> Result<bool, StorageError> {
        Ok(self.get(key)?.is_some())
    }

    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.overlay.set(key, value);
    }

    pub fn delete(&mut self, key: Vec<u8>) {
        self.overlay.delete(key);
    }

    /// Merged view of snapshot and overlay under `prefix`, in key order.
    pub fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> =
            self.snapshot.scan_prefix(prefix)?.into_iter().collect();
        for (key, value) in self.overlay.range_prefix(prefix) {
            match value {
                Some(v) => {
                    merged.insert(key.clone(), v.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }
        Ok(merged.into_iter().collect())
    }

    /// Number of keys written so far.
    pub fn pending_writes(&self) -> usize {
        self.overlay.len()
    }

    /// Publish every buffered write as one batch.
    pub fn commit(self) -> Result<(), StorageError> {
        if self.is_read_only() {
            return Err(StorageError::ReadOnly);
        }
        let writes = self.overlay.drain();
        tracing::trace!(keys = writes.len(), "committing storage transaction");
        self.db.write_batch(writes)
    }

    /// Drop every buffered write.
    pub fn rollback(self) {}
}

impl NodeStore for Tx {
    fn get_node(&self, hash: &Hash) -> FatalResult<Option<Vec<u8>>> {
        Ok(self.get(&node_key(hash))?)
    }

    fn put_node(&mut self, hash: Hash, bytes: Vec<u8>) -> FatalResult<()> {
        self.put(node_key(&hash), bytes);
        Ok(())
    }
}

impl std::fmt::Debug for Tx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tx")
            .field("mode", &self.mode)
            .field("pending_writes", &self.overlay.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem_store::MemDb;

    #[test]
    fn test_rw_commit_publishes() {
        let db = MemDb::shared();
        let mut tx = create_rw_tx(&db);
        tx.put(b"k".to_vec(), b"v".to_vec());
        assert_eq!(tx.get(b"k").unwrap(), Some(b"v".to_vec()));

        let reader = create_ro_tx(&db);
        assert_eq!(reader.get(b"k").unwrap(), None);

        tx.commit().unwrap();
        assert_eq!(create_ro_tx(&db).get(b"k").unwrap(), Some(b"v".to_vec()));
        // The old reader keeps its snapshot.
        assert_eq!(reader.get(b"k").unwrap(), None);
    }

    #[test]
    fn test_rollback_discards() {
        let db = MemDb::shared();
        let mut tx = create_rw_tx(&db);
        tx.put(b"k".to_vec(), b"v".to_vec());
        tx.rollback();
        assert_eq!(create_ro_tx(&db).get(b"k").unwrap(), None);
    }

    #[test]
    fn test_read_only_cannot_commit() {
        let db = MemDb::shared();
        let mut tx = create_ro_tx(&db);
        tx.put(b"scratch".to_vec(), b"1".to_vec());
        assert_eq!(tx.get(b"scratch").unwrap(), Some(b"1".to_vec()));
        assert_eq!(tx.commit(), Err(StorageError::ReadOnly));
        assert_eq!(create_ro_tx(&db).get(b"scratch").unwrap(), None);
    }

    #[test]
    fn test_delete_hides_snapshot_value() {
        let db = MemDb::shared();
        let mut tx = create_rw_tx(&db);
        tx.put(b"a1".to_vec(), b"x".to_vec());
        tx.put(b"a2".to_vec(), b"y".to_vec());
        tx.commit().unwrap();

        let mut tx = create_rw_tx(&db);
        tx.delete(b"a1".to_vec());
        tx.put(b"a3".to_vec(), b"z".to_vec());
        assert_eq!(tx.get(b"a1").unwrap(), None);
        let keys: Vec<_> = tx.scan_prefix(b"a").unwrap().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![b"a2".to_vec(), b"a3".to_vec()]);
    }
}
