//! In-memory database.
//!
//! `MemDb` keeps the whole key space in a `BTreeMap` behind an `Arc`. A
//! snapshot is a clone of the `Arc`, so readers never block writers and see
//! a consistent prior state. Committing a batch copies the map only while a
//! snapshot of it is still alive.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::StorageError;
use crate::state_store::StateStore;
use crate::tx::Database;

type Map = BTreeMap<Vec<u8>, Vec<u8>>;

/// Immutable view of a `MemDb` at one point in time.
#[derive(Debug, Clone, Default)]
pub struct MemSnapshot {
    data: Arc<Map>,
}

impl StateStore for MemSnapshot {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.data.get(key).cloned())
    }

    fn contains(&self, key: &[u8]) -> Result<bool, StorageError> {
        Ok(self.data.contains_key(key))
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        Ok(self
            .data
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

/// Transactional in-memory key-value store.
#[derive(Debug, Default)]
pub struct MemDb {
    data: RwLock<Arc<Map>>,
}

impl MemDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convenience for callers that pass the database around as a trait object.
    pub fn shared() -> Arc<dyn Database> {
        Arc::new(Self::new())
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

impl Database for MemDb {
    fn snapshot(&self) -> Arc<dyn StateStore> {
        Arc::new(MemSnapshot {
            data: Arc::clone(&self.data.read()),
        })
    }

    fn write_batch(&self, writes: BTreeMap<Vec<u8>, Option<Vec<u8>>>) -> Result<(), StorageError> {
        let mut guard = self.data.write();
        let map = Arc::make_mut(&mut guard);
        for (key, value) in writes {
            match value {
                Some(v) => {
                    map.insert(key, v);
                }
                None => {
                    map.remove(&key);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(entries: &[(&[u8], Option<&[u8]>)]) -> BTreeMap<Vec<u8>, Option<Vec<u8>>> {
        entries
            .iter()
            .map(|(k, v)| (k.to_vec(), v.map(|v| v.to_vec())))
            .collect()
    }

    #[test]
    fn test_empty_db() {
        let db = MemDb::new();
        assert!(db.is_empty());
        let snap = db.snapshot();
        assert_eq!(snap.get(b"missing").unwrap(), None);
        assert!(!snap.contains(b"missing").unwrap());
    }

    #[test]
    fn test_snapshot_isolation() {
        let db = MemDb::new();
        db.write_batch(batch(&[(b"k", Some(b"v1"))])).unwrap();
        let before = db.snapshot();

        db.write_batch(batch(&[(b"k", Some(b"v2")), (b"x", Some(b"1"))])).unwrap();
        assert_eq!(before.get(b"k").unwrap(), Some(b"v1".to_vec()));
        assert_eq!(before.get(b"x").unwrap(), None);
        assert_eq!(db.snapshot().get(b"k").unwrap(), Some(b"v2".to_vec()));
    }

    #[test]
    fn test_batch_delete() {
        let db = MemDb::new();
        db.write_batch(batch(&[(b"a", Some(b"1")), (b"b", Some(b"2"))])).unwrap();
        db.write_batch(batch(&[(b"a", None)])).unwrap();
        assert_eq!(db.len(), 1);
        assert_eq!(db.snapshot().get(b"a").unwrap(), None);
    }

    #[test]
    fn test_scan_prefix() {
        let db = MemDb::new();
        db.write_batch(batch(&[
            (b"p\x01", Some(b"1")),
            (b"p\x02", Some(b"2")),
            (b"q\x01", Some(b"3")),
        ]))
        .unwrap();
        let entries = db.snapshot().scan_prefix(b"p").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].1, b"1".to_vec());
    }
}
