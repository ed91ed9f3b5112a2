//! Write buffer of a storage transaction.
//!
//! Writes are buffered here and made visible to later reads through the same
//! transaction. A read-write transaction hands the buffer to the backend as
//! one batch on commit; rollback simply drops it.

use std::collections::BTreeMap;

/// Buffered writes overlaying a committed snapshot.
///
/// Uses `BTreeMap` so batches and prefix scans come out in key order.
#[derive(Debug, Clone, Default)]
pub struct StateOverlay {
    /// key → Some(value) for puts, key → None for deletions.
    writes: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

/// Result of looking up a key in the overlay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OverlayResult {
    Found(Vec<u8>),
    /// Key was explicitly deleted in this overlay.
    Deleted,
    /// Key is not in the overlay; the caller must check the snapshot.
    NotInOverlay,
}

impl StateOverlay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.writes.insert(key, Some(value));
    }

    /// Subsequent reads for this key return `Deleted` rather than falling
    /// through to the snapshot.
    pub fn delete(&mut self, key: Vec<u8>) {
        self.writes.insert(key, None);
    }

    pub fn get(&self, key: &[u8]) -> OverlayResult {
        match self.writes.get(key) {
            Some(Some(value)) => OverlayResult::Found(value.clone()),
            Some(None) => OverlayResult::Deleted,
            None => OverlayResult::NotInOverlay,
        }
    }

    /// Buffered entries under `prefix`, deletions included.
    pub fn range_prefix<'a>(
        &'a self,
        prefix: &'a [u8],
    ) -> impl Iterator<Item = (&'a Vec<u8>, &'a Option<Vec<u8>>)> + 'a {
        self.writes
            .range(prefix.to_vec()..)
            .take_while(move |(k, _)| k.starts_with(prefix))
    }

    /// Consume the overlay and return all buffered writes, sorted by key.
    pub fn drain(self) -> BTreeMap<Vec<u8>, Option<Vec<u8>>> {
        self.writes
    }

    /// Number of keys touched (set or deleted).
    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }
}
