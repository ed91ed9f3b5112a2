//! Receipts of external transactions that never made it into a block.
//!
//! A transaction rejected by validation or dropped after burning no gas has
//! no on-chain receipt. Its failure is kept here, bounded, so clients can
//! still learn why it disappeared.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

use meridian_primitives::{Hash, Receipt};

use crate::result::ExecutionResult;

/// Capacity used by the node.
pub const DEFAULT_FAILURE_RECEIPTS: usize = 1000;

/// Shared bounded map from transaction hash to its failure receipt.
#[derive(Clone)]
pub struct FailureReceiptCache {
    inner: Arc<Mutex<LruCache<Hash, Receipt>>>,
}

impl FailureReceiptCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Arc::new(Mutex::new(LruCache::new(capacity))),
        }
    }

    /// Record the failure of `txn_hash` described by `res`.
    pub fn add(&self, txn_hash: Hash, res: &ExecutionResult) {
        let receipt = Receipt {
            success: false,
            status: res.status(),
            gas_used: res.gas_used,
            txn_hash,
            failed_pc: res.failed_pc,
            ..Default::default()
        };
        tracing::debug!(
            txn_hash = %hex::encode(txn_hash),
            status = %receipt.status,
            "failure receipt recorded"
        );
        self.inner.lock().put(txn_hash, receipt);
    }

    pub fn get(&self, txn_hash: &Hash) -> Option<Receipt> {
        self.inner.lock().get(txn_hash).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for FailureReceiptCache {
    fn default() -> Self {
        Self::new(DEFAULT_FAILURE_RECEIPTS)
    }
}

impl std::fmt::Debug for FailureReceiptCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailureReceiptCache").field("len", &self.len()).finish()
    }
}
