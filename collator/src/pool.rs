//! Transaction pool collaborator.
//!
//! The proposer only peeks: nothing leaves the pool while a proposal is
//! being built. Included transactions are evicted after their block is
//! committed ([`TxnPool::on_committed`]); duplicates and transactions that
//! fail validation are discarded right away ([`TxnPool::discard`]).

use std::collections::{HashSet, VecDeque};

use parking_lot::Mutex;

use meridian_primitives::{Hash, ShardId, Transaction};

use crate::error::PoolError;

/// Why transactions were thrown out of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// Already included in a block.
    DuplicateHash,
    /// Failed external validation.
    Unverified,
}

impl std::fmt::Display for DiscardReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateHash => f.write_str("duplicate hash"),
            Self::Unverified => f.write_str("unverified"),
        }
    }
}

pub trait TxnPool: Send + Sync {
    /// Up to `n` candidates in submission order, without removing them.
    fn peek(&self, n: usize) -> Result<Vec<Transaction>, PoolError>;

    /// Evict transactions included in a committed block.
    fn on_committed(&self, committed: &[Transaction]) -> Result<(), PoolError>;

    /// Evict transactions that will never be included.
    fn discard(&self, hashes: &[Hash], reason: DiscardReason) -> Result<(), PoolError>;
}

#[derive(Default)]
struct Inner {
    queue: VecDeque<(Hash, Transaction)>,
    hashes: HashSet<Hash>,
}

/// In-memory FIFO pool of one shard.
pub struct MemPool {
    shard_id: ShardId,
    capacity: usize,
    inner: Mutex<Inner>,
}

impl MemPool {
    pub fn new(shard_id: ShardId, capacity: usize) -> Self {
        Self {
            shard_id,
            capacity,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Queue `txn`. Returns `false` when an identical transaction is already
    /// pending.
    pub fn add(&self, txn: Transaction) -> Result<bool, PoolError> {
        let dest = txn.to.shard_id();
        if dest != self.shard_id {
            return Err(PoolError::WrongShard {
                expected: self.shard_id,
                got: dest,
            });
        }
        let hash = txn.hash();
        let mut inner = self.inner.lock();
        if inner.hashes.contains(&hash) {
            return Ok(false);
        }
        if inner.queue.len() >= self.capacity {
            return Err(PoolError::Full(self.capacity));
        }
        inner.hashes.insert(hash);
        inner.queue.push_back((hash, txn));
        tracing::trace!(shard_id = %self.shard_id, txn_hash = %hex::encode(hash), "transaction queued");
        Ok(true)
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.inner.lock().hashes.contains(hash)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove(&self, hashes: &HashSet<Hash>) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.queue.len();
        inner.queue.retain(|(hash, _)| !hashes.contains(hash));
        inner.hashes.retain(|hash| !hashes.contains(hash));
        before - inner.queue.len()
    }
}

impl TxnPool for MemPool {
    fn peek(&self, n: usize) -> Result<Vec<Transaction>, PoolError> {
        let inner = self.inner.lock();
        Ok(inner.queue.iter().take(n).map(|(_, txn)| txn.clone()).collect())
    }

    fn on_committed(&self, committed: &[Transaction]) -> Result<(), PoolError> {
        let hashes: HashSet<Hash> = committed.iter().map(Transaction::hash).collect();
        let removed = self.remove(&hashes);
        tracing::debug!(shard_id = %self.shard_id, removed, "committed transactions evicted");
        Ok(())
    }

    fn discard(&self, hashes: &[Hash], reason: DiscardReason) -> Result<(), PoolError> {
        let hashes: HashSet<Hash> = hashes.iter().copied().collect();
        let removed = self.remove(&hashes);
        tracing::debug!(shard_id = %self.shard_id, removed, %reason, "transactions discarded");
        Ok(())
    }
}

impl std::fmt::Debug for MemPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemPool")
            .field("shard_id", &self.shard_id)
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_primitives::{Address, Value};

    fn txn(seqno: u64) -> Transaction {
        Transaction {
            to: Address::from_shard_and_hash(ShardId(1), &[7u8; 32]),
            seqno,
            max_fee_per_gas: Value(100),
            ..Default::default()
        }
    }

    #[test]
    fn test_peek_keeps_submission_order() {
        let pool = MemPool::new(ShardId(1), 10);
        for seqno in 0..3 {
            assert!(pool.add(txn(seqno)).unwrap());
        }
        let peeked = pool.peek(2).unwrap();
        assert_eq!(peeked, vec![txn(0), txn(1)]);
        assert_eq!(pool.len(), 3);
    }

    #[test]
    fn test_duplicate_add_is_ignored() {
        let pool = MemPool::new(ShardId(1), 10);
        assert!(pool.add(txn(0)).unwrap());
        assert!(!pool.add(txn(0)).unwrap());
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_capacity_and_shard_are_enforced() {
        let pool = MemPool::new(ShardId(1), 1);
        pool.add(txn(0)).unwrap();
        assert!(matches!(pool.add(txn(1)), Err(PoolError::Full(1))));

        let other = MemPool::new(ShardId(2), 1);
        assert!(matches!(other.add(txn(0)), Err(PoolError::WrongShard { .. })));
    }

    #[test]
    fn test_commit_and_discard_evict() {
        let pool = MemPool::new(ShardId(1), 10);
        for seqno in 0..3 {
            pool.add(txn(seqno)).unwrap();
        }
        pool.on_committed(&[txn(0)]).unwrap();
        pool.discard(&[txn(2).hash()], DiscardReason::Unverified).unwrap();
        assert_eq!(pool.peek(10).unwrap(), vec![txn(1)]);
        assert!(!pool.contains(&txn(0).hash()));
    }
}
