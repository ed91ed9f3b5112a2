//! Reversible mutation log.
//!
//! Every state mutation made through an execution state pushes one
//! [`JournalEntry`] carrying the value it overwrote. Entries name accounts by
//! address, never by handle. Reverting a revision pops the suffix and hands it
//! back newest-first; the owner of the state applies the undo.

use meridian_primitives::{Address, AsyncContext, Hash, Seqno, TokenId, Value};

/// Identifier returned by [`Journal::snapshot`].
pub type RevisionId = usize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalEntry {
    CreateAccount {
        address: Address,
    },
    CreateContract {
        address: Address,
    },
    SelfDestruct {
        address: Address,
        prev: bool,
        prev_balance: Value,
    },
    Balance {
        address: Address,
        prev: Value,
    },
    /// `prev == None` means the token was not cached before the write.
    Token {
        address: Address,
        token: TokenId,
        prev: Option<Value>,
    },
    Seqno {
        address: Address,
        prev: Seqno,
    },
    ExtSeqno {
        address: Address,
        prev: Seqno,
    },
    Code {
        address: Address,
        prev_hash: Hash,
        prev_code: Vec<u8>,
    },
    Storage {
        address: Address,
        key: Hash,
        prev: Hash,
    },
    /// Outer `None`: the request id was not cached. Inner `None`: cached as removed.
    AsyncContext {
        address: Address,
        request_id: u64,
        prev: Option<Option<AsyncContext>>,
    },
    RequestId {
        address: Address,
        prev: u64,
    },
    TransientStorage {
        address: Address,
        key: Hash,
        prev: Hash,
    },
    Refund {
        prev: u64,
    },
    AddLog {
        txn_hash: Hash,
    },
    OutTransaction {
        parent: Hash,
        index: usize,
    },
}

#[derive(Debug, Clone, Copy)]
struct Revision {
    id: RevisionId,
    journal_index: usize,
}

#[derive(Debug, Default)]
pub struct Journal {
    entries: Vec<JournalEntry>,
    revisions: Vec<Revision>,
    next_id: RevisionId,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, entry: JournalEntry) {
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Record the current journal length under a fresh revision id.
    pub fn snapshot(&mut self) -> RevisionId {
        let id = self.next_id;
        self.next_id += 1;
        self.revisions.push(Revision {
            id,
            journal_index: self.entries.len(),
        });
        id
    }

    /// Drop every entry recorded after `id` and return them newest-first.
    ///
    /// `id` and every later revision become invalid.
    ///
    /// # Panics
    ///
    /// If `id` was never returned by [`snapshot`](Self::snapshot) or has
    /// already been reverted.
    pub fn revert_to(&mut self, id: RevisionId) -> Vec<JournalEntry> {
        let idx = self.revisions.partition_point(|r| r.id < id);
        if idx == self.revisions.len() || self.revisions[idx].id != id {
            panic!("revision id {id} cannot be reverted");
        }
        let journal_index = self.revisions[idx].journal_index;
        self.revisions.truncate(idx);

        let mut undone = self.entries.split_off(journal_index);
        undone.reverse();
        undone
    }

    /// Forget `id` and every later revision, keeping their entries. Ids
    /// that are already gone are ignored.
    pub fn release(&mut self, id: RevisionId) {
        let idx = self.revisions.partition_point(|r| r.id < id);
        self.revisions.truncate(idx);
    }

    pub fn revisions(&self) -> usize {
        self.revisions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn balance(prev: u128) -> JournalEntry {
        JournalEntry::Balance {
            address: Address::EMPTY,
            prev: Value(prev),
        }
    }

    #[test]
    fn test_revert_returns_suffix_newest_first() {
        let mut journal = Journal::new();
        journal.append(balance(1));
        let id = journal.snapshot();
        journal.append(balance(2));
        journal.append(balance(3));

        let undone = journal.revert_to(id);
        assert_eq!(undone, vec![balance(3), balance(2)]);
        assert_eq!(journal.len(), 1);
    }

    #[test]
    fn test_nested_revisions() {
        let mut journal = Journal::new();
        let outer = journal.snapshot();
        journal.append(balance(1));
        let inner = journal.snapshot();
        journal.append(balance(2));

        assert_eq!(journal.revert_to(inner).len(), 1);
        journal.append(balance(4));
        assert_eq!(journal.revert_to(outer), vec![balance(4), balance(1)]);
        assert!(journal.is_empty());
    }

    #[test]
    #[should_panic(expected = "cannot be reverted")]
    fn test_double_revert_panics() {
        let mut journal = Journal::new();
        let id = journal.snapshot();
        journal.append(balance(1));
        journal.revert_to(id);
        journal.revert_to(id);
    }

    #[test]
    #[should_panic(expected = "cannot be reverted")]
    fn test_unknown_revision_panics() {
        let mut journal = Journal::new();
        journal.snapshot();
        journal.revert_to(7);
    }

    #[test]
    fn test_release_keeps_entries_and_outer_revisions() {
        let mut journal = Journal::new();
        let outer = journal.snapshot();
        journal.append(balance(1));
        let inner = journal.snapshot();
        journal.snapshot();
        journal.append(balance(2));
        assert_eq!(journal.revisions(), 3);

        journal.release(inner);
        assert_eq!(journal.revisions(), 1);
        assert_eq!(journal.len(), 2);
        journal.release(inner);
        assert_eq!(journal.revisions(), 1);

        assert_eq!(journal.revert_to(outer), vec![balance(2), balance(1)]);
        assert_eq!(journal.revisions(), 0);
    }

    #[test]
    #[should_panic(expected = "cannot be reverted")]
    fn test_released_revision_cannot_be_reverted() {
        let mut journal = Journal::new();
        let id = journal.snapshot();
        journal.append(balance(1));
        journal.release(id);
        journal.revert_to(id);
    }

    #[test]
    #[should_panic(expected = "cannot be reverted")]
    fn test_reverting_outer_invalidates_inner() {
        let mut journal = Journal::new();
        let outer = journal.snapshot();
        let inner = journal.snapshot();
        journal.revert_to(outer);
        journal.revert_to(inner);
    }
}
