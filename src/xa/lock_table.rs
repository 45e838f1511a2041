//! Exclusive write locks on records, held by a transaction from the first
//! time it loads a record for change until it commits or rolls back.
//!
//! Locks never wait. A transaction touching a record another open
//! transaction holds gets [`StoreError::WriteConflict`] straight away, so
//! lock cycles cannot form.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::trace;

use crate::types::{NodeId, PropertyId, RelId, Result, StoreError};

/// A lockable record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LockedRecord {
    /// A node record.
    Node(NodeId),
    /// A relationship record.
    Relationship(RelId),
    /// A property record.
    Property(PropertyId),
}

impl fmt::Display for LockedRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockedRecord::Node(id) => write!(f, "node {id}"),
            LockedRecord::Relationship(id) => write!(f, "relationship {id}"),
            LockedRecord::Property(id) => write!(f, "property {id}"),
        }
    }
}

/// Outcome of a successful [`LockTable::try_lock`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockOutcome {
    /// The lock was free and is now held.
    Acquired,
    /// The caller held it already.
    AlreadyHeld,
}

/// Record locks of one data source, owned by transaction log identifiers.
#[derive(Default)]
pub struct LockTable {
    held: Mutex<HashMap<LockedRecord, u32>>,
    conflicts: AtomicU64,
}

impl LockTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes `record` for `owner`, failing if another owner holds it.
    pub fn try_lock(&self, record: LockedRecord, owner: u32) -> Result<LockOutcome> {
        let mut held = self.held.lock();
        match held.get(&record) {
            Some(&holder) if holder == owner => Ok(LockOutcome::AlreadyHeld),
            Some(&holder) => {
                self.conflicts.fetch_add(1, Ordering::Relaxed);
                trace!(%record, owner, holder, "xa.lock.conflict");
                Err(StoreError::WriteConflict {
                    record: record.to_string(),
                    holder,
                })
            }
            None => {
                held.insert(record, owner);
                Ok(LockOutcome::Acquired)
            }
        }
    }

    /// Releases `record` if `owner` holds it.
    pub fn unlock(&self, record: LockedRecord, owner: u32) -> bool {
        let mut held = self.held.lock();
        if held.get(&record) == Some(&owner) {
            held.remove(&record);
            true
        } else {
            false
        }
    }

    /// Releases every lock in `records` that `owner` holds.
    pub fn release(&self, owner: u32, records: impl IntoIterator<Item = LockedRecord>) -> usize {
        let mut held = self.held.lock();
        let mut released = 0;
        for record in records {
            if held.get(&record) == Some(&owner) {
                held.remove(&record);
                released += 1;
            }
        }
        released
    }

    /// Owner of the lock on `record`, if any.
    pub fn holder(&self, record: LockedRecord) -> Option<u32> {
        self.held.lock().get(&record).copied()
    }

    /// Number of locks held.
    pub fn len(&self) -> usize {
        self.held.lock().len()
    }

    /// True when no lock is held.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lock requests refused since the table was created.
    pub fn conflicts(&self) -> u64 {
        self.conflicts.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_owner_is_refused_until_release() {
        let table = LockTable::new();
        let node = LockedRecord::Node(NodeId(7));
        assert_eq!(table.try_lock(node, 1).unwrap(), LockOutcome::Acquired);
        assert_eq!(table.try_lock(node, 1).unwrap(), LockOutcome::AlreadyHeld);
        match table.try_lock(node, 2) {
            Err(StoreError::WriteConflict { record, holder }) => {
                assert_eq!(record, "node 7");
                assert_eq!(holder, 1);
            }
            other => panic!("expected a write conflict, got {other:?}"),
        }
        assert_eq!(table.conflicts(), 1);
        assert!(!table.unlock(node, 2));
        assert_eq!(table.holder(node), Some(1));

        assert_eq!(table.release(1, [node, LockedRecord::Property(PropertyId(0))]), 1);
        assert!(table.is_empty());
        assert_eq!(table.try_lock(node, 2).unwrap(), LockOutcome::Acquired);
    }

    #[test]
    fn record_kinds_do_not_collide() {
        let table = LockTable::new();
        table.try_lock(LockedRecord::Node(NodeId(0)), 1).unwrap();
        table.try_lock(LockedRecord::Relationship(RelId(0)), 2).unwrap();
        table.try_lock(LockedRecord::Property(PropertyId(0)), 3).unwrap();
        assert_eq!(table.len(), 3);
        assert!(table.unlock(LockedRecord::Relationship(RelId(0)), 2));
        assert_eq!(table.holder(LockedRecord::Node(NodeId(0))), Some(1));
    }
}
