//! The pending-request priority queue.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

use crate::message::{RequestKey, Transaction};

/// Where a queued request came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Our own outstanding request. Reply accounting for it lives in the
    /// coordinator, not here.
    Local,
    /// A peer's request, removed when its release arrives.
    Remote,
}

/// One pending request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub key: RequestKey,
    pub transaction: Transaction,
    pub origin: Origin,
}

/// Priority queue of pending requests, ordered by `(time, initiator)`.
///
/// Every replica maintains one of these; because the key order is a total
/// order agreed on by construction, all replicas drain it identically.
#[derive(Debug, Clone, Default)]
pub struct RequestQueue {
    entries: BTreeMap<RequestKey, QueueEntry>,
}

impl RequestQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry, rejecting duplicates. Returns whether it was
    /// actually added.
    pub fn insert(&mut self, entry: QueueEntry) -> bool {
        match self.entries.entry(entry.key) {
            Entry::Vacant(slot) => {
                slot.insert(entry);
                true
            }
            Entry::Occupied(_) => false,
        }
    }

    /// Remove by key. Absent keys are fine — duplicate releases are
    /// expected under transport retry.
    pub fn remove(&mut self, key: &RequestKey) -> Option<QueueEntry> {
        self.entries.remove(key)
    }

    /// The entry with the smallest key, if any.
    #[must_use]
    pub fn peek_min(&self) -> Option<&QueueEntry> {
        self.entries.values().next()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Ordered snapshot for inspection.
    #[must_use]
    pub fn snapshot(&self) -> Vec<QueueEntry> {
        self.entries.values().cloned().collect()
    }
}
