//! Restores sampling order over results that complete out of order.

use std::collections::BTreeMap;

/// Holds results that arrived ahead of the next sequence number to deliver.
///
/// Everything held has a sequence number `>= next`; the entry for `next`
/// itself is handed out by [`pop_ready`](Self::pop_ready) as soon as it is
/// present.
#[derive(Debug)]
pub(crate) struct PendingBuffer<T> {
    next: u64,
    pending: BTreeMap<u64, T>,
}

impl<T> Default for PendingBuffer<T> {
    fn default() -> Self {
        Self {
            next: 0,
            pending: BTreeMap::new(),
        }
    }
}

impl<T> PendingBuffer<T> {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// The sequence number the consumer is waiting for.
    pub(crate) fn next_seq(&self) -> u64 {
        self.next
    }

    /// Stores `item`. Returns `false`, dropping the item, for a sequence
    /// number that was already delivered or is already held.
    pub(crate) fn insert(&mut self, seq: u64, item: T) -> bool {
        if seq < self.next || self.pending.contains_key(&seq) {
            return false;
        }
        self.pending.insert(seq, item);
        true
    }

    /// Takes the in-order entry, if it has arrived, and advances.
    pub(crate) fn pop_ready(&mut self) -> Option<(u64, T)> {
        let seq = self.next;
        let item = self.pending.remove(&seq)?;
        self.next += 1;
        Some((seq, item))
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.pending.clear();
    }
}
