//! Change sets describing how a pin's photo list moved during one pass.
//!
//! A [`ChangeTracker`] is owned by exactly one reconciliation pass: it is reset
//! when the pass starts, collects positions as mutations are discovered and is
//! drained into a [`ChangeSet`] when the pass ends. Deleted positions refer to
//! the list as it was before the pass, inserted and updated positions to the
//! list after it.

/// Positions inserted, deleted and updated in a pin's ordered photo list
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub inserted: Vec<usize>,
    pub deleted: Vec<usize>,
    pub updated: Vec<usize>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.deleted.is_empty() && self.updated.is_empty()
    }

    /// Total number of recorded positions
    pub fn len(&self) -> usize {
        self.inserted.len() + self.deleted.len() + self.updated.len()
    }
}

/// Accumulates positions in discovery order
#[derive(Debug, Default)]
pub struct ChangeTracker {
    pending: ChangeSet,
}

impl ChangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&mut self) {
        self.pending = ChangeSet::default();
    }

    pub fn record_insert(&mut self, position: usize) {
        self.pending.inserted.push(position);
    }

    pub fn record_delete(&mut self, position: usize) {
        self.pending.deleted.push(position);
    }

    pub fn record_update(&mut self, position: usize) {
        self.pending.updated.push(position);
    }

    /// Hands back everything recorded since `begin` and clears the tracker
    pub fn finish(&mut self) -> ChangeSet {
        std::mem::take(&mut self.pending)
    }
}
