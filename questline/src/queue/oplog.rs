//! Bounded, append-only log of local mutation intents.

use std::collections::{HashSet, VecDeque};

use questline_proto::operation::{Operation, OperationId, OperationType};
use serde::{Deserialize, Serialize};

/// Default number of entries kept before the oldest are evicted.
pub const DEFAULT_MAX_OPERATIONS: usize = 1000;

/// What an [`OperationLog::append`] displaced.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct AppendOutcome {
    /// Earlier unapplied reorders replaced by the new one.
    pub superseded: Vec<OperationId>,
    /// Unapplied entries lost to the capacity limit.
    pub evicted_unapplied: Vec<OperationId>,
}

/// Operations in the order they were recorded.
///
/// Applied entries stay until they age out so the log doubles as a short
/// history; only unapplied entries are sent to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationLog {
    entries: VecDeque<Operation>,
    capacity: usize,
}

impl Default for OperationLog {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_MAX_OPERATIONS)
    }
}

impl OperationLog {
    /// Creates an empty log holding at most `capacity` entries.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Changes the capacity, evicting the oldest entries if needed.
    pub fn set_capacity(&mut self, capacity: usize) -> Vec<OperationId> {
        self.capacity = capacity.max(1);
        self.evict()
    }

    /// Maximum number of entries.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Appends `op`.
    ///
    /// A reorder removes every earlier unapplied reorder, since only the
    /// latest ordering matters. Past capacity the oldest entries are dropped
    /// whether or not they were applied.
    pub fn append(&mut self, op: Operation) -> AppendOutcome {
        let mut outcome = AppendOutcome::default();
        if op.op_type() == OperationType::ReorderTasks {
            self.entries.retain(|existing| {
                let stale = !existing.applied && existing.op_type() == OperationType::ReorderTasks;
                if stale {
                    outcome.superseded.push(existing.id.clone());
                }
                !stale
            });
        }
        self.entries.push_back(op);
        outcome.evicted_unapplied = self.evict();
        outcome
    }

    fn evict(&mut self) -> Vec<OperationId> {
        let mut lost = Vec::new();
        while self.entries.len() > self.capacity {
            if let Some(old) = self.entries.pop_front()
                && !old.applied
            {
                lost.push(old.id);
            }
        }
        lost
    }

    /// Unapplied operations in log order.
    pub fn pending(&self) -> impl Iterator<Item = &Operation> {
        self.entries.iter().filter(|op| !op.applied)
    }

    /// Number of unapplied operations.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending().count()
    }

    /// Marks every listed operation as applied. Ids the log no longer holds
    /// are ignored. Returns how many entries changed.
    pub fn mark_applied(&mut self, ids: &[OperationId]) -> usize {
        let ids: HashSet<&OperationId> = ids.iter().collect();
        let mut marked = 0;
        for op in self.entries.iter_mut().filter(|op| !op.applied) {
            if ids.contains(&op.id) {
                op.applied = true;
                marked += 1;
            }
        }
        marked
    }

    /// Removes one entry. Returns it if it was present.
    pub fn drop_operation(&mut self, id: &OperationId) -> Option<Operation> {
        let pos = self.entries.iter().position(|op| op.id == *id)?;
        self.entries.remove(pos)
    }

    /// Total entries, applied or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the log holds nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All entries, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &Operation> {
        self.entries.iter()
    }
}
