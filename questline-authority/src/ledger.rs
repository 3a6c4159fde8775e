//! Per-player server bookkeeping.
//!
//! A [`PlayerLedger`] owns the authoritative [`TaskQueue`] together with the
//! change history needed to decide whether a client operation raced a
//! change it has not seen. For each task it records the version at which
//! the task last changed (or was removed) and the operation that caused it;
//! the paused flag is tracked the same way. A bounded FIFO set remembers
//! the operation ids already consumed.

use std::collections::{HashMap, HashSet, VecDeque};

use questline_proto::operation::{OperationId, OperationKind};
use questline_proto::queue::TaskQueue;
use questline_proto::task::{PlayerId, Task, TaskId};

/// Default number of operation ids remembered per player before FIFO eviction.
pub const DEFAULT_MAX_SEEN_OPERATIONS: usize = 10_000;

/// Bounded set of consumed operation ids, oldest evicted first.
#[derive(Debug)]
pub struct SeenOperations {
    order: VecDeque<OperationId>,
    ids: HashSet<OperationId>,
    capacity: usize,
}

impl SeenOperations {
    /// Creates an empty set remembering at most `capacity` ids.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            ids: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    /// Returns `true` if `id` was consumed and not yet evicted.
    #[must_use]
    pub fn contains(&self, id: &OperationId) -> bool {
        self.ids.contains(id)
    }

    /// Records `id`. Returns `false` if it was already present.
    ///
    /// If the set exceeds its capacity, the oldest id is evicted (FIFO).
    pub fn insert(&mut self, id: OperationId) -> bool {
        if !self.ids.insert(id.clone()) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > self.capacity
            && let Some(oldest) = self.order.pop_front()
        {
            self.ids.remove(&oldest);
        }
        true
    }

    /// Number of remembered ids.
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Returns `true` if no id is remembered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// What a committed change touched.
#[derive(Debug, Default)]
pub struct ChangeSet {
    /// Tasks whose value changed or that disappeared.
    pub tasks: HashSet<TaskId>,
    /// Whether the paused flag flipped.
    pub run_state: bool,
}

/// The last change to a task or to the run state.
#[derive(Debug, Clone, Default)]
struct Change {
    version: u64,
    /// Client operation that caused it; `None` for server-side mutations.
    origin: Option<OperationId>,
}

impl Change {
    fn foreign_after(&self, version: u64, own: &HashSet<OperationId>) -> bool {
        self.version > version && self.origin.as_ref().is_none_or(|id| !own.contains(id))
    }
}

/// Authoritative state of one player.
#[derive(Debug)]
pub struct PlayerLedger {
    queue: TaskQueue,
    task_changes: HashMap<TaskId, Change>,
    run_state_changed: Change,
    seen: SeenOperations,
}

impl PlayerLedger {
    /// Creates an empty ledger for `player_id`.
    #[must_use]
    pub fn new(player_id: PlayerId, max_seen_operations: usize) -> Self {
        Self {
            queue: TaskQueue::new(player_id),
            task_changes: HashMap::new(),
            run_state_changed: Change::default(),
            seen: SeenOperations::new(max_seen_operations),
        }
    }

    /// The authoritative queue.
    #[must_use]
    pub const fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    /// Consumed operation ids.
    #[must_use]
    pub const fn seen(&self) -> &SeenOperations {
        &self.seen
    }

    /// Mutable access to the consumed operation ids.
    pub const fn seen_mut(&mut self) -> &mut SeenOperations {
        &mut self.seen
    }

    /// Returns `true` if the task changed or was removed after `version`
    /// by anything other than the operations in `own`.
    #[must_use]
    pub fn task_changed_after(&self, id: &TaskId, version: u64, own: &HashSet<OperationId>) -> bool {
        self.task_changes
            .get(id)
            .is_some_and(|change| change.foreign_after(version, own))
    }

    /// Returns `true` if the paused flag flipped after `version` by anything
    /// other than the operations in `own`.
    #[must_use]
    pub fn run_state_changed_after(&self, version: u64, own: &HashSet<OperationId>) -> bool {
        self.run_state_changed.foreign_after(version, own)
    }

    /// Applies `kind`, bumps the version and records what changed, crediting
    /// the change to `origin` (`None` for server-side mutations).
    ///
    /// Changes are detected by comparing the queue before and after, so
    /// side effects such as promoting the next task are recorded too.
    pub fn commit(
        &mut self,
        kind: &OperationKind,
        now: u64,
        origin: Option<&OperationId>,
    ) -> ChangeSet {
        let before: HashMap<TaskId, Task> = self
            .queue
            .tasks()
            .map(|t| (t.id.clone(), t.clone()))
            .collect();
        let was_paused = self.queue.is_paused;

        self.queue.apply(kind, now);
        self.queue.touch();
        let version = self.queue.version;

        let mut changes = ChangeSet::default();
        for (id, old) in &before {
            if self.queue.find_task(id) != Some(old) {
                changes.tasks.insert(id.clone());
            }
        }
        for task in self.queue.tasks() {
            if !before.contains_key(&task.id) {
                changes.tasks.insert(task.id.clone());
            }
        }
        let change = Change {
            version,
            origin: origin.cloned(),
        };
        for id in &changes.tasks {
            self.task_changes.insert(id.clone(), change.clone());
        }
        if was_paused != self.queue.is_paused {
            changes.run_state = true;
            self.run_state_changed = change;
        }
        changes
    }
}
