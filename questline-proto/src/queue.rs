//! The per-player task queue aggregate.
//!
//! [`TaskQueue::apply`] holds the replay rules shared by the client (for
//! optimistic local mutation and post-sync replay) and the authority (for
//! applying synchronized operations), so both replicas evolve identically.

use serde::{Deserialize, Serialize};

use crate::operation::OperationKind;
use crate::task::{PlayerId, Task, TaskId};

/// The run-state fields compared by `queue_state_changed` conflicts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStateSnapshot {
    /// Whether a task is actively running.
    pub is_running: bool,
    /// Whether the player paused the queue.
    pub is_paused: bool,
    /// The task occupying the active slot.
    pub current_task_id: Option<TaskId>,
}

/// A player's task queue: an active slot plus an ordered backlog.
///
/// `version` only ever grows. Every write that persists the queue must
/// call [`refresh_checksum`](Self::refresh_checksum) (or
/// [`touch`](Self::touch), which does both).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskQueue {
    /// Owner of the queue.
    pub player_id: PlayerId,
    /// Task currently running, if any.
    pub current_task: Option<Task>,
    /// Backlog, in execution order.
    pub queued: Vec<Task>,
    /// Whether the active slot is running.
    pub is_running: bool,
    /// Whether the player paused the queue.
    pub is_paused: bool,
    /// Monotonic mutation counter.
    pub version: u64,
    /// Structural fingerprint, see [`compute_checksum`](Self::compute_checksum).
    pub checksum: String,
    /// When this queue was last reconciled with the server (ms since epoch).
    pub last_synced: Option<u64>,
}

impl TaskQueue {
    /// Creates an empty queue at version 0.
    #[must_use]
    pub fn new(player_id: PlayerId) -> Self {
        let mut queue = Self {
            player_id,
            current_task: None,
            queued: Vec::new(),
            is_running: false,
            is_paused: false,
            version: 0,
            checksum: String::new(),
            last_synced: None,
        };
        queue.refresh_checksum();
        queue
    }

    /// Iterates over all tasks, the active one first.
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.current_task.iter().chain(self.queued.iter())
    }

    /// Number of tasks in the queue, including the active one.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queued.len() + usize::from(self.current_task.is_some())
    }

    /// Returns `true` if there is neither an active nor a queued task.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.current_task.is_none() && self.queued.is_empty()
    }

    /// Looks up a task by id.
    #[must_use]
    pub fn find_task(&self, id: &TaskId) -> Option<&Task> {
        self.tasks().find(|t| t.id == *id)
    }

    /// Returns `true` if the queue holds a task with this id.
    #[must_use]
    pub fn contains(&self, id: &TaskId) -> bool {
        self.find_task(id).is_some()
    }

    /// Replaces the task with the same id. Returns `false` if absent.
    pub fn replace_task(&mut self, task: Task) -> bool {
        if let Some(current) = self.current_task.as_mut().filter(|t| t.id == task.id) {
            *current = task;
            return true;
        }
        if let Some(slot) = self.queued.iter_mut().find(|t| t.id == task.id) {
            *slot = task;
            return true;
        }
        false
    }

    /// Removes a task from the active slot or the backlog.
    pub fn remove_task(&mut self, id: &TaskId) -> Option<Task> {
        if self.current_task.as_ref().is_some_and(|t| t.id == *id) {
            return self.current_task.take();
        }
        let pos = self.queued.iter().position(|t| t.id == *id)?;
        Some(self.queued.remove(pos))
    }

    /// Captures the run-state fields.
    #[must_use]
    pub fn snapshot(&self) -> QueueStateSnapshot {
        QueueStateSnapshot {
            is_running: self.is_running,
            is_paused: self.is_paused,
            current_task_id: self.current_task.as_ref().map(|t| t.id.clone()),
        }
    }

    /// Applies a mutation intent. Does not touch `version` or `checksum`.
    ///
    /// Rules:
    /// - add: appended to the backlog (replaces an existing task with the same id).
    /// - remove / update: no-op when the task is unknown.
    /// - reorder: listed ids move to the front in the given order, the rest keep
    ///   their relative order; unknown ids are ignored.
    /// - clear: drops every task.
    ///
    /// Afterwards an idle, unpaused queue promotes its first backlog task.
    pub fn apply(&mut self, kind: &OperationKind, now: u64) {
        match kind {
            OperationKind::AddTask { task } => {
                if !self.replace_task(task.clone()) {
                    self.queued.push(task.clone());
                }
            }
            OperationKind::RemoveTask { task_id } => {
                self.remove_task(task_id);
            }
            OperationKind::ReorderTasks { order } => self.reorder(order),
            OperationKind::PauseQueue => self.is_paused = true,
            OperationKind::ResumeQueue => self.is_paused = false,
            OperationKind::UpdateTask { task_id, patch } => {
                if let Some(task) = self.find_task(task_id) {
                    let next = patch.apply_to(task);
                    self.replace_task(next);
                }
            }
            OperationKind::ClearQueue => {
                self.current_task = None;
                self.queued.clear();
            }
        }
        self.normalize(now);
    }

    fn reorder(&mut self, order: &[TaskId]) {
        let mut remaining = std::mem::take(&mut self.queued);
        let mut ordered = Vec::with_capacity(remaining.len());
        for id in order {
            if let Some(pos) = remaining.iter().position(|t| t.id == *id) {
                ordered.push(remaining.remove(pos));
            }
        }
        ordered.extend(remaining);
        self.queued = ordered;
    }

    fn normalize(&mut self, now: u64) {
        if self.current_task.is_none() && !self.is_paused && !self.queued.is_empty() {
            let mut next = self.queued.remove(0);
            if next.start_time == 0 {
                next.start_time = now;
            }
            self.current_task = Some(next);
        }
        self.is_running = self.current_task.is_some() && !self.is_paused;
    }

    /// Bumps the version by one and recomputes the checksum.
    pub fn touch(&mut self) {
        self.version += 1;
        self.refresh_checksum();
    }

    /// Recomputes and stores the checksum.
    pub fn refresh_checksum(&mut self) {
        self.checksum = self.compute_checksum();
    }

    /// Fingerprint over the structural fields.
    ///
    /// Covers the active task id and completion, backlog ids in order with
    /// completion, and the running/paused flags. Version and timestamps are
    /// excluded so replicas with the same structure agree.
    #[must_use]
    pub fn compute_checksum(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        match &self.current_task {
            Some(task) => {
                hasher.update(task.id.as_uuid().as_bytes());
                hasher.update(&[u8::from(task.completed)]);
            }
            None => {
                hasher.update(b"-");
            }
        }
        hasher.update(b"\x00");
        for task in &self.queued {
            hasher.update(task.id.as_uuid().as_bytes());
            hasher.update(&[u8::from(task.completed)]);
        }
        hasher.update(b"\x00");
        hasher.update(&[u8::from(self.is_running), u8::from(self.is_paused)]);
        let hex = hasher.finalize().to_hex();
        format!("blake3:{}", &hex.as_str()[..16])
    }
}
