//! Per-player offline state and the synchronous mutation phase.
//!
//! Every mutation validates, applies to the local queue, bumps the version
//! and appends an [`Operation`] to the log in one step. Callers persist the
//! state afterwards; nothing here performs I/O.

use std::collections::VecDeque;

use questline_proto::operation::{Operation, OperationId, OperationKind};
use questline_proto::queue::TaskQueue;
use questline_proto::sync::Conflict;
use questline_proto::task::{PlayerId, Task, TaskId, TaskPatch};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::QueueError;
use super::oplog::OperationLog;
use crate::sync::resolver::ResolutionRecord;
use crate::sync::status::SyncStatus;

/// Everything persisted for one player.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineQueueState {
    /// The optimistic local queue.
    pub queue: TaskQueue,
    /// Recorded intents, applied and not.
    pub log: OperationLog,
    /// Sync bookkeeping.
    pub status: SyncStatus,
    /// Server queue version seen on the last successful sync.
    pub server_version: u64,
    /// Resolved conflicts, oldest first.
    pub resolution_log: VecDeque<ResolutionRecord>,
    /// Conflicts parked for a manual decision.
    pub pending_conflicts: Vec<Conflict>,
}

impl OfflineQueueState {
    /// Creates an empty state for `player_id`.
    #[must_use]
    pub fn new(player_id: PlayerId) -> Self {
        Self {
            queue: TaskQueue::new(player_id),
            log: OperationLog::default(),
            status: SyncStatus::default(),
            server_version: 0,
            resolution_log: VecDeque::new(),
            pending_conflicts: Vec::new(),
        }
    }

    /// The owning player.
    #[must_use]
    pub const fn player_id(&self) -> &PlayerId {
        &self.queue.player_id
    }

    /// Queues a new task.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Invalid`] for a malformed task or
    /// [`QueueError::DuplicateTask`] if its id is already queued.
    pub fn add_task(&mut self, task: Task, now: u64) -> Result<OperationId, QueueError> {
        if self.queue.contains(&task.id) {
            return Err(QueueError::DuplicateTask(task.id));
        }
        self.record(OperationKind::AddTask { task }, now)
    }

    /// Removes a queued or running task.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::UnknownTask`] if the task is not queued.
    pub fn remove_task(&mut self, task_id: &TaskId, now: u64) -> Result<OperationId, QueueError> {
        if !self.queue.contains(task_id) {
            return Err(QueueError::UnknownTask(task_id.clone()));
        }
        self.record(
            OperationKind::RemoveTask {
                task_id: task_id.clone(),
            },
            now,
        )
    }

    /// Moves the listed backlog tasks to the front, in order.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Invalid`] if an id is listed twice.
    pub fn reorder_tasks(&mut self, order: Vec<TaskId>, now: u64) -> Result<OperationId, QueueError> {
        self.record(OperationKind::ReorderTasks { order }, now)
    }

    /// Pauses execution.
    ///
    /// # Errors
    ///
    /// Infallible in practice; shares the mutation signature.
    pub fn pause(&mut self, now: u64) -> Result<OperationId, QueueError> {
        self.record(OperationKind::PauseQueue, now)
    }

    /// Resumes execution.
    ///
    /// # Errors
    ///
    /// Infallible in practice; shares the mutation signature.
    pub fn resume(&mut self, now: u64) -> Result<OperationId, QueueError> {
        self.record(OperationKind::ResumeQueue, now)
    }

    /// Drops every task.
    ///
    /// # Errors
    ///
    /// Infallible in practice; shares the mutation signature.
    pub fn clear(&mut self, now: u64) -> Result<OperationId, QueueError> {
        self.record(OperationKind::ClearQueue, now)
    }

    /// Applies `patch` to a task. Fields equal to the current value are
    /// dropped before recording.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::UnknownTask`] if the task is not queued, or
    /// [`QueueError::Invalid`] if the patch is malformed or changes nothing.
    pub fn update_task(
        &mut self,
        task_id: &TaskId,
        patch: &TaskPatch,
        now: u64,
    ) -> Result<OperationId, QueueError> {
        let task = self
            .queue
            .find_task(task_id)
            .ok_or_else(|| QueueError::UnknownTask(task_id.clone()))?;
        let patch = patch.changed_against(task);
        self.record(
            OperationKind::UpdateTask {
                task_id: task_id.clone(),
                patch,
            },
            now,
        )
    }

    /// Validates, applies and logs one intent.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Invalid`] if the payload is malformed; nothing
    /// is applied or logged in that case.
    pub fn record(&mut self, kind: OperationKind, now: u64) -> Result<OperationId, QueueError> {
        kind.validate()?;
        self.queue.apply(&kind, now);
        self.queue.touch();

        let op = Operation::new(kind, now, self.queue.version);
        let id = op.id.clone();
        debug!(
            player_id = %self.queue.player_id,
            operation_id = %id,
            op_type = %op.op_type(),
            version = self.queue.version,
            "recorded operation"
        );
        let outcome = self.log.append(op);
        for superseded in &outcome.superseded {
            debug!(operation_id = %superseded, "reorder superseded");
        }
        self.warn_evicted(&outcome.evicted_unapplied);
        self.refresh_pending();
        Ok(id)
    }

    /// Changes the log capacity, warning about unapplied entries lost.
    pub fn set_log_capacity(&mut self, capacity: usize) {
        let lost = self.log.set_capacity(capacity);
        self.warn_evicted(&lost);
        self.refresh_pending();
    }

    fn warn_evicted(&self, lost: &[OperationId]) {
        for id in lost {
            warn!(
                player_id = %self.queue.player_id,
                operation_id = %id,
                "operation log full, dropped unsynced operation"
            );
        }
    }

    /// Copies the unapplied count into the sync status.
    pub fn refresh_pending(&mut self) {
        self.status.pending_operations_count = self.log.pending_count();
    }

    /// Replaces the local queue with `server`, then applies `untracked`
    /// changes and replays every unapplied operation on top.
    ///
    /// The resulting version is `max(local, server) + 1`.
    pub fn rebase(&mut self, server: TaskQueue, untracked: &[OperationKind], now: u64) {
        let local_version = self.queue.version;
        let mut queue = server;
        for kind in untracked {
            queue.apply(kind, now);
        }
        for op in self.log.pending() {
            queue.apply(&op.kind, now);
        }
        queue.version = local_version.max(queue.version) + 1;
        queue.refresh_checksum();
        queue.last_synced = Some(now);
        self.queue = queue;
    }

    /// Appends resolved conflicts to the audit log, keeping at most `max`.
    pub fn push_resolutions(
        &mut self,
        records: impl IntoIterator<Item = ResolutionRecord>,
        max: usize,
    ) {
        self.resolution_log.extend(records);
        while self.resolution_log.len() > max {
            self.resolution_log.pop_front();
        }
    }
}
