//! Operations: recorded intents to mutate a [`TaskQueue`](crate::queue::TaskQueue).
//!
//! The client keeps full [`Operation`]s in its log so it can replay them
//! locally. Only the minimized [`WireOperation`] form travels to the server.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::task::{Task, TaskId, TaskPatch, TaskType, TaskValidationError};

/// Unique identifier for an operation, based on UUID v7 for time-ordering.
///
/// The server deduplicates by this id, so a retried packet never applies
/// the same intent twice.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationId(Uuid);

impl OperationId {
    /// Creates a new time-ordered operation identifier (UUID v7).
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Creates an `OperationId` from an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the inner UUID value.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for OperationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Discriminant of an operation, used for logging and deduplication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationType {
    /// Append a task.
    AddTask,
    /// Remove a task.
    RemoveTask,
    /// Reorder the backlog.
    ReorderTasks,
    /// Pause the queue.
    PauseQueue,
    /// Resume the queue.
    ResumeQueue,
    /// Change fields of a task.
    UpdateTask,
    /// Drop every task.
    ClearQueue,
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AddTask => write!(f, "add_task"),
            Self::RemoveTask => write!(f, "remove_task"),
            Self::ReorderTasks => write!(f, "reorder_tasks"),
            Self::PauseQueue => write!(f, "pause_queue"),
            Self::ResumeQueue => write!(f, "resume_queue"),
            Self::UpdateTask => write!(f, "update_task"),
            Self::ClearQueue => write!(f, "clear_queue"),
        }
    }
}

/// A mutation intent with its full local payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OperationKind {
    /// Append `task` to the backlog.
    AddTask {
        /// The complete task as created locally.
        task: Task,
    },
    /// Remove a task by id.
    RemoveTask {
        /// Task to remove.
        task_id: TaskId,
    },
    /// Move the listed tasks to the front of the backlog, in order.
    ReorderTasks {
        /// Desired backlog order.
        order: Vec<TaskId>,
    },
    /// Pause execution.
    PauseQueue,
    /// Resume execution.
    ResumeQueue,
    /// Replace a task with `patch` applied.
    UpdateTask {
        /// Task to update.
        task_id: TaskId,
        /// Changed fields.
        patch: TaskPatch,
    },
    /// Drop every task.
    ClearQueue,
}

impl OperationKind {
    /// Returns the discriminant.
    #[must_use]
    pub const fn op_type(&self) -> OperationType {
        match self {
            Self::AddTask { .. } => OperationType::AddTask,
            Self::RemoveTask { .. } => OperationType::RemoveTask,
            Self::ReorderTasks { .. } => OperationType::ReorderTasks,
            Self::PauseQueue => OperationType::PauseQueue,
            Self::ResumeQueue => OperationType::ResumeQueue,
            Self::UpdateTask { .. } => OperationType::UpdateTask,
            Self::ClearQueue => OperationType::ClearQueue,
        }
    }

    /// The task this operation targets, if it targets exactly one.
    #[must_use]
    pub const fn task_id(&self) -> Option<&TaskId> {
        match self {
            Self::AddTask { task } => Some(&task.id),
            Self::RemoveTask { task_id } | Self::UpdateTask { task_id, .. } => Some(task_id),
            _ => None,
        }
    }

    /// Checks the payload is well-formed.
    ///
    /// # Errors
    ///
    /// Returns [`TaskValidationError`] for an invalid added task, an
    /// invalid or empty patch, or a reorder listing the same id twice.
    pub fn validate(&self) -> Result<(), TaskValidationError> {
        match self {
            Self::AddTask { task } => task.validate(),
            Self::UpdateTask { patch, .. } => patch.validate(),
            Self::ReorderTasks { order } => {
                let mut seen = HashSet::with_capacity(order.len());
                for id in order {
                    if !seen.insert(id) {
                        return Err(TaskValidationError::DuplicateInOrder(id.clone()));
                    }
                }
                Ok(())
            }
            Self::RemoveTask { .. } | Self::PauseQueue | Self::ResumeQueue | Self::ClearQueue => {
                Ok(())
            }
        }
    }
}

/// A logged operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Unique id, used by the server for deduplication.
    pub id: OperationId,
    /// What to do.
    pub kind: OperationKind,
    /// When the intent was recorded (ms since epoch).
    pub timestamp: u64,
    /// Local queue version after applying this operation.
    pub local_version: u64,
    /// Set once a sync round confirms the server applied it.
    pub applied: bool,
}

impl Operation {
    /// Creates an unapplied operation with a fresh id.
    #[must_use]
    pub fn new(kind: OperationKind, timestamp: u64, local_version: u64) -> Self {
        Self {
            id: OperationId::new(),
            kind,
            timestamp,
            local_version,
            applied: false,
        }
    }

    /// Returns the discriminant.
    #[must_use]
    pub const fn op_type(&self) -> OperationType {
        self.kind.op_type()
    }

    /// Strips the payload to the fields needed for remote replay.
    ///
    /// | type | kept |
    /// |---|---|
    /// | add | id, type, name, duration, activity data, priority |
    /// | remove | task id |
    /// | reorder | full order |
    /// | update | changed fields only |
    ///
    /// # Errors
    ///
    /// Returns [`TaskValidationError`] if the payload is malformed.
    pub fn minimize(&self) -> Result<WireOperation, TaskValidationError> {
        self.kind.validate()?;
        let payload = match &self.kind {
            OperationKind::AddTask { task } => WirePayload::AddTask(NewTask::from(task)),
            OperationKind::RemoveTask { task_id } => WirePayload::RemoveTask {
                task_id: task_id.clone(),
            },
            OperationKind::ReorderTasks { order } => WirePayload::ReorderTasks {
                order: order.clone(),
            },
            OperationKind::PauseQueue => WirePayload::PauseQueue,
            OperationKind::ResumeQueue => WirePayload::ResumeQueue,
            OperationKind::UpdateTask { task_id, patch } => WirePayload::UpdateTask {
                task_id: task_id.clone(),
                patch: patch.clone(),
            },
            OperationKind::ClearQueue => WirePayload::ClearQueue,
        };
        Ok(WireOperation {
            id: self.id.clone(),
            timestamp: self.timestamp,
            payload,
        })
    }
}

/// The replayable subset of a newly added task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTask {
    /// Client-assigned task id.
    pub id: TaskId,
    /// Activity kind.
    pub task_type: TaskType,
    /// Display name.
    pub name: String,
    /// Duration in milliseconds.
    pub duration_ms: u64,
    /// Activity parameters.
    pub activity_data: BTreeMap<String, String>,
    /// Priority.
    pub priority: i32,
}

impl From<&Task> for NewTask {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id.clone(),
            task_type: task.task_type,
            name: task.name.clone(),
            duration_ms: task.duration_ms,
            activity_data: task.activity_data.clone(),
            priority: task.priority,
        }
    }
}

impl NewTask {
    /// Materializes an unstarted task.
    #[must_use]
    pub fn into_task(self) -> Task {
        Task {
            id: self.id,
            task_type: self.task_type,
            name: self.name,
            duration_ms: self.duration_ms,
            activity_data: self.activity_data,
            progress: 0.0,
            priority: self.priority,
            start_time: 0,
            completed: false,
            rewards: Vec::new(),
        }
    }
}

/// Minimized operation payload as sent to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WirePayload {
    /// Append a task.
    AddTask(NewTask),
    /// Remove a task.
    RemoveTask {
        /// Task to remove.
        task_id: TaskId,
    },
    /// Reorder the backlog.
    ReorderTasks {
        /// Desired order.
        order: Vec<TaskId>,
    },
    /// Pause execution.
    PauseQueue,
    /// Resume execution.
    ResumeQueue,
    /// Change fields of a task.
    UpdateTask {
        /// Task to update.
        task_id: TaskId,
        /// Changed fields only.
        patch: TaskPatch,
    },
    /// Drop every task.
    ClearQueue,
}

/// An operation in a [`SyncPacket`](crate::sync::SyncPacket).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireOperation {
    /// Operation id, for server-side deduplication.
    pub id: OperationId,
    /// When the intent was recorded.
    pub timestamp: u64,
    /// Minimized payload.
    pub payload: WirePayload,
}

impl WireOperation {
    /// Expands the wire form back into a replayable intent.
    #[must_use]
    pub fn to_kind(&self) -> OperationKind {
        match &self.payload {
            WirePayload::AddTask(new_task) => OperationKind::AddTask {
                task: new_task.clone().into_task(),
            },
            WirePayload::RemoveTask { task_id } => OperationKind::RemoveTask {
                task_id: task_id.clone(),
            },
            WirePayload::ReorderTasks { order } => OperationKind::ReorderTasks {
                order: order.clone(),
            },
            WirePayload::PauseQueue => OperationKind::PauseQueue,
            WirePayload::ResumeQueue => OperationKind::ResumeQueue,
            WirePayload::UpdateTask { task_id, patch } => OperationKind::UpdateTask {
                task_id: task_id.clone(),
                patch: patch.clone(),
            },
            WirePayload::ClearQueue => OperationKind::ClearQueue,
        }
    }
}
