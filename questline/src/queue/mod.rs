//! Local, optimistic side of the offline queue.
//!
//! [`state::OfflineQueueState`] applies a mutation to the player's queue the
//! moment it is requested and records the intent in an
//! [`oplog::OperationLog`]. Nothing here touches the network; the sync
//! engine later replays the log against the server.

pub mod oplog;
pub mod state;

pub use oplog::{AppendOutcome, OperationLog};
pub use state::OfflineQueueState;

use questline_proto::task::{TaskId, TaskValidationError};

/// Errors returned by local queue mutations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum QueueError {
    /// The task, patch or ordering is malformed.
    #[error("invalid request: {0}")]
    Invalid(#[from] TaskValidationError),

    /// No task with this id is in the queue.
    #[error("task not found: {0}")]
    UnknownTask(TaskId),

    /// A task with this id is already queued.
    #[error("task already queued: {0}")]
    DuplicateTask(TaskId),
}
