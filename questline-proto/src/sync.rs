//! Incremental sync protocol types.
//!
//! A client sends one [`SyncPacket`] per round-trip carrying its unapplied
//! operations; the server answers with a [`SyncResponse`] listing which
//! operation ids it consumed, the authoritative queue, and any divergences
//! it detected as [`Conflict`]s.

use serde::{Deserialize, Serialize};

use crate::codec::{self, CodecError};
use crate::operation::{OperationId, WireOperation};
use crate::queue::{QueueStateSnapshot, TaskQueue};
use crate::task::{PlayerId, Task, TaskId};

/// One incremental sync request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncPacket {
    /// Whose queue this is.
    pub player_id: PlayerId,
    /// Last server version the client reconciled against (0 before the first sync).
    pub from_version: u64,
    /// Local queue version when the packet was built.
    pub to_version: u64,
    /// Unapplied operations in log order, minimized.
    pub operations: Vec<WireOperation>,
    /// Checksum of the local queue when the packet was built.
    pub checksum: String,
    /// When the packet was built (ms since epoch).
    pub timestamp: u64,
}

/// The server's answer to a [`SyncPacket`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncResponse {
    /// `false` if the server refused the packet as a whole.
    pub success: bool,
    /// Divergences the client must resolve.
    pub conflicts: Vec<Conflict>,
    /// The authoritative queue after applying the packet.
    pub server_queue: TaskQueue,
    /// Ids of every operation the server consumed (applied, conflicted or seen before).
    pub applied_operations: Vec<OperationId>,
}

/// What kind of divergence was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConflictKind {
    /// Both sides hold the task with different values.
    TaskModified,
    /// The client holds a task the server does not.
    TaskAdded,
    /// The server removed a task the client still references.
    TaskRemoved,
    /// Paused/running state differs.
    QueueStateChanged,
}

impl std::fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TaskModified => write!(f, "task_modified"),
            Self::TaskAdded => write!(f, "task_added"),
            Self::TaskRemoved => write!(f, "task_removed"),
            Self::QueueStateChanged => write!(f, "queue_state_changed"),
        }
    }
}

/// One side of a conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConflictValue {
    /// A task value.
    Task(Task),
    /// Queue run state.
    QueueState(QueueStateSnapshot),
}

impl ConflictValue {
    /// Returns the task, if this side is a task.
    #[must_use]
    pub const fn as_task(&self) -> Option<&Task> {
        match self {
            Self::Task(task) => Some(task),
            Self::QueueState(_) => None,
        }
    }

    /// Returns the run state, if this side is a queue state.
    #[must_use]
    pub const fn as_queue_state(&self) -> Option<&QueueStateSnapshot> {
        match self {
            Self::QueueState(state) => Some(state),
            Self::Task(_) => None,
        }
    }
}

/// Which side won a resolved conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResolutionTag {
    /// The server's value was adopted.
    Server,
    /// The client's value was kept.
    Client,
    /// A field-level merge of both values.
    Merged,
    /// Recorded but awaiting a manual decision.
    Pending,
}

impl std::fmt::Display for ResolutionTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Server => write!(f, "server"),
            Self::Client => write!(f, "client"),
            Self::Merged => write!(f, "merged"),
            Self::Pending => write!(f, "pending"),
        }
    }
}

/// A detected divergence between the client and the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    /// Divergence kind.
    pub kind: ConflictKind,
    /// Task involved, for task-level conflicts.
    pub task_id: Option<TaskId>,
    /// Server side (`None` = absent on the server).
    pub server_value: Option<ConflictValue>,
    /// Client side as reported by the server (`None` = unknown or absent).
    pub client_value: Option<ConflictValue>,
    /// How it was resolved; `None` until resolution.
    pub resolution: Option<ResolutionTag>,
}

impl Conflict {
    /// Server and client disagree on a task's value.
    #[must_use]
    pub fn task_modified(server: Task, client: Task) -> Self {
        Self {
            kind: ConflictKind::TaskModified,
            task_id: Some(server.id.clone()),
            server_value: Some(ConflictValue::Task(server)),
            client_value: Some(ConflictValue::Task(client)),
            resolution: None,
        }
    }

    /// The client holds a task the server lacks.
    #[must_use]
    pub fn task_added(client: Task) -> Self {
        Self {
            kind: ConflictKind::TaskAdded,
            task_id: Some(client.id.clone()),
            server_value: None,
            client_value: Some(ConflictValue::Task(client)),
            resolution: None,
        }
    }

    /// The server no longer has a task the client referenced.
    #[must_use]
    pub fn task_removed(task_id: TaskId, client: Option<Task>) -> Self {
        Self {
            kind: ConflictKind::TaskRemoved,
            task_id: Some(task_id),
            server_value: None,
            client_value: client.map(ConflictValue::Task),
            resolution: None,
        }
    }

    /// Run state differs.
    #[must_use]
    pub const fn queue_state_changed(
        server: QueueStateSnapshot,
        client: QueueStateSnapshot,
    ) -> Self {
        Self {
            kind: ConflictKind::QueueStateChanged,
            task_id: None,
            server_value: Some(ConflictValue::QueueState(server)),
            client_value: Some(ConflictValue::QueueState(client)),
            resolution: None,
        }
    }

    /// Server-side task, if any.
    #[must_use]
    pub fn server_task(&self) -> Option<&Task> {
        self.server_value.as_ref().and_then(ConflictValue::as_task)
    }

    /// Client-side task as reported, if any.
    #[must_use]
    pub fn client_task(&self) -> Option<&Task> {
        self.client_value.as_ref().and_then(ConflictValue::as_task)
    }
}

/// Encodes a [`SyncPacket`] into bytes using postcard.
///
/// # Errors
///
/// Returns [`CodecError::Serialization`] if serialization fails.
pub fn encode_packet(packet: &SyncPacket) -> Result<Vec<u8>, CodecError> {
    codec::encode(packet)
}

/// Decodes a [`SyncPacket`] from bytes using postcard.
///
/// # Errors
///
/// Returns [`CodecError::Serialization`] if deserialization fails.
pub fn decode_packet(bytes: &[u8]) -> Result<SyncPacket, CodecError> {
    codec::decode(bytes)
}

/// Encodes a [`SyncResponse`] into bytes using postcard.
///
/// # Errors
///
/// Returns [`CodecError::Serialization`] if serialization fails.
pub fn encode_response(response: &SyncResponse) -> Result<Vec<u8>, CodecError> {
    codec::encode(response)
}

/// Decodes a [`SyncResponse`] from bytes using postcard.
///
/// # Errors
///
/// Returns [`CodecError::Serialization`] if deserialization fails.
pub fn decode_response(bytes: &[u8]) -> Result<SyncResponse, CodecError> {
    codec::decode(bytes)
}
