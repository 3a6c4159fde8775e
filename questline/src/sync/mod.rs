//! Reconciling the local queue with the server.
//!
//! - [`engine`]: one incremental round-trip per call.
//! - [`resolver`]: turns reported conflicts into queue changes.
//! - [`scheduler`]: decides when a round-trip should run.
//! - [`status`]: bookkeeping and its UI projection.

pub mod engine;
pub mod resolver;
pub mod scheduler;
pub mod status;

pub use engine::{GuardSet, SyncEngine, SyncGuard, SyncResult};
pub use resolver::{ManualChoice, ResolutionRecord, ResolutionStrategy};
pub use scheduler::{SchedulerHandle, SyncDriver, SyncScheduler};
pub use status::{IndicatorStatus, SyncIndicator, SyncStatus};

use questline_proto::task::PlayerId;

/// Failures of a single round-trip. All are retried with backoff.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NetworkError {
    /// No response arrived within the sync timeout.
    #[error("request timed out")]
    Timeout,

    /// The device or the service is offline.
    #[error("offline")]
    Offline,

    /// The request or response was lost or garbled.
    #[error("transport error: {0}")]
    Transport(String),

    /// The server refused the packet.
    #[error("server rejected the sync request")]
    Rejected,
}

/// Errors returned by a sync attempt.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    /// The round-trip failed; nothing was applied.
    #[error(transparent)]
    Network(#[from] NetworkError),

    /// Another sync for this player is already in flight.
    #[error("sync already in progress for {player_id}")]
    Concurrency {
        /// The player whose sync was rejected.
        player_id: PlayerId,
    },

    /// Conflicts were parked under the manual strategy.
    #[error("{count} conflict(s) need a manual decision")]
    ConflictUnresolved {
        /// Number of parked conflicts.
        count: usize,
    },

    /// No parked conflict matches the request.
    #[error("no pending conflict matches")]
    UnknownConflict,
}
