//! Durable storage for per-player offline queue state.
//!
//! Defines the [`QueueStore`] trait the manager persists through after every
//! local mutation and every completed sync, plus [`InMemoryStore`] for tests.
//! [`file::FileStore`] keeps one postcard file per player on disk.
//!
//! Writes are best-effort from the manager's point of view: a failed save is
//! logged and never rolls back in-memory state.

pub mod file;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use questline_proto::codec;
use questline_proto::task::PlayerId;
use tokio::sync::Mutex;

use crate::queue::state::OfflineQueueState;

/// Errors that can occur during queue storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The underlying storage is full or unavailable.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// A write operation failed.
    #[error("write failed: {0}")]
    WriteFailed(String),

    /// A read operation failed.
    #[error("read failed: {0}")]
    ReadFailed(String),

    /// Stored bytes exist but cannot be decoded.
    #[error("stored state is corrupt: {0}")]
    Corrupt(String),
}

/// Trait for persisting a player's [`OfflineQueueState`].
pub trait QueueStore: Send + Sync {
    /// Load the stored state, or `None` if the player has never been saved.
    fn load(
        &self,
        player_id: &PlayerId,
    ) -> impl std::future::Future<Output = Result<Option<OfflineQueueState>, StoreError>> + Send;

    /// Replace the stored state.
    fn save(
        &self,
        player_id: &PlayerId,
        state: &OfflineQueueState,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;
}

/// In-memory implementation of [`QueueStore`] for testing.
///
/// States are held postcard-encoded, exactly as a durable store would see
/// them. Writes can be made to fail, and raw bytes can be planted to
/// simulate corruption.
#[derive(Default)]
pub struct InMemoryStore {
    states: Mutex<HashMap<PlayerId, Vec<u8>>>,
    fail_writes: AtomicBool,
    saves: AtomicUsize,
}

impl InMemoryStore {
    /// Create a new, empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// While `true`, every save fails with [`StoreError::WriteFailed`].
    pub fn set_failing(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of successful saves.
    #[must_use]
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Replace a player's stored bytes verbatim.
    pub async fn insert_raw(&self, player_id: &PlayerId, bytes: Vec<u8>) {
        self.states.lock().await.insert(player_id.clone(), bytes);
    }
}

impl QueueStore for InMemoryStore {
    async fn load(&self, player_id: &PlayerId) -> Result<Option<OfflineQueueState>, StoreError> {
        let states = self.states.lock().await;
        states
            .get(player_id)
            .map(|bytes| codec::decode(bytes).map_err(|e| StoreError::Corrupt(e.to_string())))
            .transpose()
    }

    async fn save(&self, player_id: &PlayerId, state: &OfflineQueueState) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::WriteFailed("disk full".to_string()));
        }
        let bytes = codec::encode(state).map_err(|e| StoreError::WriteFailed(e.to_string()))?;
        self.states.lock().await.insert(player_id.clone(), bytes);
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
