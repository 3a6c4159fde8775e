//! File-backed queue store.
//!
//! Each player's state lives in `<data_dir>/<percent-encoded player id>.queue` as a
//! length-prefixed postcard frame. Saves write a temporary sibling file and
//! rename it over the old one, so a crash mid-write leaves the previous
//! state intact.

use std::path::{Path, PathBuf};

use questline_proto::codec;
use questline_proto::task::PlayerId;

use super::{QueueStore, StoreError};
use crate::queue::state::OfflineQueueState;

/// [`QueueStore`] writing one file per player under a data directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Creates a store rooted at `dir`. The directory is created on first save.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The directory this store writes to.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of a player's state file.
    #[must_use]
    pub fn path_for(&self, player_id: &PlayerId) -> PathBuf {
        // Percent-encoded so distinct ids never share a file name.
        let name = urlencoding::encode(player_id.as_str());
        self.dir.join(format!("{name}.queue"))
    }
}

impl QueueStore for FileStore {
    async fn load(&self, player_id: &PlayerId) -> Result<Option<OfflineQueueState>, StoreError> {
        let path = self.path_for(player_id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::ReadFailed(format!("{}: {e}", path.display()))),
        };
        let (state, consumed) = codec::decode_framed::<OfflineQueueState>(&bytes)
            .map_err(|e| StoreError::Corrupt(format!("{}: {e}", path.display())))?;
        if consumed != bytes.len() {
            return Err(StoreError::Corrupt(format!(
                "{}: {} trailing bytes",
                path.display(),
                bytes.len() - consumed
            )));
        }
        Ok(Some(state))
    }

    async fn save(&self, player_id: &PlayerId, state: &OfflineQueueState) -> Result<(), StoreError> {
        let frame =
            codec::encode_framed(state).map_err(|e| StoreError::WriteFailed(e.to_string()))?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| StoreError::Unavailable(format!("{}: {e}", self.dir.display())))?;
        let path = self.path_for(player_id);
        let tmp = path.with_extension("queue.tmp");
        tokio::fs::write(&tmp, &frame)
            .await
            .map_err(|e| StoreError::WriteFailed(format!("{}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| StoreError::WriteFailed(format!("{}: {e}", path.display())))?;
        Ok(())
    }
}
