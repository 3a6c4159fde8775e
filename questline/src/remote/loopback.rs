//! Loopback queue service for testing.
//!
//! Wraps an in-process [`Authority`] and pushes every packet through the
//! postcard codec in both directions, so tests exercise the real wire
//! format. The service can be taken offline, slowed down, or told to lose
//! responses after the authority has processed them.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use questline_authority::Authority;
use questline_proto::sync::{self, SyncPacket, SyncResponse};

use super::{QueueService, RemoteError};

#[derive(Debug, Default)]
struct LinkState {
    offline: AtomicBool,
    drop_responses: AtomicBool,
    latency_ms: AtomicU64,
    calls: AtomicUsize,
}

/// In-process [`QueueService`] backed by an [`Authority`].
///
/// Cloning shares both the authority and the link controls.
#[derive(Clone)]
pub struct LoopbackService {
    authority: Arc<Authority>,
    link: Arc<LinkState>,
}

impl LoopbackService {
    /// Creates a service in front of `authority`, online with no latency.
    #[must_use]
    pub fn new(authority: Arc<Authority>) -> Self {
        Self {
            authority,
            link: Arc::new(LinkState::default()),
        }
    }

    /// The authority behind this service.
    #[must_use]
    pub const fn authority(&self) -> &Arc<Authority> {
        &self.authority
    }

    /// Makes every request fail with [`RemoteError::Unavailable`] while `true`.
    pub fn set_online(&self, online: bool) {
        self.link.offline.store(!online, Ordering::SeqCst);
    }

    /// Delays every request by `latency` before it reaches the authority.
    pub fn set_latency(&self, latency: Duration) {
        let ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.link.latency_ms.store(ms, Ordering::SeqCst);
    }

    /// While `true`, the authority processes packets but the response is
    /// lost on the way back.
    pub fn set_drop_responses(&self, drop: bool) {
        self.link.drop_responses.store(drop, Ordering::SeqCst);
    }

    /// Number of requests that reached the authority.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.link.calls.load(Ordering::SeqCst)
    }
}

impl QueueService for LoopbackService {
    async fn incremental_sync(&self, packet: &SyncPacket) -> Result<SyncResponse, RemoteError> {
        if self.link.offline.load(Ordering::SeqCst) {
            return Err(RemoteError::Unavailable);
        }

        let latency = self.link.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        let request = sync::encode_packet(packet)?;
        let decoded = sync::decode_packet(&request)?;
        self.link.calls.fetch_add(1, Ordering::SeqCst);
        let response = self.authority.incremental_sync(&decoded).await;

        if self.link.drop_responses.load(Ordering::SeqCst) {
            return Err(RemoteError::Transport("response lost".to_string()));
        }

        let bytes = sync::encode_response(&response)?;
        Ok(sync::decode_response(&bytes)?)
    }
}
