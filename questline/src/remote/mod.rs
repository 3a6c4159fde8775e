//! Remote queue service abstraction.
//!
//! Defines the [`QueueService`] trait the sync engine talks to. The wire
//! transport (HTTP, WebSocket, ...) lives behind this seam; the engine only
//! sees packets and responses. Implementations:
//! - [`loopback::LoopbackService`]: in-process [`Authority`](questline_authority::Authority)
//!   with connectivity and latency controls, for tests and the demo.

pub mod loopback;

use questline_proto::codec::CodecError;
use questline_proto::sync::{SyncPacket, SyncResponse};

/// Errors that can occur while talking to the remote service.
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    /// The service cannot be reached (no connectivity).
    #[error("remote service unavailable")]
    Unavailable,

    /// The request or response was lost or garbled in transit.
    #[error("transport error: {0}")]
    Transport(String),

    /// The payload could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Async remote queue service.
///
/// # Invariant
///
/// Implementations MUST be idempotent per operation id: resending a packet
/// whose operations were already consumed must not apply them twice.
pub trait QueueService: Send + Sync {
    /// Sends one incremental sync packet and waits for the server's answer.
    fn incremental_sync(
        &self,
        packet: &SyncPacket,
    ) -> impl std::future::Future<Output = Result<SyncResponse, RemoteError>> + Send;
}
