//! Per-player event streams.
//!
//! Each player gets a lazily created `broadcast` channel. Slow subscribers
//! lag and skip events; publishing never waits on them.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use questline_proto::task::PlayerId;
use tokio::sync::broadcast;
use tracing::debug;

use crate::sync::resolver::ResolutionStrategy;

/// Something observers of a player's queue may care about.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    /// A local mutation changed the queue.
    QueueChanged {
        /// Queue version after the change.
        version: u64,
        /// Unapplied operations.
        pending: usize,
    },
    /// A round-trip started.
    SyncStarted,
    /// A round-trip finished and the local state was reconciled.
    SyncCompleted {
        /// Operations the server confirmed.
        applied: usize,
        /// Server version now seen.
        server_version: u64,
    },
    /// A round-trip failed.
    SyncFailed {
        /// Rendered error.
        error: String,
    },
    /// Conflicts were settled.
    ConflictsResolved {
        /// How many.
        count: usize,
        /// Strategy used.
        strategy: ResolutionStrategy,
    },
    /// The device went online or offline.
    ConnectivityChanged {
        /// New state.
        online: bool,
    },
}

/// Fan-out of [`QueueEvent`]s keyed by player.
#[derive(Clone)]
pub struct EventHub {
    channels: Arc<Mutex<HashMap<PlayerId, broadcast::Sender<QueueEvent>>>>,
    buffer: usize,
}

impl EventHub {
    /// Creates a hub whose channels buffer up to `buffer` events.
    #[must_use]
    pub fn new(buffer: usize) -> Self {
        Self {
            channels: Arc::new(Mutex::new(HashMap::new())),
            buffer: buffer.max(1),
        }
    }

    /// Subscribes to a player's events.
    #[must_use]
    pub fn subscribe(&self, player_id: &PlayerId) -> Subscription {
        let mut channels = self.channels.lock();
        let sender = channels
            .entry(player_id.clone())
            .or_insert_with(|| broadcast::channel(self.buffer).0);
        Subscription {
            player_id: player_id.clone(),
            rx: sender.subscribe(),
            hub: self.clone(),
        }
    }

    /// Publishes to a player's subscribers, if any.
    pub fn publish(&self, player_id: &PlayerId, event: QueueEvent) {
        let mut channels = self.channels.lock();
        let closed = channels
            .get(player_id)
            .is_some_and(|sender| sender.send(event).is_err());
        if closed {
            channels.remove(player_id);
        }
    }

    /// Publishes to every player with subscribers.
    pub fn publish_all(&self, event: &QueueEvent) {
        self.channels
            .lock()
            .retain(|_, sender| sender.send(event.clone()).is_ok());
    }

    /// Number of live subscribers for a player.
    #[must_use]
    pub fn subscriber_count(&self, player_id: &PlayerId) -> usize {
        self.channels
            .lock()
            .get(player_id)
            .map_or(0, broadcast::Sender::receiver_count)
    }

    fn prune(&self, player_id: &PlayerId) {
        let mut channels = self.channels.lock();
        if channels
            .get(player_id)
            .is_some_and(|sender| sender.receiver_count() == 0)
        {
            channels.remove(player_id);
        }
    }
}

/// A live subscription to one player's events.
pub struct Subscription {
    player_id: PlayerId,
    rx: broadcast::Receiver<QueueEvent>,
    hub: EventHub,
}

impl Subscription {
    /// Waits for the next event. Returns `None` once the hub is gone.
    ///
    /// Events missed while lagging are skipped.
    pub async fn recv(&mut self) -> Option<QueueEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(player_id = %self.player_id, skipped, "event subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Returns the next buffered event without waiting.
    pub fn try_recv(&mut self) -> Option<QueueEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => {}
                Err(_) => return None,
            }
        }
    }

    /// Detaches from the stream.
    pub fn unsubscribe(self) {
        let Self { player_id, rx, hub } = self;
        drop(rx);
        hub.prune(&player_id);
    }
}
