//! One incremental sync round-trip.
//!
//! The engine holds the player's state lock only to snapshot the pending
//! operations and, after the response arrives, to swap in the reconciled
//! queue. Mutations made while the request is in flight stay unapplied in
//! the log and are replayed on top of the server queue.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use questline_proto::operation::OperationId;
use questline_proto::sync::{Conflict, SyncPacket, SyncResponse};
use questline_proto::task::{PlayerId, TaskId, now_ms};
use tracing::{debug, info, warn};

use super::resolver::{self, ManualChoice, Resolution, ResolutionRecord, ResolutionStrategy};
use super::{NetworkError, SyncError};
use crate::config::SyncConfig;
use crate::events::{EventHub, QueueEvent};
use crate::queue::state::OfflineQueueState;
use crate::remote::{QueueService, RemoteError};

/// Outcome of a completed round-trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncResult {
    /// Local operations the server confirmed.
    pub applied: usize,
    /// Conflicts settled by the strategy.
    pub conflicts_resolved: usize,
    /// Conflicts still parked for a manual decision.
    pub pending_conflicts: usize,
    /// Server version after the round-trip.
    pub server_version: u64,
    /// Operations recorded to push client-side choices back.
    pub follow_ups: usize,
}

// ---------------------------------------------------------------------------
// Guards
// ---------------------------------------------------------------------------

/// Players with a round-trip in flight.
#[derive(Debug, Clone, Default)]
pub struct GuardSet {
    in_flight: Arc<Mutex<HashSet<PlayerId>>>,
}

impl GuardSet {
    /// Claims `player_id`. Returns `None` if a sync is already running.
    #[must_use]
    pub fn acquire(&self, player_id: &PlayerId) -> Option<SyncGuard> {
        if !self.in_flight.lock().insert(player_id.clone()) {
            return None;
        }
        Some(SyncGuard {
            in_flight: Arc::clone(&self.in_flight),
            player_id: player_id.clone(),
        })
    }

    /// Returns `true` while a guard for `player_id` is alive.
    #[must_use]
    pub fn is_held(&self, player_id: &PlayerId) -> bool {
        self.in_flight.lock().contains(player_id)
    }
}

/// Releases the player's slot in the [`GuardSet`] when dropped.
#[derive(Debug)]
pub struct SyncGuard {
    in_flight: Arc<Mutex<HashSet<PlayerId>>>,
    player_id: PlayerId,
}

impl Drop for SyncGuard {
    fn drop(&mut self) {
        self.in_flight.lock().remove(&self.player_id);
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Runs round-trips against a [`QueueService`].
pub struct SyncEngine<S: QueueService> {
    service: S,
    guards: GuardSet,
    events: EventHub,
    config: SyncConfig,
}

impl<S: QueueService> SyncEngine<S> {
    /// Creates an engine publishing to `events`.
    pub fn new(service: S, config: SyncConfig, events: EventHub) -> Self {
        Self {
            service,
            guards: GuardSet::default(),
            events,
            config,
        }
    }

    /// The remote service.
    pub const fn service(&self) -> &S {
        &self.service
    }

    /// In-flight guards.
    pub const fn guards(&self) -> &GuardSet {
        &self.guards
    }

    /// Engine settings.
    pub const fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Runs one round-trip for the player whose state is behind `slot`.
    ///
    /// # Errors
    ///
    /// - [`SyncError::Concurrency`] if a sync for this player is running.
    /// - [`SyncError::Network`] if the device is offline, the request times
    ///   out, or the server rejects it. Nothing is applied.
    /// - [`SyncError::ConflictUnresolved`] if the manual strategy parked
    ///   conflicts. The rest of the response is still applied.
    pub async fn sync(
        &self,
        player_id: &PlayerId,
        slot: &tokio::sync::Mutex<OfflineQueueState>,
        strategy: ResolutionStrategy,
    ) -> Result<SyncResult, SyncError> {
        let Some(_guard) = self.guards.acquire(player_id) else {
            return Err(SyncError::Concurrency {
                player_id: player_id.clone(),
            });
        };

        let packet = {
            let mut state = slot.lock().await;
            if !state.status.is_online {
                state.status.manual_sync_requested = false;
                return Err(NetworkError::Offline.into());
            }
            let now = now_ms();
            state.status.sync_in_progress = true;
            state.status.last_sync_attempt = Some(now);
            build_packet(&mut state, now)
        };
        self.events.publish(player_id, QueueEvent::SyncStarted);

        let outcome = self.send(&packet).await;

        let mut state = slot.lock().await;
        let now = now_ms();
        state.status.sync_in_progress = false;
        state.status.manual_sync_requested = false;
        match outcome {
            Ok(response) => {
                let result = reconcile(&mut state, response, strategy, &self.config, now);
                self.announce(player_id, &state, &result, strategy);
                result
            }
            Err(e) => {
                state
                    .status
                    .record_failure(now, e.to_string(), self.config.max_sync_errors);
                warn!(
                    player_id = %player_id,
                    error = %e,
                    failures = state.status.consecutive_failures,
                    pending = state.status.pending_operations_count,
                    "sync failed"
                );
                self.events.publish(
                    player_id,
                    QueueEvent::SyncFailed {
                        error: e.to_string(),
                    },
                );
                Err(e.into())
            }
        }
    }

    async fn send(&self, packet: &SyncPacket) -> Result<SyncResponse, NetworkError> {
        match tokio::time::timeout(
            self.config.sync_timeout,
            self.service.incremental_sync(packet),
        )
        .await
        {
            Err(_) => Err(NetworkError::Timeout),
            Ok(Err(RemoteError::Unavailable)) => Err(NetworkError::Offline),
            Ok(Err(e)) => Err(NetworkError::Transport(e.to_string())),
            Ok(Ok(response)) if !response.success => Err(NetworkError::Rejected),
            Ok(Ok(response)) => Ok(response),
        }
    }

    fn announce(
        &self,
        player_id: &PlayerId,
        state: &OfflineQueueState,
        result: &Result<SyncResult, SyncError>,
        strategy: ResolutionStrategy,
    ) {
        let (applied, resolved) = match result {
            Ok(r) => (r.applied, r.conflicts_resolved),
            Err(_) => (0, 0),
        };
        if resolved > 0 {
            self.events.publish(
                player_id,
                QueueEvent::ConflictsResolved {
                    count: resolved,
                    strategy,
                },
            );
        }
        self.events.publish(
            player_id,
            QueueEvent::SyncCompleted {
                applied,
                server_version: state.server_version,
            },
        );
        info!(
            player_id = %player_id,
            applied,
            conflicts = resolved,
            parked = state.pending_conflicts.len(),
            pending = state.status.pending_operations_count,
            version = state.queue.version,
            "sync completed"
        );
    }
}

// ---------------------------------------------------------------------------
// Phases
// ---------------------------------------------------------------------------

/// Builds a packet from the unapplied operations.
///
/// Operations that fail validation are dropped from the log for good.
pub fn build_packet(state: &mut OfflineQueueState, now: u64) -> SyncPacket {
    let mut operations = Vec::new();
    let mut invalid: Vec<OperationId> = Vec::new();
    for op in state.log.pending() {
        match op.minimize() {
            Ok(wire) => operations.push(wire),
            Err(e) => {
                warn!(
                    player_id = %state.queue.player_id,
                    operation_id = %op.id,
                    op_type = %op.op_type(),
                    error = %e,
                    "dropping malformed operation"
                );
                invalid.push(op.id.clone());
            }
        }
    }
    for id in &invalid {
        state.log.drop_operation(id);
    }
    state.refresh_pending();

    debug!(
        player_id = %state.queue.player_id,
        operations = operations.len(),
        from_version = state.server_version,
        to_version = state.queue.version,
        "built sync packet"
    );
    SyncPacket {
        player_id: state.queue.player_id.clone(),
        from_version: state.server_version,
        to_version: state.queue.version,
        operations,
        checksum: state.queue.checksum.clone(),
        timestamp: now,
    }
}

/// Folds a successful response into the local state.
///
/// Confirmed operations are marked applied, conflicts are resolved with
/// `strategy`, and the server queue becomes the new base with every
/// unapplied operation replayed on top.
///
/// # Errors
///
/// Returns [`SyncError::ConflictUnresolved`] if this response parked
/// conflicts. The state is fully updated either way.
pub fn reconcile(
    state: &mut OfflineQueueState,
    response: SyncResponse,
    strategy: ResolutionStrategy,
    config: &SyncConfig,
    now: u64,
) -> Result<SyncResult, SyncError> {
    let applied = state.log.mark_applied(&response.applied_operations);
    let resolution = resolver::resolve(&state.queue, response.conflicts, strategy);
    let newly_parked = resolution.pending.len();

    let Resolution {
        mut untracked,
        follow_ups,
        resolved,
        pending,
    } = resolution;

    let mut parked = std::mem::take(&mut state.pending_conflicts);
    parked.retain(|old| {
        !resolved
            .iter()
            .chain(&pending)
            .any(|new| same_target(old, new))
    });
    for conflict in &parked {
        untracked.extend(resolver::keep_local(&state.queue, conflict));
    }
    parked.extend(pending);

    let server_version = response.server_queue.version;
    state.rebase(response.server_queue, &untracked, now);
    let follow_up_count = record_follow_ups(state, follow_ups, now);

    state.server_version = server_version;
    state.pending_conflicts = parked;
    state.status.record_success(now);
    state.status.conflicts_detected = state.pending_conflicts.len();
    state.refresh_pending();

    let conflicts_resolved = resolved.len();
    state.push_resolutions(
        resolved.into_iter().map(|conflict| ResolutionRecord {
            at: now,
            strategy,
            conflict,
        }),
        config.max_resolution_log,
    );

    if newly_parked > 0 {
        return Err(SyncError::ConflictUnresolved {
            count: state.pending_conflicts.len(),
        });
    }
    Ok(SyncResult {
        applied,
        conflicts_resolved,
        pending_conflicts: state.pending_conflicts.len(),
        server_version,
        follow_ups: follow_up_count,
    })
}

/// Settles one parked conflict with an explicit choice.
///
/// `task_id` selects the conflict; `None` selects a run-state conflict.
///
/// # Errors
///
/// Returns [`SyncError::UnknownConflict`] if nothing parked matches.
pub fn resolve_parked(
    state: &mut OfflineQueueState,
    task_id: Option<&TaskId>,
    choice: ManualChoice,
    config: &SyncConfig,
    now: u64,
) -> Result<usize, SyncError> {
    let pos = state
        .pending_conflicts
        .iter()
        .position(|c| c.task_id.as_ref() == task_id)
        .ok_or(SyncError::UnknownConflict)?;
    let conflict = state.pending_conflicts.remove(pos);
    let resolution = resolver::resolve_manual(&state.queue, conflict, choice);

    if !resolution.untracked.is_empty() {
        for kind in &resolution.untracked {
            state.queue.apply(kind, now);
        }
        state.queue.touch();
    }
    let follow_ups = record_follow_ups(state, resolution.follow_ups, now);
    state.status.conflicts_detected = state.pending_conflicts.len();
    state.push_resolutions(
        resolution.resolved.into_iter().map(|conflict| ResolutionRecord {
            at: now,
            strategy: ResolutionStrategy::Manual,
            conflict,
        }),
        config.max_resolution_log,
    );
    Ok(follow_ups)
}

fn record_follow_ups(
    state: &mut OfflineQueueState,
    follow_ups: Vec<questline_proto::operation::OperationKind>,
    now: u64,
) -> usize {
    let mut recorded = 0;
    for kind in follow_ups {
        let op_type = kind.op_type();
        match state.record(kind, now) {
            Ok(_) => recorded += 1,
            Err(e) => warn!(
                player_id = %state.queue.player_id,
                %op_type,
                error = %e,
                "skipping invalid follow-up"
            ),
        }
    }
    recorded
}

fn same_target(a: &Conflict, b: &Conflict) -> bool {
    a.task_id == b.task_id && (a.task_id.is_some() || a.kind == b.kind)
}
