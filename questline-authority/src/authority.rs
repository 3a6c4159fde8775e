//! The authoritative queue service.
//!
//! [`Authority`] consumes [`SyncPacket`]s from clients, applies the
//! operations it has not seen before, and reports divergences it cannot
//! settle on its own as [`Conflict`]s. Conflicting operations are consumed
//! but not applied; the client decides what to do with them.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use questline_proto::operation::{NewTask, OperationId, OperationKind, WireOperation, WirePayload};
use questline_proto::queue::TaskQueue;
use questline_proto::sync::{Conflict, SyncPacket, SyncResponse};
use questline_proto::task::{PlayerId, Task, TaskId, TaskPatch, now_ms};
use tokio::sync::RwLock;

use crate::ledger::{DEFAULT_MAX_SEEN_OPERATIONS, PlayerLedger};

/// Default maximum number of tasks a player may hold on the server.
pub const DEFAULT_MAX_QUEUE_LEN: usize = 50;

/// Errors from server-side queue mutations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AuthorityError {
    /// The player has never synced.
    #[error("unknown player: {0}")]
    UnknownPlayer(PlayerId),
    /// The task is not in the player's queue.
    #[error("unknown task: {0}")]
    UnknownTask(TaskId),
    /// The player has no active task.
    #[error("player {0} has no active task")]
    NoActiveTask(PlayerId),
    /// Progress is not a fraction in `[0, 1]`.
    #[error("progress {0} is outside [0, 1]")]
    InvalidProgress(f64),
}

/// Outcome of checking one unseen operation.
enum Verdict {
    Apply,
    AlreadyPresent,
    Conflict(Conflict),
}

/// In-process authoritative reconciler for every player's queue.
///
/// Thread-safe via [`RwLock`]; each call holds the write lock for the
/// whole packet so a packet is applied atomically.
pub struct Authority {
    players: RwLock<HashMap<PlayerId, PlayerLedger>>,
    max_seen_operations: usize,
    max_queue_len: usize,
    read_only: AtomicBool,
}

impl Default for Authority {
    fn default() -> Self {
        Self::new()
    }
}

impl Authority {
    /// Creates an authority with default limits.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(DEFAULT_MAX_SEEN_OPERATIONS, DEFAULT_MAX_QUEUE_LEN)
    }

    /// Creates an authority with custom dedup memory and queue length limits.
    #[must_use]
    pub fn with_config(max_seen_operations: usize, max_queue_len: usize) -> Self {
        Self {
            players: RwLock::new(HashMap::new()),
            max_seen_operations,
            max_queue_len,
            read_only: AtomicBool::new(false),
        }
    }

    /// Puts the authority into (or out of) maintenance mode, in which every
    /// packet is refused with `success == false`.
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    /// Processes one incremental sync packet.
    pub async fn incremental_sync(&self, packet: &SyncPacket) -> SyncResponse {
        let mut players = self.players.write().await;
        let ledger = players.entry(packet.player_id.clone()).or_insert_with(|| {
            PlayerLedger::new(packet.player_id.clone(), self.max_seen_operations)
        });

        if self.read_only.load(Ordering::SeqCst) {
            tracing::warn!(player_id = %packet.player_id, "refusing sync packet: read-only");
            return SyncResponse {
                success: false,
                conflicts: Vec::new(),
                server_queue: ledger.queue().clone(),
                applied_operations: Vec::new(),
            };
        }

        let now = now_ms();
        // Every operation the client is (re)sending, including ones consumed
        // by an earlier attempt whose response was lost.
        let own: HashSet<OperationId> = packet
            .operations
            .iter()
            .map(|op| op.id.clone())
            .collect();
        let mut conflicts = Vec::new();
        let mut applied_operations = Vec::with_capacity(packet.operations.len());

        for op in &packet.operations {
            applied_operations.push(op.id.clone());
            if !ledger.seen_mut().insert(op.id.clone()) {
                tracing::debug!(
                    player_id = %packet.player_id,
                    operation_id = %op.id,
                    "skipping already-applied operation"
                );
                continue;
            }
            match self.check(ledger, &own, packet.from_version, op) {
                Verdict::Apply => {
                    ledger.commit(&op.to_kind(), now, Some(&op.id));
                }
                Verdict::AlreadyPresent => {
                    tracing::debug!(
                        player_id = %packet.player_id,
                        operation_id = %op.id,
                        "task already present, add skipped"
                    );
                }
                Verdict::Conflict(conflict) => {
                    tracing::debug!(
                        player_id = %packet.player_id,
                        operation_id = %op.id,
                        kind = %conflict.kind,
                        "operation conflicts with server state"
                    );
                    conflicts.push(conflict);
                }
            }
        }

        tracing::info!(
            player_id = %packet.player_id,
            from_version = packet.from_version,
            server_version = ledger.queue().version,
            operations = packet.operations.len(),
            conflicts = conflicts.len(),
            "sync packet processed"
        );

        SyncResponse {
            success: true,
            conflicts,
            server_queue: ledger.queue().clone(),
            applied_operations,
        }
    }

    /// Decides what to do with an unseen operation: apply it, skip it, or
    /// report that it raced a server change the client has not seen yet.
    fn check(
        &self,
        ledger: &PlayerLedger,
        own: &HashSet<OperationId>,
        from_version: u64,
        op: &WireOperation,
    ) -> Verdict {
        let raced = |id: &TaskId| ledger.task_changed_after(id, from_version, own);
        let queue = ledger.queue();
        match &op.payload {
            WirePayload::AddTask(new_task) => match queue.find_task(&new_task.id) {
                Some(server) if raced(&server.id) && NewTask::from(server) != *new_task => {
                    let client = NewTask::clone(new_task).into_task();
                    Verdict::Conflict(Conflict::task_modified(server.clone(), client))
                }
                Some(_) => Verdict::AlreadyPresent,
                None if raced(&new_task.id) || queue.len() >= self.max_queue_len => {
                    Verdict::Conflict(Conflict::task_added(NewTask::clone(new_task).into_task()))
                }
                None => Verdict::Apply,
            },
            WirePayload::UpdateTask { task_id, patch } => match queue.find_task(task_id) {
                None => Verdict::Conflict(Conflict::task_removed(task_id.clone(), None)),
                Some(server) if raced(task_id) && !patch_agrees(patch, server) => {
                    let client = patch.apply_to(server);
                    Verdict::Conflict(Conflict::task_modified(server.clone(), client))
                }
                Some(_) => Verdict::Apply,
            },
            WirePayload::PauseQueue | WirePayload::ResumeQueue => {
                let wants_paused = matches!(op.payload, WirePayload::PauseQueue);
                let raced = ledger.run_state_changed_after(from_version, own);
                if raced && queue.is_paused != wants_paused {
                    let server = queue.snapshot();
                    let mut client = server.clone();
                    client.is_paused = wants_paused;
                    client.is_running = client.current_task_id.is_some() && !wants_paused;
                    Verdict::Conflict(Conflict::queue_state_changed(server, client))
                } else {
                    Verdict::Apply
                }
            }
            WirePayload::RemoveTask { .. }
            | WirePayload::ReorderTasks { .. }
            | WirePayload::ClearQueue => Verdict::Apply,
        }
    }

    /// Snapshot of a player's server queue, if the player is known.
    pub async fn queue(&self, player_id: &PlayerId) -> Option<TaskQueue> {
        let players = self.players.read().await;
        players.get(player_id).map(|l| l.queue().clone())
    }

    /// Number of operation ids remembered for dedup.
    pub async fn seen_operations(&self, player_id: &PlayerId) -> usize {
        let players = self.players.read().await;
        players.get(player_id).map_or(0, |l| l.seen().len())
    }

    /// Sets the progress of a task, as the game simulation would.
    ///
    /// # Errors
    ///
    /// Returns [`AuthorityError`] if the player or task is unknown or the
    /// progress is out of range.
    pub async fn advance_progress(
        &self,
        player_id: &PlayerId,
        task_id: &TaskId,
        progress: f64,
    ) -> Result<TaskQueue, AuthorityError> {
        if !(0.0..=1.0).contains(&progress) {
            return Err(AuthorityError::InvalidProgress(progress));
        }
        self.mutate(player_id, |queue| {
            if !queue.contains(task_id) {
                return Err(AuthorityError::UnknownTask(task_id.clone()));
            }
            Ok(OperationKind::UpdateTask {
                task_id: task_id.clone(),
                patch: TaskPatch {
                    progress: Some(progress),
                    ..TaskPatch::default()
                },
            })
        })
        .await
    }

    /// Runs the active task for `elapsed_ms`, completing it when its
    /// duration is reached. Returns the queue after the tick.
    ///
    /// # Errors
    ///
    /// Returns [`AuthorityError`] if the player is unknown or idle.
    #[allow(clippy::cast_precision_loss)]
    pub async fn tick(
        &self,
        player_id: &PlayerId,
        elapsed_ms: u64,
    ) -> Result<TaskQueue, AuthorityError> {
        let queue = self
            .queue(player_id)
            .await
            .ok_or_else(|| AuthorityError::UnknownPlayer(player_id.clone()))?;
        let current = queue
            .current_task
            .filter(|_| queue.is_running)
            .ok_or_else(|| AuthorityError::NoActiveTask(player_id.clone()))?;
        let step = elapsed_ms as f64 / current.duration_ms as f64;
        let progress = (current.progress + step).min(1.0);
        if progress >= 1.0 {
            self.complete_current(player_id).await?;
            return self
                .queue(player_id)
                .await
                .ok_or_else(|| AuthorityError::UnknownPlayer(player_id.clone()));
        }
        self.advance_progress(player_id, &current.id, progress).await
    }

    /// Finishes the active task and removes it, promoting the next one.
    ///
    /// # Errors
    ///
    /// Returns [`AuthorityError`] if the player is unknown or idle.
    pub async fn complete_current(&self, player_id: &PlayerId) -> Result<Task, AuthorityError> {
        let mut finished = None;
        self.mutate(player_id, |queue| {
            let current = queue
                .current_task
                .as_ref()
                .ok_or_else(|| AuthorityError::NoActiveTask(player_id.clone()))?;
            let mut done = current.clone();
            done.progress = 1.0;
            done.completed = true;
            let task_id = done.id.clone();
            finished = Some(done);
            Ok(OperationKind::RemoveTask { task_id })
        })
        .await?;
        finished.ok_or_else(|| AuthorityError::NoActiveTask(player_id.clone()))
    }

    /// Removes a task on the server side.
    ///
    /// # Errors
    ///
    /// Returns [`AuthorityError`] if the player or task is unknown.
    pub async fn remove_task(
        &self,
        player_id: &PlayerId,
        task_id: &TaskId,
    ) -> Result<TaskQueue, AuthorityError> {
        self.mutate(player_id, |queue| {
            if !queue.contains(task_id) {
                return Err(AuthorityError::UnknownTask(task_id.clone()));
            }
            Ok(OperationKind::RemoveTask {
                task_id: task_id.clone(),
            })
        })
        .await
    }

    /// Pauses or resumes a player's queue on the server side.
    ///
    /// # Errors
    ///
    /// Returns [`AuthorityError::UnknownPlayer`] if the player never synced.
    pub async fn set_paused(
        &self,
        player_id: &PlayerId,
        paused: bool,
    ) -> Result<TaskQueue, AuthorityError> {
        self.mutate(player_id, |_| {
            Ok(if paused {
                OperationKind::PauseQueue
            } else {
                OperationKind::ResumeQueue
            })
        })
        .await
    }

    async fn mutate<F>(&self, player_id: &PlayerId, build: F) -> Result<TaskQueue, AuthorityError>
    where
        F: FnOnce(&TaskQueue) -> Result<OperationKind, AuthorityError>,
    {
        let mut players = self.players.write().await;
        let ledger = players
            .get_mut(player_id)
            .ok_or_else(|| AuthorityError::UnknownPlayer(player_id.clone()))?;
        let kind = build(ledger.queue())?;
        ledger.commit(&kind, now_ms(), None);
        tracing::debug!(
            player_id = %player_id,
            op = %kind.op_type(),
            version = ledger.queue().version,
            "server-side mutation"
        );
        Ok(ledger.queue().clone())
    }
}

/// Returns `true` if applying `patch` would leave `server` unchanged.
fn patch_agrees(patch: &TaskPatch, server: &Task) -> bool {
    patch.changed_against(server).is_empty()
}
