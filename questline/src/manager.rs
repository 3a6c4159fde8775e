//! The offline queue service.
//!
//! [`OfflineQueueManager`] is the only entry point callers need: it owns
//! per-player state, persists every change through a [`QueueStore`], runs
//! round-trips through a [`SyncEngine`], and publishes [`QueueEvent`]s.
//!
//! Player state is loaded lazily on first use and kept in an arena keyed
//! by player id. Each entry has its own async mutex, so different players
//! never contend and one player's calls are serialized.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use questline_proto::operation::OperationId;
use questline_proto::queue::TaskQueue;
use questline_proto::sync::Conflict;
use questline_proto::task::{PlayerId, Task, TaskId, TaskPatch, now_ms};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::SyncConfig;
use crate::events::{EventHub, QueueEvent, Subscription};
use crate::queue::{OfflineQueueState, QueueError};
use crate::remote::QueueService;
use crate::store::{QueueStore, StoreError};
use crate::sync::engine::{self, SyncEngine, SyncResult};
use crate::sync::resolver::{ManualChoice, ResolutionRecord, ResolutionStrategy};
use crate::sync::scheduler::{self, SchedulerHandle, SyncDriver, SyncScheduler};
use crate::sync::status::{self, SyncIndicator};
use crate::sync::SyncError;

struct PlayerEntry {
    state: tokio::sync::Mutex<OfflineQueueState>,
    /// Earliest time the scheduler may start another attempt.
    next_attempt: Mutex<Option<Instant>>,
}

/// Offline-first task queue manager, generic over the remote service and
/// the durable store.
pub struct OfflineQueueManager<S: QueueService, St: QueueStore> {
    players: RwLock<HashMap<PlayerId, Arc<PlayerEntry>>>,
    store: St,
    engine: SyncEngine<S>,
    events: EventHub,
    config: SyncConfig,
    online: watch::Sender<bool>,
    scheduler: Mutex<Option<SchedulerHandle>>,
}

impl<S: QueueService, St: QueueStore> OfflineQueueManager<S, St> {
    /// Creates a manager that starts out online.
    pub fn new(service: S, store: St, config: SyncConfig) -> Self {
        let events = EventHub::new(config.event_buffer);
        let (online, _) = watch::channel(true);
        Self {
            players: RwLock::new(HashMap::new()),
            store,
            engine: SyncEngine::new(service, config.clone(), events.clone()),
            events,
            config,
            online,
            scheduler: Mutex::new(None),
        }
    }

    /// The remote service.
    pub const fn service(&self) -> &S {
        self.engine.service()
    }

    /// The durable store.
    pub const fn store(&self) -> &St {
        &self.store
    }

    /// Active settings.
    pub const fn config(&self) -> &SyncConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Local mutations
    // -----------------------------------------------------------------------

    /// Queues a task.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError`] if the task is malformed or already queued.
    pub async fn add_task(&self, player_id: &PlayerId, task: Task) -> Result<OperationId, QueueError> {
        self.mutate(player_id, |state, now| state.add_task(task, now))
            .await
    }

    /// Removes a task.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::UnknownTask`] if the task is not queued.
    pub async fn remove_task(
        &self,
        player_id: &PlayerId,
        task_id: &TaskId,
    ) -> Result<OperationId, QueueError> {
        self.mutate(player_id, |state, now| state.remove_task(task_id, now))
            .await
    }

    /// Moves the listed backlog tasks to the front, in order.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Invalid`] if an id is listed twice.
    pub async fn reorder_tasks(
        &self,
        player_id: &PlayerId,
        order: Vec<TaskId>,
    ) -> Result<OperationId, QueueError> {
        self.mutate(player_id, |state, now| state.reorder_tasks(order, now))
            .await
    }

    /// Pauses the queue.
    ///
    /// # Errors
    ///
    /// Shares the mutation signature; does not fail in practice.
    pub async fn pause_queue(&self, player_id: &PlayerId) -> Result<OperationId, QueueError> {
        self.mutate(player_id, |state, now| state.pause(now)).await
    }

    /// Resumes the queue.
    ///
    /// # Errors
    ///
    /// Shares the mutation signature; does not fail in practice.
    pub async fn resume_queue(&self, player_id: &PlayerId) -> Result<OperationId, QueueError> {
        self.mutate(player_id, |state, now| state.resume(now)).await
    }

    /// Drops every task.
    ///
    /// # Errors
    ///
    /// Shares the mutation signature; does not fail in practice.
    pub async fn clear_queue(&self, player_id: &PlayerId) -> Result<OperationId, QueueError> {
        self.mutate(player_id, |state, now| state.clear(now)).await
    }

    /// Changes fields of a task.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError`] if the task is unknown or the patch is
    /// malformed or changes nothing.
    pub async fn update_task(
        &self,
        player_id: &PlayerId,
        task_id: &TaskId,
        patch: &TaskPatch,
    ) -> Result<OperationId, QueueError> {
        self.mutate(player_id, |state, now| state.update_task(task_id, patch, now))
            .await
    }

    async fn mutate<F>(&self, player_id: &PlayerId, apply: F) -> Result<OperationId, QueueError>
    where
        F: FnOnce(&mut OfflineQueueState, u64) -> Result<OperationId, QueueError> + Send,
    {
        let entry = self.entry(player_id).await;
        let mut state = entry.state.lock().await;
        let id = apply(&mut state, now_ms())?;
        self.persist(player_id, &state).await;
        self.events.publish(
            player_id,
            QueueEvent::QueueChanged {
                version: state.queue.version,
                pending: state.status.pending_operations_count,
            },
        );
        Ok(id)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Current local queue.
    pub async fn get_queue_state(&self, player_id: &PlayerId) -> TaskQueue {
        let entry = self.entry(player_id).await;
        let state = entry.state.lock().await;
        state.queue.clone()
    }

    /// Status summary for the UI.
    pub async fn get_sync_indicator(&self, player_id: &PlayerId) -> SyncIndicator {
        let entry = self.entry(player_id).await;
        let state = entry.state.lock().await;
        status::project(&state.status, now_ms())
    }

    /// Conflicts parked for a manual decision.
    pub async fn pending_conflicts(&self, player_id: &PlayerId) -> Vec<Conflict> {
        let entry = self.entry(player_id).await;
        let state = entry.state.lock().await;
        state.pending_conflicts.clone()
    }

    /// Resolved conflicts, oldest first.
    pub async fn conflict_log(&self, player_id: &PlayerId) -> Vec<ResolutionRecord> {
        let entry = self.entry(player_id).await;
        let state = entry.state.lock().await;
        state.resolution_log.iter().cloned().collect()
    }

    /// Subscribes to a player's events.
    #[must_use]
    pub fn subscribe(&self, player_id: &PlayerId) -> Subscription {
        self.events.subscribe(player_id)
    }

    // -----------------------------------------------------------------------
    // Sync
    // -----------------------------------------------------------------------

    /// Syncs now with the configured strategy.
    ///
    /// # Errors
    ///
    /// See [`SyncEngine::sync`]. A sync already in flight for this player
    /// yields [`SyncError::Concurrency`].
    pub async fn trigger_manual_sync(&self, player_id: &PlayerId) -> Result<SyncResult, SyncError> {
        self.sync_player(player_id, self.config.strategy, true).await
    }

    /// Syncs now with an explicit strategy.
    ///
    /// # Errors
    ///
    /// See [`SyncEngine::sync`].
    pub async fn sync_with_strategy(
        &self,
        player_id: &PlayerId,
        strategy: ResolutionStrategy,
    ) -> Result<SyncResult, SyncError> {
        self.sync_player(player_id, strategy, true).await
    }

    /// Settles a parked conflict. `task_id` selects it; `None` selects a
    /// run-state conflict. Returns how many follow-up operations were
    /// recorded for the next sync.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::UnknownConflict`] if nothing parked matches.
    pub async fn resolve_conflict(
        &self,
        player_id: &PlayerId,
        task_id: Option<&TaskId>,
        choice: ManualChoice,
    ) -> Result<usize, SyncError> {
        let entry = self.entry(player_id).await;
        let mut state = entry.state.lock().await;
        let follow_ups = engine::resolve_parked(&mut state, task_id, choice, &self.config, now_ms())?;
        self.persist(player_id, &state).await;
        debug!(player_id = %player_id, ?choice, follow_ups, "conflict settled");
        self.events.publish(
            player_id,
            QueueEvent::ConflictsResolved {
                count: 1,
                strategy: ResolutionStrategy::Manual,
            },
        );
        self.events.publish(
            player_id,
            QueueEvent::QueueChanged {
                version: state.queue.version,
                pending: state.status.pending_operations_count,
            },
        );
        Ok(follow_ups)
    }

    async fn sync_player(
        &self,
        player_id: &PlayerId,
        strategy: ResolutionStrategy,
        manual: bool,
    ) -> Result<SyncResult, SyncError> {
        let entry = self.entry(player_id).await;
        if manual {
            entry.state.lock().await.status.manual_sync_requested = true;
        }
        let result = self.engine.sync(player_id, &entry.state, strategy).await;
        if matches!(result, Err(SyncError::Concurrency { .. })) {
            return result;
        }

        let state = entry.state.lock().await;
        self.persist(player_id, &state).await;
        let failures = state.status.consecutive_failures;
        drop(state);

        let cooldown = if failures == 0 {
            self.config.sync_interval
        } else {
            scheduler::jittered(scheduler::backoff(
                failures,
                self.config.retry_base,
                self.config.retry_max,
            ))
        };
        *entry.next_attempt.lock() = Some(Instant::now() + cooldown);
        result
    }

    // -----------------------------------------------------------------------
    // Connectivity and lifecycle
    // -----------------------------------------------------------------------

    /// Records a connectivity change for every loaded player.
    ///
    /// With a running scheduler, going online syncs every player with
    /// pending operations right away.
    pub async fn set_online(&self, online: bool) {
        let changed = self.online.send_if_modified(|current| {
            let changed = *current != online;
            *current = online;
            changed
        });
        for entry in self.entries() {
            entry.state.lock().await.status.is_online = online;
        }
        if changed {
            info!(online, "connectivity changed");
            self.events
                .publish_all(&QueueEvent::ConnectivityChanged { online });
        }
    }

    /// Current connectivity.
    #[must_use]
    pub fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    /// A feed of connectivity changes made through [`set_online`](Self::set_online).
    #[must_use]
    pub fn watch_connectivity(&self) -> watch::Receiver<bool> {
        self.online.subscribe()
    }

    /// Starts the background scheduler fed by [`set_online`](Self::set_online).
    pub fn start_scheduler(self: &Arc<Self>)
    where
        S: 'static,
        St: 'static,
    {
        self.start_scheduler_with(self.watch_connectivity());
    }

    /// Starts the background scheduler fed by an external connectivity
    /// monitor. Replaces a running scheduler.
    pub fn start_scheduler_with(self: &Arc<Self>, connectivity: watch::Receiver<bool>)
    where
        S: 'static,
        St: 'static,
    {
        let handle =
            SyncScheduler::spawn(Arc::clone(self), connectivity, self.config.tick_interval);
        let previous = self.scheduler.lock().replace(handle);
        if previous.is_some() {
            debug!("replaced running sync scheduler");
        }
    }

    /// Stops the scheduler and forgets all in-memory state. Everything was
    /// already persisted when it changed.
    pub async fn shutdown(&self) {
        let handle = self.scheduler.lock().take();
        if let Some(handle) = handle {
            handle.shutdown().await;
        }
        self.players.write().clear();
        info!("offline queue manager shut down");
    }

    // -----------------------------------------------------------------------
    // Internal helpers
    // -----------------------------------------------------------------------

    fn entries(&self) -> Vec<Arc<PlayerEntry>> {
        self.players.read().values().cloned().collect()
    }

    fn entries_with_ids(&self) -> Vec<(PlayerId, Arc<PlayerEntry>)> {
        self.players
            .read()
            .iter()
            .map(|(id, entry)| (id.clone(), Arc::clone(entry)))
            .collect()
    }

    /// Returns the player's entry, loading it from the store on first use.
    async fn entry(&self, player_id: &PlayerId) -> Arc<PlayerEntry> {
        let existing = self.players.read().get(player_id).cloned();
        if let Some(entry) = existing {
            return entry;
        }

        let mut state = match self.store.load(player_id).await {
            Ok(Some(state)) => state,
            Ok(None) => OfflineQueueState::new(player_id.clone()),
            Err(StoreError::Corrupt(reason)) => {
                error!(player_id = %player_id, error = %reason, "stored queue is corrupt, starting empty");
                OfflineQueueState::new(player_id.clone())
            }
            Err(e) => {
                warn!(player_id = %player_id, error = %e, "failed to load queue, starting empty");
                OfflineQueueState::new(player_id.clone())
            }
        };
        state.set_log_capacity(self.config.max_operations);
        state.status.is_online = self.is_online();

        let mut players = self.players.write();
        let entry = players.entry(player_id.clone()).or_insert_with(|| {
            Arc::new(PlayerEntry {
                state: tokio::sync::Mutex::new(state),
                next_attempt: Mutex::new(None),
            })
        });
        Arc::clone(entry)
    }

    async fn persist(&self, player_id: &PlayerId, state: &OfflineQueueState) {
        if let Err(e) = self.store.save(player_id, state).await {
            warn!(player_id = %player_id, error = %e, "failed to persist queue state");
        }
    }
}

impl<S, St> SyncDriver for OfflineQueueManager<S, St>
where
    S: QueueService + 'static,
    St: QueueStore + 'static,
{
    async fn due_players(&self, now: Instant) -> Vec<PlayerId> {
        let mut due = Vec::new();
        for (player_id, entry) in self.entries_with_ids() {
            if self.engine.guards().is_held(&player_id) {
                continue;
            }
            let cooling = entry.next_attempt.lock().is_some_and(|at| at > now);
            if cooling {
                continue;
            }
            let state = entry.state.lock().await;
            if state.status.is_online && state.status.pending_operations_count > 0 {
                due.push(player_id);
            }
        }
        due
    }

    async fn players_with_pending(&self) -> Vec<PlayerId> {
        let mut pending = Vec::new();
        for (player_id, entry) in self.entries_with_ids() {
            if entry.state.lock().await.status.pending_operations_count > 0 {
                pending.push(player_id);
            }
        }
        pending
    }

    async fn set_online(&self, online: bool) {
        Self::set_online(self, online).await;
    }

    async fn run_sync(&self, player_id: PlayerId) -> Result<SyncResult, SyncError> {
        self.sync_player(&player_id, self.config.strategy, false).await
    }
}
