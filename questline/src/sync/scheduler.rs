//! Background trigger for sync attempts.
//!
//! The scheduler owns no queue state. It asks a [`SyncDriver`] which
//! players are due on every tick, and syncs every player with pending work
//! when connectivity comes back. Each attempt runs as its own task so a
//! slow player never delays another.

use std::sync::Arc;
use std::time::Duration;

use questline_proto::task::PlayerId;
use rand::Rng;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::engine::SyncResult;
use super::SyncError;

/// The side of the manager the scheduler drives.
pub trait SyncDriver: Send + Sync + 'static {
    /// Players that are online, idle, have pending operations, and whose
    /// cooldown ended before `now`.
    fn due_players(&self, now: Instant) -> impl std::future::Future<Output = Vec<PlayerId>> + Send;

    /// Players with at least one unapplied operation.
    fn players_with_pending(&self) -> impl std::future::Future<Output = Vec<PlayerId>> + Send;

    /// Records a connectivity change.
    fn set_online(&self, online: bool) -> impl std::future::Future<Output = ()> + Send;

    /// Runs one attempt for `player_id` with the default strategy.
    fn run_sync(
        &self,
        player_id: PlayerId,
    ) -> impl std::future::Future<Output = Result<SyncResult, SyncError>> + Send;
}

/// Delay before the next attempt after `failures` consecutive failures:
/// `min(base * 2^(failures - 1), max)`, or zero with no failures.
#[must_use]
pub fn backoff(failures: u32, base: Duration, max: Duration) -> Duration {
    if failures == 0 {
        return Duration::ZERO;
    }
    let exponent = (failures - 1).min(31);
    base.saturating_mul(1_u32 << exponent).min(max)
}

/// Adds up to 10% random jitter.
#[must_use]
pub fn jittered(delay: Duration) -> Duration {
    let spread = u64::try_from(delay.as_millis() / 10).unwrap_or(u64::MAX);
    if spread == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::rng().random_range(0..=spread))
}

/// Spawns the scheduler loop.
pub struct SyncScheduler;

impl SyncScheduler {
    /// Starts polling `driver` every `tick` and watching `connectivity`.
    ///
    /// The loop runs until [`SchedulerHandle::shutdown`] is called or the
    /// handle is dropped.
    pub fn spawn<D: SyncDriver>(
        driver: Arc<D>,
        mut connectivity: watch::Receiver<bool>,
        tick: Duration,
    ) -> SchedulerHandle {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut attempts: JoinSet<()> = JoinSet::new();
            let mut was_online = *connectivity.borrow_and_update();
            let mut watching = true;
            driver.set_online(was_online).await;

            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        for player_id in driver.due_players(Instant::now()).await {
                            spawn_attempt(&mut attempts, &driver, player_id);
                        }
                    }
                    changed = connectivity.changed(), if watching => {
                        if changed.is_err() {
                            debug!("connectivity feed closed");
                            watching = false;
                            continue;
                        }
                        // A change that reads `true` twice in a row still
                        // means an offline period happened in between.
                        let online = *connectivity.borrow_and_update();
                        driver.set_online(online).await;
                        if online {
                            let players = driver.players_with_pending().await;
                            info!(
                                players = players.len(),
                                was_online,
                                "back online, syncing pending players"
                            );
                            for player_id in players {
                                spawn_attempt(&mut attempts, &driver, player_id);
                            }
                        } else {
                            info!("connectivity lost");
                        }
                        was_online = online;
                    }
                    Some(joined) = attempts.join_next(), if !attempts.is_empty() => {
                        if let Err(e) = joined {
                            warn!(error = %e, "sync task panicked");
                        }
                    }
                }
            }
            attempts.shutdown().await;
            debug!("sync scheduler stopped");
        });
        SchedulerHandle {
            stop: Some(stop_tx),
            task,
        }
    }
}

fn spawn_attempt<D: SyncDriver>(attempts: &mut JoinSet<()>, driver: &Arc<D>, player_id: PlayerId) {
    let driver = Arc::clone(driver);
    attempts.spawn(async move {
        match driver.run_sync(player_id.clone()).await {
            Ok(result) => {
                debug!(player_id = %player_id, applied = result.applied, "scheduled sync done");
            }
            Err(SyncError::Concurrency { .. }) => {
                debug!(player_id = %player_id, "sync already running, skipped");
            }
            Err(e) => debug!(player_id = %player_id, error = %e, "scheduled sync failed"),
        }
    });
}

/// Stops the scheduler loop.
pub struct SchedulerHandle {
    stop: Option<oneshot::Sender<()>>,
    task: tokio::task::JoinHandle<()>,
}

impl SchedulerHandle {
    /// Cancels the timer and waits for in-flight attempts to be dropped.
    pub async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Err(e) = (&mut self.task).await {
            warn!(error = %e, "sync scheduler ended abnormally");
        }
    }

    /// Returns `true` once the loop has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
