//! Integration tests for sync scheduling and concurrency control.
//!
//! Uses tokio's paused clock so retry delays and latency can be stepped
//! through deterministically.

#![allow(
    clippy::expect_used,
    clippy::unwrap_used,
    clippy::similar_names,
    clippy::redundant_clone
)]

use std::sync::Arc;
use std::time::Duration;

use questline::config::SyncConfig;
use questline::events::QueueEvent;
use questline::remote::loopback::LoopbackService;
use questline::store::InMemoryStore;
use questline::sync::{IndicatorStatus, SyncError};
use questline::OfflineQueueManager;
use questline_authority::Authority;
use questline_proto::task::{PlayerId, Task, TaskType};
use tokio::sync::watch;
use tokio::time::Instant;

// ---------------------------------------------------------------------------
// Helper functions
// ---------------------------------------------------------------------------

type Manager = OfflineQueueManager<LoopbackService, InMemoryStore>;

fn p1() -> PlayerId {
    PlayerId::new("p1")
}

fn p2() -> PlayerId {
    PlayerId::new("p2")
}

fn make_manager(config: SyncConfig) -> Arc<Manager> {
    let service = LoopbackService::new(Arc::new(Authority::new()));
    Arc::new(OfflineQueueManager::new(service, InMemoryStore::new(), config))
}

fn fast_config() -> SyncConfig {
    SyncConfig {
        tick_interval: Duration::from_millis(100),
        retry_base: Duration::from_secs(1),
        retry_max: Duration::from_secs(8),
        ..SyncConfig::default()
    }
}

fn training(name: &str) -> Task {
    Task::new(TaskType::Training, name, 10_000)
}

// ---------------------------------------------------------------------------
// Concurrency
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn second_sync_for_same_player_is_refused() {
    let m = make_manager(SyncConfig::default());
    m.add_task(&p1(), training("Strength")).await.unwrap();
    m.service().set_latency(Duration::from_millis(200));

    let first = Arc::clone(&m);
    let flight = tokio::spawn(async move { first.trigger_manual_sync(&p1()).await });
    tokio::time::sleep(Duration::from_millis(10)).await;

    let indicator = m.get_sync_indicator(&p1()).await;
    assert_eq!(indicator.status, IndicatorStatus::Syncing);
    assert_eq!(indicator.progress, Some(0.0));
    assert!(!indicator.can_manual_sync);

    assert_eq!(
        m.trigger_manual_sync(&p1()).await,
        Err(SyncError::Concurrency { player_id: p1() })
    );

    let result = flight.await.unwrap().unwrap();
    assert_eq!(result.applied, 1);
    assert_eq!(m.service().calls(), 1);

    let indicator = m.get_sync_indicator(&p1()).await;
    assert_eq!(indicator.status, IndicatorStatus::Online);
    assert!(indicator.progress.is_none());
}

#[tokio::test(start_paused = true)]
async fn different_players_sync_in_parallel() {
    let m = make_manager(SyncConfig::default());
    m.add_task(&p1(), training("Agility")).await.unwrap();
    m.add_task(&p2(), training("Magic")).await.unwrap();
    m.service().set_latency(Duration::from_millis(200));

    let started = Instant::now();
    let (pa, pb) = (p1(), p2());
    let (a, b) = tokio::join!(m.trigger_manual_sync(&pa), m.trigger_manual_sync(&pb));
    assert_eq!(a.unwrap().applied, 1);
    assert_eq!(b.unwrap().applied, 1);
    assert!(started.elapsed() < Duration::from_millis(300));

    let authority = m.service().authority();
    assert_eq!(authority.queue(&p1()).await.unwrap().len(), 1);
    assert_eq!(authority.queue(&p2()).await.unwrap().len(), 1);
}

// ---------------------------------------------------------------------------
// Retry timing
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn failed_syncs_back_off_exponentially() {
    let m = make_manager(fast_config());
    m.add_task(&p1(), training("Defence")).await.unwrap();
    m.service().set_drop_responses(true);

    let start = Instant::now();
    m.start_scheduler();

    tokio::time::sleep_until(start + Duration::from_millis(900)).await;
    assert_eq!(m.service().calls(), 1);
    assert_eq!(
        m.get_sync_indicator(&p1()).await.status,
        IndicatorStatus::Error
    );

    // Retry after ~1s.
    tokio::time::sleep_until(start + Duration::from_millis(1_300)).await;
    assert_eq!(m.service().calls(), 2);

    // Then after ~2s more, not before.
    tokio::time::sleep_until(start + Duration::from_millis(2_500)).await;
    assert_eq!(m.service().calls(), 2);
    tokio::time::sleep_until(start + Duration::from_millis(4_000)).await;
    assert_eq!(m.service().calls(), 3);

    // Recovery clears the error state.
    m.service().set_drop_responses(false);
    let result = m.trigger_manual_sync(&p1()).await.unwrap();
    assert_eq!(result.applied, 1);
    let indicator = m.get_sync_indicator(&p1()).await;
    assert_eq!(indicator.status, IndicatorStatus::Online);
    assert_eq!(m.service().authority().queue(&p1()).await.unwrap().len(), 1);

    m.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_stops_automatic_syncs() {
    let m = make_manager(fast_config());
    m.start_scheduler();
    m.shutdown().await;

    m.add_task(&p1(), training("Prayer")).await.unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(m.service().calls(), 0);
    assert_eq!(m.get_sync_indicator(&p1()).await.pending_count, 1);
}

// ---------------------------------------------------------------------------
// Connectivity feed
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn external_connectivity_feed_drives_sync() {
    let m = make_manager(fast_config());
    let (feed, connectivity) = watch::channel(true);
    m.start_scheduler_with(connectivity);

    m.service().set_online(false);
    feed.send(false).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!m.is_online());

    m.add_task(&p1(), training("Ranged")).await.unwrap();
    m.add_task(&p1(), training("Cooking")).await.unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(m.service().calls(), 0);
    assert_eq!(
        m.get_sync_indicator(&p1()).await.status,
        IndicatorStatus::Offline
    );

    let mut events = m.subscribe(&p1());
    m.service().set_online(true);
    feed.send(true).unwrap();

    let applied = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Some(QueueEvent::SyncCompleted { applied, .. }) => return applied,
                Some(_) => {}
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("no sync completed in time");
    assert_eq!(applied, 2);
    assert!(m.is_online());
    assert_eq!(m.service().authority().queue(&p1()).await.unwrap().len(), 2);

    m.shutdown().await;
}
