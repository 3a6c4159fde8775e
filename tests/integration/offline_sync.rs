//! Integration tests for offline editing and incremental sync.
//!
//! Drives an `OfflineQueueManager` against an in-process authority through
//! the loopback service, covering clean syncs, lost responses, automatic
//! sync on reconnect, and durable storage.

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
use questline::store::file::FileStore;
use questline::store::InMemoryStore;
use questline::sync::{IndicatorStatus, NetworkError, ResolutionStrategy, SyncError};
use questline::OfflineQueueManager;
use questline_authority::Authority;
use questline_proto::task::{PlayerId, Task, TaskId, TaskPatch, TaskType};

// ---------------------------------------------------------------------------
// Helper functions
// ---------------------------------------------------------------------------

type Manager = OfflineQueueManager<LoopbackService, InMemoryStore>;

fn p1() -> PlayerId {
    PlayerId::new("p1")
}

fn make_manager(config: SyncConfig) -> Arc<Manager> {
    let service = LoopbackService::new(Arc::new(Authority::new()));
    Arc::new(OfflineQueueManager::new(service, InMemoryStore::new(), config))
}

fn task(name: &str) -> Task {
    Task::new(TaskType::Gathering, name, 60_000)
}

fn ids(tasks: &[Task]) -> Vec<TaskId> {
    tasks.iter().map(|t| t.id.clone()).collect()
}

/// Waits for the next `SyncCompleted` event, failing after five seconds.
async fn wait_for_sync(events: &mut questline::events::Subscription) -> (usize, u64) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Some(QueueEvent::SyncCompleted {
                    applied,
                    server_version,
                }) => return (applied, server_version),
                Some(_) => {}
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("no sync completed in time")
}

// ---------------------------------------------------------------------------
// Clean sync
// ---------------------------------------------------------------------------

#[tokio::test]
async fn local_operations_sync_without_conflicts() {
    let m = make_manager(SyncConfig::default());
    let tasks = vec![task("Chop oak"), task("Mine iron"), task("Fish trout")];
    for t in &tasks {
        m.add_task(&p1(), t.clone()).await.unwrap();
    }
    m.reorder_tasks(&p1(), vec![tasks[2].id.clone(), tasks[1].id.clone()])
        .await
        .unwrap();
    m.pause_queue(&p1()).await.unwrap();

    let result = m.trigger_manual_sync(&p1()).await.unwrap();
    assert_eq!(result.applied, 5);
    assert_eq!(result.conflicts_resolved, 0);
    assert_eq!(result.server_version, 5);

    let local = m.get_queue_state(&p1()).await;
    let server = m.service().authority().queue(&p1()).await.unwrap();
    assert_eq!(local.checksum, server.checksum);
    assert_eq!(ids(&local.queued), vec![tasks[2].id.clone(), tasks[1].id.clone()]);
    assert!(local.is_paused);
    assert!(local.last_synced.is_some());

    let indicator = m.get_sync_indicator(&p1()).await;
    assert_eq!(indicator.status, IndicatorStatus::Online);
    assert_eq!(indicator.pending_count, 0);
    assert!(indicator.last_sync.is_some());
}

#[tokio::test]
async fn lost_response_is_resent_without_duplication() {
    let m = make_manager(SyncConfig::default());
    let t = task("Smelt bronze");
    m.add_task(&p1(), t.clone()).await.unwrap();

    m.service().set_drop_responses(true);
    let err = m.trigger_manual_sync(&p1()).await.unwrap_err();
    assert!(matches!(
        err,
        SyncError::Network(NetworkError::Transport(_))
    ));

    let authority = m.service().authority();
    assert_eq!(authority.queue(&p1()).await.unwrap().len(), 1);
    let indicator = m.get_sync_indicator(&p1()).await;
    assert_eq!(indicator.status, IndicatorStatus::Error);
    assert_eq!(indicator.pending_count, 1);

    m.service().set_drop_responses(false);
    let result = m.trigger_manual_sync(&p1()).await.unwrap();
    assert_eq!(result.applied, 1);
    assert_eq!(result.server_version, 1);

    let server = authority.queue(&p1()).await.unwrap();
    assert_eq!(server.len(), 1);
    assert!(server.contains(&t.id));
    assert_eq!(authority.seen_operations(&p1()).await, 1);
    assert_eq!(m.service().calls(), 2);
    assert_eq!(
        m.get_sync_indicator(&p1()).await.status,
        IndicatorStatus::Online
    );
}

#[tokio::test]
async fn edit_after_lost_response_syncs_without_conflict() {
    let m = make_manager(SyncConfig::default());
    let t = task("Smelt bronze");
    m.add_task(&p1(), t.clone()).await.unwrap();

    m.service().set_drop_responses(true);
    assert!(m.trigger_manual_sync(&p1()).await.is_err());
    m.service().set_drop_responses(false);

    let patch = TaskPatch {
        name: Some("Smelt iron".to_string()),
        priority: Some(7),
        ..TaskPatch::default()
    };
    m.update_task(&p1(), &t.id, &patch).await.unwrap();

    let result = m
        .sync_with_strategy(&p1(), ResolutionStrategy::ServerWins)
        .await
        .unwrap();
    assert_eq!(result.applied, 2);
    assert_eq!(result.conflicts_resolved, 0);
    assert_eq!(result.pending_conflicts, 0);
    assert!(m.conflict_log(&p1()).await.is_empty());

    let server = m.service().authority().queue(&p1()).await.unwrap();
    let remote = server.find_task(&t.id).unwrap();
    assert_eq!(remote.name, "Smelt iron");
    assert_eq!(remote.priority, 7);

    let local = m.get_queue_state(&p1()).await;
    let kept = local.find_task(&t.id).unwrap();
    assert_eq!(kept.name, "Smelt iron");
    assert_eq!(kept.priority, 7);
    assert_eq!(local.checksum, server.checksum);
    assert_eq!(m.get_sync_indicator(&p1()).await.pending_count, 0);
}

#[tokio::test]
async fn repeated_reorders_send_only_the_latest() {
    let m = make_manager(SyncConfig::default());
    let tasks = vec![task("A"), task("B"), task("C"), task("D")];
    for t in &tasks {
        m.add_task(&p1(), t.clone()).await.unwrap();
    }
    let (b, c, d) = (&tasks[1].id, &tasks[2].id, &tasks[3].id);
    m.reorder_tasks(&p1(), vec![d.clone(), c.clone(), b.clone()])
        .await
        .unwrap();
    m.reorder_tasks(&p1(), vec![c.clone(), d.clone(), b.clone()])
        .await
        .unwrap();
    assert_eq!(m.get_sync_indicator(&p1()).await.pending_count, 5);

    let result = m.trigger_manual_sync(&p1()).await.unwrap();
    assert_eq!(result.applied, 5);

    let authority = m.service().authority();
    assert_eq!(authority.seen_operations(&p1()).await, 5);
    let server = authority.queue(&p1()).await.unwrap();
    assert_eq!(ids(&server.queued), vec![c.clone(), d.clone(), b.clone()]);
}

// ---------------------------------------------------------------------------
// Offline and reconnect
// ---------------------------------------------------------------------------

#[tokio::test]
async fn offline_changes_sync_automatically_on_reconnect() {
    let config = SyncConfig {
        tick_interval: Duration::from_millis(50),
        ..SyncConfig::default()
    };
    let m = make_manager(config);
    m.start_scheduler();

    m.service().set_online(false);
    m.set_online(false).await;
    let tasks: Vec<Task> = (0..5).map(|i| task(&format!("Offline task {i}"))).collect();
    for t in &tasks {
        m.add_task(&p1(), t.clone()).await.unwrap();
    }

    let indicator = m.get_sync_indicator(&p1()).await;
    assert_eq!(indicator.status, IndicatorStatus::Offline);
    assert_eq!(indicator.pending_count, 5);
    assert!(!indicator.can_manual_sync);
    assert!(m.service().authority().queue(&p1()).await.is_none());

    let err = m.trigger_manual_sync(&p1()).await.unwrap_err();
    assert_eq!(err, SyncError::Network(NetworkError::Offline));
    assert_eq!(m.service().calls(), 0);

    let mut events = m.subscribe(&p1());
    m.service().set_online(true);
    m.set_online(true).await;

    let (applied, server_version) = wait_for_sync(&mut events).await;
    assert_eq!(applied, 5);
    assert_eq!(server_version, 5);

    let server = m.service().authority().queue(&p1()).await.unwrap();
    assert_eq!(server.len(), 5);
    assert_eq!(m.get_sync_indicator(&p1()).await.pending_count, 0);
    m.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn mutations_during_flight_are_kept() {
    let m = make_manager(SyncConfig::default());
    let first = task("First");
    m.add_task(&p1(), first.clone()).await.unwrap();
    m.service().set_latency(Duration::from_millis(200));

    let syncing = Arc::clone(&m);
    let flight = tokio::spawn(async move { syncing.trigger_manual_sync(&p1()).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let second = task("Second");
    m.add_task(&p1(), second.clone()).await.unwrap();

    let result = flight.await.unwrap().unwrap();
    assert_eq!(result.applied, 1);

    let local = m.get_queue_state(&p1()).await;
    assert!(local.contains(&first.id));
    assert!(local.contains(&second.id));
    assert_eq!(m.get_sync_indicator(&p1()).await.pending_count, 1);
    let server = m.service().authority().queue(&p1()).await.unwrap();
    assert!(!server.contains(&second.id));

    m.trigger_manual_sync(&p1()).await.unwrap();
    let server = m.service().authority().queue(&p1()).await.unwrap();
    assert!(server.contains(&second.id));
    assert_eq!(
        m.get_queue_state(&p1()).await.checksum,
        server.checksum
    );
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[tokio::test]
async fn store_failures_do_not_block_queue_or_sync() {
    let m = make_manager(SyncConfig::default());
    m.store().set_failing(true);

    let t = task("Cook shrimp");
    m.add_task(&p1(), t.clone()).await.unwrap();
    assert!(m.get_queue_state(&p1()).await.contains(&t.id));
    m.trigger_manual_sync(&p1()).await.unwrap();
    assert_eq!(m.store().save_count(), 0);

    m.store().set_failing(false);
    m.add_task(&p1(), task("Cook lobster")).await.unwrap();
    assert_eq!(m.store().save_count(), 1);
}

#[tokio::test]
async fn file_store_recovers_from_corruption_and_persists() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStore::new(dir.path());
    std::fs::write(store.path_for(&p1()), b"not a queue").unwrap();

    let authority = Arc::new(Authority::new());
    let m = OfflineQueueManager::new(
        LoopbackService::new(Arc::clone(&authority)),
        store,
        SyncConfig::default(),
    );
    assert!(m.get_queue_state(&p1()).await.is_empty());

    let t = task("Craft runes");
    m.add_task(&p1(), t.clone()).await.unwrap();
    m.shutdown().await;

    let reopened = OfflineQueueManager::new(
        LoopbackService::new(authority),
        FileStore::new(dir.path()),
        SyncConfig::default(),
    );
    let queue = reopened.get_queue_state(&p1()).await;
    assert!(queue.contains(&t.id));
    assert_eq!(reopened.get_sync_indicator(&p1()).await.pending_count, 1);

    let result = reopened.trigger_manual_sync(&p1()).await.unwrap();
    assert_eq!(result.applied, 1);
}
