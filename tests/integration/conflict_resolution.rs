//! Integration tests for conflict detection and resolution.
//!
//! The authority stands in for the game server: tests change its queue
//! directly (progress ticks, removals, pauses) while the client edits the
//! same tasks offline, then sync with each strategy.

#![allow(
    clippy::expect_used,
    clippy::unwrap_used,
    clippy::similar_names,
    clippy::redundant_clone,
    clippy::float_cmp
)]

use std::sync::Arc;

use questline::config::SyncConfig;
use questline::remote::loopback::LoopbackService;
use questline::store::InMemoryStore;
use questline::sync::{IndicatorStatus, ManualChoice, ResolutionStrategy, SyncError};
use questline::OfflineQueueManager;
use questline_authority::Authority;
use questline_proto::sync::{ConflictKind, ResolutionTag};
use questline_proto::task::{PlayerId, Task, TaskPatch, TaskType};

// ---------------------------------------------------------------------------
// Helper functions
// ---------------------------------------------------------------------------

type Manager = OfflineQueueManager<LoopbackService, InMemoryStore>;

fn p1() -> PlayerId {
    PlayerId::new("p1")
}

fn make_manager_with(authority: Authority) -> Manager {
    let service = LoopbackService::new(Arc::new(authority));
    OfflineQueueManager::new(service, InMemoryStore::new(), SyncConfig::default())
}

fn make_manager() -> Manager {
    make_manager_with(Authority::new())
}

fn quest(name: &str) -> Task {
    Task::new(TaskType::Quest, name, 120_000)
}

/// Adds `task` and syncs it so both sides start from the same queue.
async fn synced_with(m: &Manager, task: &Task) {
    m.add_task(&p1(), task.clone()).await.unwrap();
    m.trigger_manual_sync(&p1()).await.unwrap();
}

async fn local_task(m: &Manager, task: &Task) -> Task {
    m.get_queue_state(&p1())
        .await
        .find_task(&task.id)
        .cloned()
        .expect("task missing locally")
}

async fn server_task(m: &Manager, task: &Task) -> Option<Task> {
    m.service()
        .authority()
        .queue(&p1())
        .await
        .and_then(|q| q.find_task(&task.id).cloned())
}

// ---------------------------------------------------------------------------
// Modified tasks
// ---------------------------------------------------------------------------

#[tokio::test]
async fn merge_keeps_server_progress_and_client_priority() {
    let m = make_manager();
    let t = quest("Slay the wyrm");
    synced_with(&m, &t).await;

    m.service()
        .authority()
        .advance_progress(&p1(), &t.id, 0.8)
        .await
        .unwrap();
    let patch = TaskPatch {
        priority: Some(2),
        progress: Some(0.5),
        ..TaskPatch::default()
    };
    m.update_task(&p1(), &t.id, &patch).await.unwrap();

    let result = m
        .sync_with_strategy(&p1(), ResolutionStrategy::Merge)
        .await
        .unwrap();
    assert_eq!(result.conflicts_resolved, 1);
    assert_eq!(result.follow_ups, 1);

    let local = local_task(&m, &t).await;
    assert_eq!(local.progress, 0.8);
    assert_eq!(local.priority, 2);

    let log = m.conflict_log(&p1()).await;
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].strategy, ResolutionStrategy::Merge);
    assert_eq!(log[0].conflict.kind, ConflictKind::TaskModified);
    assert_eq!(log[0].conflict.resolution, Some(ResolutionTag::Merged));

    // The merged priority reaches the server on the next round.
    let server = server_task(&m, &t).await.unwrap();
    assert_eq!(server.priority, 0);
    let result = m.trigger_manual_sync(&p1()).await.unwrap();
    assert_eq!(result.conflicts_resolved, 0);
    let server = server_task(&m, &t).await.unwrap();
    assert_eq!(server.priority, 2);
    assert_eq!(server.progress, 0.8);
    assert_eq!(m.get_sync_indicator(&p1()).await.pending_count, 0);
}

#[tokio::test]
async fn merge_takes_the_furthest_progress() {
    let m = make_manager();
    let behind = quest("Behind");
    synced_with(&m, &behind).await;

    m.service()
        .authority()
        .advance_progress(&p1(), &behind.id, 0.6)
        .await
        .unwrap();
    let patch = TaskPatch {
        progress: Some(0.4),
        ..TaskPatch::default()
    };
    m.update_task(&p1(), &behind.id, &patch).await.unwrap();

    let result = m.trigger_manual_sync(&p1()).await.unwrap();
    assert_eq!(result.conflicts_resolved, 1);
    assert_eq!(result.follow_ups, 0);
    assert_eq!(local_task(&m, &behind).await.progress, 0.6);
    assert_eq!(m.get_sync_indicator(&p1()).await.pending_count, 0);

    // Local progress ahead of the server is pushed back.
    m.service()
        .authority()
        .advance_progress(&p1(), &behind.id, 0.7)
        .await
        .unwrap();
    let patch = TaskPatch {
        progress: Some(0.9),
        ..TaskPatch::default()
    };
    m.update_task(&p1(), &behind.id, &patch).await.unwrap();

    let result = m.trigger_manual_sync(&p1()).await.unwrap();
    assert_eq!(result.conflicts_resolved, 1);
    assert_eq!(result.follow_ups, 1);
    m.trigger_manual_sync(&p1()).await.unwrap();
    assert_eq!(server_task(&m, &behind).await.unwrap().progress, 0.9);
}

// ---------------------------------------------------------------------------
// Added tasks
// ---------------------------------------------------------------------------

#[tokio::test]
async fn server_wins_drops_a_rejected_add() {
    let m = make_manager_with(Authority::with_config(10_000, 1));
    let kept = quest("Kept");
    synced_with(&m, &kept).await;

    let extra = quest("Over the limit");
    m.add_task(&p1(), extra.clone()).await.unwrap();
    let result = m
        .sync_with_strategy(&p1(), ResolutionStrategy::ServerWins)
        .await
        .unwrap();
    assert_eq!(result.conflicts_resolved, 1);
    assert_eq!(result.follow_ups, 0);

    let local = m.get_queue_state(&p1()).await;
    assert!(local.contains(&kept.id));
    assert!(!local.contains(&extra.id));
    assert_eq!(m.get_sync_indicator(&p1()).await.pending_count, 0);

    let log = m.conflict_log(&p1()).await;
    assert_eq!(log[0].conflict.kind, ConflictKind::TaskAdded);
    assert_eq!(log[0].conflict.resolution, Some(ResolutionTag::Server));
}

#[tokio::test]
async fn client_wins_keeps_a_rejected_add_for_retry() {
    let m = make_manager_with(Authority::with_config(10_000, 1));
    let kept = quest("Kept");
    synced_with(&m, &kept).await;

    let extra = quest("Over the limit");
    m.add_task(&p1(), extra.clone()).await.unwrap();
    let result = m
        .sync_with_strategy(&p1(), ResolutionStrategy::ClientWins)
        .await
        .unwrap();
    assert_eq!(result.conflicts_resolved, 1);
    assert_eq!(result.follow_ups, 1);

    let local = m.get_queue_state(&p1()).await;
    assert!(local.contains(&extra.id));
    assert_eq!(m.get_sync_indicator(&p1()).await.pending_count, 1);
    assert!(server_task(&m, &extra).await.is_none());

    let log = m.conflict_log(&p1()).await;
    assert_eq!(log[0].conflict.resolution, Some(ResolutionTag::Client));
}

// ---------------------------------------------------------------------------
// Removed tasks
// ---------------------------------------------------------------------------

#[tokio::test]
async fn merge_follows_a_server_removal() {
    let m = make_manager();
    let active = quest("Active");
    let doomed = quest("Doomed");
    m.add_task(&p1(), active.clone()).await.unwrap();
    synced_with(&m, &doomed).await;

    m.service()
        .authority()
        .remove_task(&p1(), &doomed.id)
        .await
        .unwrap();
    let patch = TaskPatch {
        priority: Some(5),
        ..TaskPatch::default()
    };
    m.update_task(&p1(), &doomed.id, &patch).await.unwrap();

    let result = m.trigger_manual_sync(&p1()).await.unwrap();
    assert_eq!(result.conflicts_resolved, 1);
    assert!(!m.get_queue_state(&p1()).await.contains(&doomed.id));

    let log = m.conflict_log(&p1()).await;
    assert_eq!(log[0].conflict.kind, ConflictKind::TaskRemoved);
    assert_eq!(log[0].conflict.resolution, Some(ResolutionTag::Server));
}

#[tokio::test]
async fn client_wins_re_adds_a_removed_task() {
    let m = make_manager();
    let active = quest("Active");
    let revived = quest("Revived");
    m.add_task(&p1(), active.clone()).await.unwrap();
    synced_with(&m, &revived).await;

    m.service()
        .authority()
        .remove_task(&p1(), &revived.id)
        .await
        .unwrap();
    let patch = TaskPatch {
        priority: Some(5),
        ..TaskPatch::default()
    };
    m.update_task(&p1(), &revived.id, &patch).await.unwrap();

    let result = m
        .sync_with_strategy(&p1(), ResolutionStrategy::ClientWins)
        .await
        .unwrap();
    assert_eq!(result.follow_ups, 1);
    assert_eq!(local_task(&m, &revived).await.priority, 5);

    m.trigger_manual_sync(&p1()).await.unwrap();
    let server = server_task(&m, &revived).await.unwrap();
    assert_eq!(server.priority, 5);
}

// ---------------------------------------------------------------------------
// Run state
// ---------------------------------------------------------------------------

#[tokio::test]
async fn run_state_conflict_follows_server_under_merge() {
    let m = make_manager();
    synced_with(&m, &quest("Grind")).await;

    m.service().authority().set_paused(&p1(), true).await.unwrap();
    m.resume_queue(&p1()).await.unwrap();

    let result = m.trigger_manual_sync(&p1()).await.unwrap();
    assert_eq!(result.conflicts_resolved, 1);
    assert_eq!(result.follow_ups, 0);

    let local = m.get_queue_state(&p1()).await;
    assert!(local.is_paused);
    assert!(!local.is_running);

    let log = m.conflict_log(&p1()).await;
    assert_eq!(log[0].conflict.kind, ConflictKind::QueueStateChanged);
    assert!(log[0].conflict.task_id.is_none());
}

#[tokio::test]
async fn run_state_conflict_pushes_client_choice() {
    let m = make_manager();
    synced_with(&m, &quest("Grind")).await;

    m.service().authority().set_paused(&p1(), true).await.unwrap();
    m.resume_queue(&p1()).await.unwrap();

    let result = m
        .sync_with_strategy(&p1(), ResolutionStrategy::ClientWins)
        .await
        .unwrap();
    assert_eq!(result.follow_ups, 1);
    assert!(!m.get_queue_state(&p1()).await.is_paused);

    m.trigger_manual_sync(&p1()).await.unwrap();
    let server = m.service().authority().queue(&p1()).await.unwrap();
    assert!(!server.is_paused);
    assert!(server.is_running);
}

// ---------------------------------------------------------------------------
// Manual resolution
// ---------------------------------------------------------------------------

#[tokio::test]
async fn manual_strategy_parks_until_resolved() {
    let m = make_manager();
    let t = quest("Contested");
    synced_with(&m, &t).await;

    m.service()
        .authority()
        .advance_progress(&p1(), &t.id, 0.8)
        .await
        .unwrap();
    let patch = TaskPatch {
        priority: Some(2),
        progress: Some(0.5),
        ..TaskPatch::default()
    };
    m.update_task(&p1(), &t.id, &patch).await.unwrap();

    let err = m
        .sync_with_strategy(&p1(), ResolutionStrategy::Manual)
        .await
        .unwrap_err();
    assert_eq!(err, SyncError::ConflictUnresolved { count: 1 });

    let parked = m.pending_conflicts(&p1()).await;
    assert_eq!(parked.len(), 1);
    assert_eq!(parked[0].resolution, Some(ResolutionTag::Pending));
    assert_eq!(parked[0].task_id.as_ref(), Some(&t.id));
    assert!(m.conflict_log(&p1()).await.is_empty());

    // The local side stays visible while the conflict is parked.
    let local = local_task(&m, &t).await;
    assert_eq!(local.progress, 0.5);
    assert_eq!(local.priority, 2);
    let indicator = m.get_sync_indicator(&p1()).await;
    assert_eq!(indicator.status, IndicatorStatus::Conflict);

    let follow_ups = m
        .resolve_conflict(&p1(), Some(&t.id), ManualChoice::Merge)
        .await
        .unwrap();
    assert_eq!(follow_ups, 1);
    assert!(m.pending_conflicts(&p1()).await.is_empty());

    let local = local_task(&m, &t).await;
    assert_eq!(local.progress, 0.8);
    assert_eq!(local.priority, 2);

    let log = m.conflict_log(&p1()).await;
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].strategy, ResolutionStrategy::Manual);
    assert_eq!(log[0].conflict.resolution, Some(ResolutionTag::Merged));

    assert_eq!(
        m.resolve_conflict(&p1(), Some(&t.id), ManualChoice::KeepServer)
            .await,
        Err(SyncError::UnknownConflict)
    );

    m.trigger_manual_sync(&p1()).await.unwrap();
    let server = server_task(&m, &t).await.unwrap();
    assert_eq!(server.priority, 2);
    assert_eq!(server.progress, 0.8);
    assert_eq!(
        m.get_sync_indicator(&p1()).await.status,
        IndicatorStatus::Online
    );
}
