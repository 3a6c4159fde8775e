//! `Questline` demo: one player session against an in-process authority.
//!
//! Queues tasks while offline, lets the server advance the running task,
//! reconnects, and waits for the scheduler to reconcile both sides.
//!
//! ```bash
//! cargo run --bin questline -- --player hero --tasks 5 --strategy merge
//!
//! # Keep state out of the data directory
//! cargo run --bin questline -- --ephemeral --log-level debug
//! ```

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing_appender::non_blocking::WorkerGuard;

use questline::config::{CliArgs, ClientConfig};
use questline::events::QueueEvent;
use questline::queue::QueueError;
use questline::remote::loopback::LoopbackService;
use questline::store::file::FileStore;
use questline::store::{InMemoryStore, QueueStore};
use questline::sync::{ManualChoice, ResolutionStrategy, SyncError};
use questline::OfflineQueueManager;
use questline_authority::{Authority, AuthorityError};
use questline_proto::queue::TaskQueue;
use questline_proto::task::{PlayerId, Reward, Task, TaskPatch, TaskType};

#[derive(Debug, thiserror::Error)]
enum DemoError {
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Authority(#[from] AuthorityError),
    #[error("scheduler did not sync within {0:?}")]
    NoSync(std::time::Duration),
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = CliArgs::parse();

    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Warning: failed to load config file: {e}");
            ClientConfig::default()
        }
    };

    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());
    tracing::info!(player = %config.player, strategy = %config.sync.strategy, "questline demo starting");

    let result = if cli.ephemeral {
        run(&config, InMemoryStore::new()).await
    } else {
        run(&config, FileStore::new(&config.data_dir)).await
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initialize logging.
///
/// Logs go to `file_path` when given, stderr otherwise, through a
/// non-blocking writer. The returned [`WorkerGuard`] must be held until
/// shutdown so buffered entries are flushed.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let (writer, guard) = match file_path {
        Some(path) => {
            let log_dir = path.parent()?;
            let file_name = path.file_name()?.to_str()?;
            tracing_appender::non_blocking(tracing_appender::rolling::never(log_dir, file_name))
        }
        None => tracing_appender::non_blocking(std::io::stderr()),
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(writer)
        .with_env_filter(env_filter)
        .with_ansi(file_path.is_none())
        .init();

    Some(guard)
}

async fn run<St: QueueStore + 'static>(config: &ClientConfig, store: St) -> Result<(), DemoError> {
    let authority = Arc::new(Authority::new());
    let service = LoopbackService::new(Arc::clone(&authority));
    let manager = Arc::new(OfflineQueueManager::new(
        service.clone(),
        store,
        config.sync.clone(),
    ));
    manager.start_scheduler();
    let player = PlayerId::new(config.player.clone());
    let mut events = manager.subscribe(&player);

    // Baseline: one task, synced while online.
    let anchor = Task::new(TaskType::Gathering, "Chop willow logs", 60_000)
        .with_activity("skill", "woodcutting")
        .with_reward(Reward::new("item", "willow_log", 20));
    manager.add_task(&player, anchor.clone()).await?;
    manager.trigger_manual_sync(&player).await?;
    print_state("synced baseline", &manager.get_queue_state(&player).await);

    // Offline: queue work locally while the server keeps simulating.
    service.set_online(false);
    manager.set_online(false).await;
    let kinds = [
        TaskType::Combat,
        TaskType::Crafting,
        TaskType::Quest,
        TaskType::Gathering,
    ];
    for (i, kind) in kinds.iter().cycle().take(config.tasks).enumerate() {
        let task = Task::new(*kind, format!("{kind} task #{}", i + 1), 30_000)
            .with_priority(i32::try_from(i).unwrap_or(i32::MAX));
        manager.add_task(&player, task).await?;
    }
    manager
        .update_task(
            &player,
            &anchor.id,
            &TaskPatch {
                priority: Some(5),
                ..TaskPatch::default()
            },
        )
        .await?;
    authority.tick(&player, 36_000).await?;

    let indicator = manager.get_sync_indicator(&player).await;
    println!("[{}] {}", indicator.status, indicator.message);
    tokio::time::sleep(config.offline).await;

    // Reconnect and let the scheduler pick it up.
    service.set_online(true);
    manager.set_online(true).await;
    let wait = config.sync.sync_timeout * 2;
    let completed = tokio::time::timeout(wait, async {
        while let Some(event) = events.recv().await {
            match event {
                QueueEvent::SyncCompleted { applied, .. } => return Some(applied),
                QueueEvent::SyncFailed { error } => println!("sync failed: {error}"),
                _ => {}
            }
        }
        None
    })
    .await
    .ok()
    .flatten()
    .ok_or(DemoError::NoSync(wait))?;
    println!("scheduler synced {completed} operation(s)");

    if config.sync.strategy == ResolutionStrategy::Manual {
        for conflict in manager.pending_conflicts(&player).await {
            println!("parked {} conflict, settling with merge", conflict.kind);
            manager
                .resolve_conflict(&player, conflict.task_id.as_ref(), ManualChoice::Merge)
                .await?;
        }
        manager.trigger_manual_sync(&player).await?;
    }

    for record in manager.conflict_log(&player).await {
        println!(
            "{} at {}: {} -> {}",
            record.strategy,
            format_time(record.at),
            record.conflict.kind,
            record
                .conflict
                .resolution
                .map_or_else(|| "-".to_string(), |r| r.to_string())
        );
    }
    let indicator = manager.get_sync_indicator(&player).await;
    println!(
        "[{}] {} (last sync {})",
        indicator.status,
        indicator.message,
        indicator.last_sync.map_or_else(|| "never".to_string(), format_time)
    );
    print_state("after reconnect", &manager.get_queue_state(&player).await);

    manager.shutdown().await;
    tracing::info!("questline demo finished");
    Ok(())
}

fn print_state(label: &str, queue: &TaskQueue) {
    println!(
        "{label}: v{} running={} paused={} checksum={}",
        queue.version,
        queue.is_running,
        queue.is_paused,
        &queue.checksum[..queue.checksum.len().min(12)]
    );
    for (i, task) in queue.tasks().enumerate() {
        let marker = if i == 0 && queue.current_task.is_some() { '>' } else { ' ' };
        println!(
            " {marker} {:<24} {:>5.1}%  prio {}",
            task.name,
            task.progress * 100.0,
            task.priority
        );
    }
}

fn format_time(ms: u64) -> String {
    i64::try_from(ms)
        .ok()
        .and_then(chrono::DateTime::from_timestamp_millis)
        .map_or_else(
            || "-".to_string(),
            |t| t.with_timezone(&chrono::Local).format("%H:%M:%S").to_string(),
        )
}
