//! Conflict resolution.
//!
//! Pure functions turning server-reported [`Conflict`]s into queue changes.
//! A [`Resolution`] carries two kinds of change:
//! - `untracked`: applied to the local queue only (the server already
//!   agrees, or the conflict is parked for a manual decision);
//! - `follow_ups`: recorded as new operations so the next sync tells the
//!   server about a client-side choice.
//!
//! The engine applies them on top of the server queue, so adopting the
//! server's side usually needs no change at all.

use std::collections::BTreeMap;

use questline_proto::operation::{NewTask, OperationKind};
use questline_proto::queue::TaskQueue;
use questline_proto::sync::{Conflict, ConflictKind, ResolutionTag};
use questline_proto::task::{Reward, Task, TaskPatch};
use serde::{Deserialize, Serialize};

/// How conflicts are settled during a sync.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// The server's value always wins.
    ServerWins,
    /// The local value always wins and is pushed back to the server.
    ClientWins,
    /// Field-level merge of modified tasks; added tasks are kept, removals
    /// and run-state changes follow the server.
    #[default]
    Merge,
    /// Park conflicts until [`ManualChoice`]s are supplied.
    Manual,
}

impl std::fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ServerWins => write!(f, "server_wins"),
            Self::ClientWins => write!(f, "client_wins"),
            Self::Merge => write!(f, "merge"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

/// An out-of-band decision for a parked conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManualChoice {
    /// Adopt the server's side.
    KeepServer,
    /// Keep the local side and push it to the server.
    KeepClient,
    /// Apply the `merge` strategy rule for this conflict.
    Merge,
}

/// Audit entry for one resolved conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionRecord {
    /// When it was resolved (ms since epoch).
    pub at: u64,
    /// Strategy in effect.
    pub strategy: ResolutionStrategy,
    /// The conflict, with its resolution tag set.
    pub conflict: Conflict,
}

/// Queue changes produced by resolving a batch of conflicts.
#[derive(Debug, Default)]
pub struct Resolution {
    /// Applied locally without being recorded.
    pub untracked: Vec<OperationKind>,
    /// Recorded as new operations for the next sync.
    pub follow_ups: Vec<OperationKind>,
    /// Conflicts settled in this batch, tagged.
    pub resolved: Vec<Conflict>,
    /// Conflicts parked for a manual decision, tagged `pending`.
    pub pending: Vec<Conflict>,
}

#[derive(Clone, Copy)]
enum Side {
    Server,
    Client,
    Merged,
}

impl Side {
    const fn tag(self) -> ResolutionTag {
        match self {
            Self::Server => ResolutionTag::Server,
            Self::Client => ResolutionTag::Client,
            Self::Merged => ResolutionTag::Merged,
        }
    }
}

/// Resolves `conflicts` against the pre-sync local queue.
#[must_use]
pub fn resolve(
    local: &TaskQueue,
    conflicts: Vec<Conflict>,
    strategy: ResolutionStrategy,
) -> Resolution {
    let mut resolution = Resolution::default();
    for mut conflict in conflicts {
        let side = match strategy {
            ResolutionStrategy::ServerWins => Side::Server,
            ResolutionStrategy::ClientWins => Side::Client,
            ResolutionStrategy::Merge => merge_rule(conflict.kind),
            ResolutionStrategy::Manual => {
                resolution.untracked.extend(keep_local(local, &conflict));
                conflict.resolution = Some(ResolutionTag::Pending);
                resolution.pending.push(conflict);
                continue;
            }
        };
        apply_side(local, &conflict, side, &mut resolution);
        conflict.resolution = Some(side.tag());
        resolution.resolved.push(conflict);
    }
    resolution
}

/// Resolves one parked conflict with an explicit choice.
#[must_use]
pub fn resolve_manual(local: &TaskQueue, mut conflict: Conflict, choice: ManualChoice) -> Resolution {
    let side = match choice {
        ManualChoice::KeepServer => Side::Server,
        ManualChoice::KeepClient => Side::Client,
        ManualChoice::Merge => merge_rule(conflict.kind),
    };
    let mut resolution = Resolution::default();
    apply_side(local, &conflict, side, &mut resolution);
    conflict.resolution = Some(side.tag());
    resolution.resolved.push(conflict);
    resolution
}

/// Changes that keep the local side of a parked conflict in place.
#[must_use]
pub fn keep_local(local: &TaskQueue, conflict: &Conflict) -> Vec<OperationKind> {
    if conflict.kind == ConflictKind::QueueStateChanged {
        return vec![run_state_op(local.is_paused)];
    }
    let Some(task_id) = &conflict.task_id else {
        return Vec::new();
    };
    match local.find_task(task_id) {
        Some(task) => vec![OperationKind::AddTask { task: task.clone() }],
        None => vec![OperationKind::RemoveTask {
            task_id: task_id.clone(),
        }],
    }
}

const fn merge_rule(kind: ConflictKind) -> Side {
    match kind {
        ConflictKind::TaskModified => Side::Merged,
        ConflictKind::TaskAdded => Side::Client,
        ConflictKind::TaskRemoved | ConflictKind::QueueStateChanged => Side::Server,
    }
}

fn apply_side(local: &TaskQueue, conflict: &Conflict, side: Side, out: &mut Resolution) {
    if conflict.kind == ConflictKind::QueueStateChanged {
        let server = conflict
            .server_value
            .as_ref()
            .and_then(|v| v.as_queue_state());
        match side {
            Side::Client => {
                if server.is_none_or(|s| s.is_paused != local.is_paused) {
                    out.follow_ups.push(run_state_op(local.is_paused));
                }
            }
            Side::Server | Side::Merged => {
                if let Some(server) = server {
                    out.untracked.push(run_state_op(server.is_paused));
                }
            }
        }
        return;
    }

    let server = conflict.server_task();
    let client = conflict
        .task_id
        .as_ref()
        .and_then(|id| local.find_task(id))
        .or_else(|| conflict.client_task());

    match (side, server, client) {
        (Side::Server, Some(server), _) => {
            out.untracked.push(OperationKind::AddTask {
                task: server.clone(),
            });
        }
        (Side::Server, None, _) => {
            if let Some(task_id) = &conflict.task_id {
                out.untracked.push(OperationKind::RemoveTask {
                    task_id: task_id.clone(),
                });
            }
        }
        (Side::Client, Some(server), Some(client)) => {
            let patch = TaskPatch::diff(server, client);
            if !patch.is_empty() {
                out.follow_ups.push(OperationKind::UpdateTask {
                    task_id: server.id.clone(),
                    patch,
                });
            }
        }
        (Side::Client, None, Some(client)) => push_re_add(client, out),
        (Side::Merged, Some(server), Some(client)) => {
            let merged = merge_task(server, client);
            out.untracked.push(OperationKind::AddTask {
                task: server.clone(),
            });
            let patch = TaskPatch::diff(server, &merged);
            if !patch.is_empty() {
                out.follow_ups.push(OperationKind::UpdateTask {
                    task_id: server.id.clone(),
                    patch,
                });
            }
        }
        (Side::Merged, None, Some(client)) => push_re_add(client, out),
        (Side::Merged, Some(server), None) => {
            out.untracked.push(OperationKind::AddTask {
                task: server.clone(),
            });
        }
        (Side::Client | Side::Merged, _, None) => {}
    }
}

/// Re-adds a task the server lacks, carrying over the fields an add
/// does not transmit (progress, start time, completion, rewards).
fn push_re_add(client: &Task, out: &mut Resolution) {
    out.follow_ups.push(OperationKind::AddTask {
        task: client.clone(),
    });
    let baseline = NewTask::from(client).into_task();
    let patch = TaskPatch::diff(&baseline, client);
    if !patch.is_empty() {
        out.follow_ups.push(OperationKind::UpdateTask {
            task_id: client.id.clone(),
            patch,
        });
    }
}

const fn run_state_op(paused: bool) -> OperationKind {
    if paused {
        OperationKind::PauseQueue
    } else {
        OperationKind::ResumeQueue
    }
}

/// Field-level merge of two versions of the same task.
///
/// Progress and start time take the maximum, completion is sticky, the
/// client's priority wins (explicit user intent), rewards are unioned.
/// Everything else comes from the server.
#[must_use]
pub fn merge_task(server: &Task, client: &Task) -> Task {
    let mut merged = server.clone();
    merged.progress = server.progress.max(client.progress);
    merged.priority = client.priority;
    merged.start_time = server.start_time.max(client.start_time);
    merged.completed = server.completed || client.completed;
    merged.rewards = merge_rewards(&server.rewards, &client.rewards);
    merged
}

/// Union of two reward lists keyed by `(reward_type, item_id)`, keeping the
/// larger quantity. Server order first, then rewards only the client has.
#[must_use]
pub fn merge_rewards(server: &[Reward], client: &[Reward]) -> Vec<Reward> {
    let mut order: Vec<(&str, &str)> = Vec::new();
    let mut best: BTreeMap<(&str, &str), &Reward> = BTreeMap::new();
    for reward in server.iter().chain(client) {
        let key = reward.key();
        match best.get(&key) {
            Some(existing) if existing.quantity >= reward.quantity => {}
            Some(_) => {
                best.insert(key, reward);
            }
            None => {
                order.push(key);
                best.insert(key, reward);
            }
        }
    }
    order
        .into_iter()
        .filter_map(|key| best.get(&key).map(|r| (*r).clone()))
        .collect()
}
