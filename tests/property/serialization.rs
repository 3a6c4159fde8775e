//! Property-based tests for the wire protocol and queue model.
//!
//! Uses proptest to verify:
//! 1. Random bytes never cause a panic in any decoder (returns `Err` gracefully).
//! 2. Any sync packet survives encode → decode.
//! 3. The queue checksum ignores version and sync timestamps.
//! 4. Replaying minimized operations yields the same queue structure as
//!    applying the full local operations.
//! 5. Reordering never gains or loses tasks.

#![allow(clippy::unwrap_used, clippy::cast_possible_truncation)]

use proptest::prelude::*;
use questline_proto::codec;
use questline_proto::operation::{Operation, OperationId, OperationKind};
use questline_proto::queue::TaskQueue;
use questline_proto::sync::{self, SyncPacket};
use questline_proto::task::{PlayerId, Task, TaskId, TaskPatch, TaskType};
use uuid::Uuid;

// --- Strategies ---

fn arb_task_type() -> impl Strategy<Value = TaskType> {
    prop_oneof![
        Just(TaskType::Gathering),
        Just(TaskType::Crafting),
        Just(TaskType::Combat),
        Just(TaskType::Quest),
        Just(TaskType::Training),
    ]
}

/// Fresh, valid tasks as a player would create them.
fn arb_task() -> impl Strategy<Value = Task> {
    (
        arb_task_type(),
        "[a-zA-Z][a-zA-Z ]{0,31}",
        1_u64..86_400_000,
        -10_i32..10,
    )
        .prop_map(|(kind, name, duration, priority)| {
            Task::new(kind, name, duration).with_priority(priority)
        })
}

fn arb_patch() -> impl Strategy<Value = TaskPatch> {
    (
        prop::option::of(-10_i32..10),
        prop::option::of(0.0_f64..=1.0),
        prop::option::of(any::<bool>()),
    )
        .prop_map(|(priority, progress, completed)| TaskPatch {
            priority,
            progress,
            completed,
            ..TaskPatch::default()
        })
        .prop_filter("patch must change something", |p| !p.is_empty())
}

/// A sequence of valid local operations over a growing set of tasks.
fn arb_operations() -> impl Strategy<Value = Vec<OperationKind>> {
    (
        prop::collection::vec(arb_task(), 1..8),
        prop::collection::vec((0_u8..6, any::<prop::sample::Index>(), arb_patch()), 0..16),
    )
        .prop_map(|(tasks, steps)| {
            let mut ops: Vec<OperationKind> = tasks
                .iter()
                .map(|task| OperationKind::AddTask { task: task.clone() })
                .collect();
            for (choice, index, patch) in steps {
                let target = tasks[index.index(tasks.len())].id.clone();
                ops.push(match choice {
                    0 => OperationKind::RemoveTask { task_id: target },
                    1 => OperationKind::PauseQueue,
                    2 => OperationKind::ResumeQueue,
                    3 => OperationKind::UpdateTask {
                        task_id: target,
                        patch,
                    },
                    4 => {
                        let mut order: Vec<TaskId> = tasks.iter().map(|t| t.id.clone()).collect();
                        let len = order.len();
                        order.rotate_left(index.index(len));
                        OperationKind::ReorderTasks { order }
                    }
                    _ => OperationKind::ClearQueue,
                });
            }
            ops
        })
}

fn build_queue(ops: &[OperationKind]) -> TaskQueue {
    let mut queue = TaskQueue::new(PlayerId::new("prop"));
    for (i, op) in ops.iter().enumerate() {
        queue.apply(op, i as u64);
        queue.touch();
    }
    queue
}

// --- Property tests ---

proptest! {
    #[test]
    fn random_bytes_never_panic_in_decoders(bytes in prop::collection::vec(any::<u8>(), 0..2048)) {
        let _ = sync::decode_packet(&bytes);
        let _ = sync::decode_response(&bytes);
        let _ = codec::decode::<TaskQueue>(&bytes);
        let _ = codec::decode_framed::<TaskQueue>(&bytes);
    }

    #[test]
    fn packet_round_trip(
        ops in arb_operations(),
        player in "[a-z0-9_-]{1,24}",
        from_version in any::<u64>(),
        timestamp in any::<u64>(),
        id_seed in any::<u128>(),
    ) {
        let operations = ops
            .into_iter()
            .enumerate()
            .map(|(i, kind)| {
                let mut op = Operation::new(kind, timestamp, i as u64);
                op.id = OperationId::from_uuid(Uuid::from_u128(id_seed.wrapping_add(i as u128)));
                op.minimize()
            })
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        let packet = SyncPacket {
            player_id: PlayerId::new(player),
            from_version,
            to_version: from_version.saturating_add(operations.len() as u64),
            operations,
            checksum: "abc".to_string(),
            timestamp,
        };
        let bytes = sync::encode_packet(&packet).unwrap();
        prop_assert_eq!(sync::decode_packet(&bytes).unwrap(), packet);
    }

    #[test]
    fn checksum_ignores_version_and_sync_time(
        ops in arb_operations(),
        version in any::<u64>(),
        synced in prop::option::of(any::<u64>()),
    ) {
        let queue = build_queue(&ops);
        let mut other = queue.clone();
        other.version = version;
        other.last_synced = synced;
        prop_assert_eq!(other.compute_checksum(), queue.compute_checksum());
        prop_assert_eq!(&queue.checksum, &queue.compute_checksum());
    }

    #[test]
    fn minimized_replay_matches_local_structure(ops in arb_operations()) {
        let local = build_queue(&ops);
        let wire_kinds: Vec<OperationKind> = ops
            .iter()
            .map(|kind| Operation::new(kind.clone(), 0, 0).minimize().unwrap().to_kind())
            .collect();
        let remote = build_queue(&wire_kinds);
        prop_assert_eq!(remote.compute_checksum(), local.compute_checksum());
        prop_assert_eq!(remote.len(), local.len());
    }

    #[test]
    fn reorder_preserves_tasks(tasks in prop::collection::vec(arb_task(), 1..10), shift in 0_usize..10) {
        let adds: Vec<OperationKind> = tasks
            .iter()
            .map(|task| OperationKind::AddTask { task: task.clone() })
            .collect();
        let mut queue = build_queue(&adds);
        let before = queue.len();
        let mut order: Vec<TaskId> = queue.queued.iter().map(|t| t.id.clone()).collect();
        if !order.is_empty() {
            let len = order.len();
            order.rotate_left(shift % len);
        }
        queue.apply(&OperationKind::ReorderTasks { order: order.clone() }, 0);
        prop_assert_eq!(queue.len(), before);
        let after: Vec<TaskId> = queue.queued.iter().map(|t| t.id.clone()).collect();
        prop_assert_eq!(after, order);
    }
}
