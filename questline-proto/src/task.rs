//! Task model for the idle-game queue.
//!
//! A [`Task`] is an immutable value object identified by its [`TaskId`].
//! Updates never mutate a task in place: a [`TaskPatch`] produces a new
//! task that replaces the old one wholesale.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Returns the current timestamp in milliseconds since epoch.
#[must_use]
pub fn now_ms() -> u64 {
    u64::try_from(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis(),
    )
    .unwrap_or(u64::MAX)
}

/// Unique identifier for a task, based on UUID v7 for time-ordering.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Creates a new time-ordered task identifier (UUID v7).
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Creates a `TaskId` from an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the inner UUID value.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies the player who owns a queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PlayerId(String);

impl PlayerId {
    /// Create a player identifier from its string form.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Return the string representation of this player ID.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PlayerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl std::fmt::Display for PlayerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of activity a task represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskType {
    /// Resource gathering (mining, woodcutting, fishing).
    Gathering,
    /// Turning resources into items.
    Crafting,
    /// Fighting monsters.
    Combat,
    /// Multi-step story objective.
    Quest,
    /// Skill training without direct output.
    Training,
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Gathering => write!(f, "gathering"),
            Self::Crafting => write!(f, "crafting"),
            Self::Combat => write!(f, "combat"),
            Self::Quest => write!(f, "quest"),
            Self::Training => write!(f, "training"),
        }
    }
}

/// A reward granted when a task completes.
///
/// Rewards are keyed by `(reward_type, item_id)` when merging.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reward {
    /// Reward category, e.g. `"item"` or `"experience"`.
    pub reward_type: String,
    /// Item or skill identifier within the category.
    pub item_id: String,
    /// Amount granted.
    pub quantity: u32,
}

impl Reward {
    /// Creates a reward.
    pub fn new(reward_type: impl Into<String>, item_id: impl Into<String>, quantity: u32) -> Self {
        Self {
            reward_type: reward_type.into(),
            item_id: item_id.into(),
            quantity,
        }
    }

    /// Returns the merge key of this reward.
    #[must_use]
    pub fn key(&self) -> (&str, &str) {
        (&self.reward_type, &self.item_id)
    }
}

/// A unit of queued work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier.
    pub id: TaskId,
    /// Activity kind.
    pub task_type: TaskType,
    /// Display name.
    pub name: String,
    /// How long the task runs, in milliseconds.
    pub duration_ms: u64,
    /// Free-form activity parameters (target monster, recipe, node...).
    pub activity_data: BTreeMap<String, String>,
    /// Completion fraction in `[0, 1]`.
    pub progress: f64,
    /// Scheduling priority; explicit user intent.
    pub priority: i32,
    /// When the task started running (ms since epoch), 0 if not started.
    pub start_time: u64,
    /// Whether the task has finished.
    pub completed: bool,
    /// Rewards accumulated or promised by this task.
    pub rewards: Vec<Reward>,
}

impl Task {
    /// Creates a fresh, unstarted task with a new id.
    pub fn new(task_type: TaskType, name: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            id: TaskId::new(),
            task_type,
            name: name.into(),
            duration_ms,
            activity_data: BTreeMap::new(),
            progress: 0.0,
            priority: 0,
            start_time: 0,
            completed: false,
            rewards: Vec::new(),
        }
    }

    /// Returns this task with the given priority.
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Returns this task with an extra activity parameter.
    #[must_use]
    pub fn with_activity(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.activity_data.insert(key.into(), value.into());
        self
    }

    /// Returns this task with the given reward appended.
    #[must_use]
    pub fn with_reward(mut self, reward: Reward) -> Self {
        self.rewards.push(reward);
        self
    }

    /// Checks the structural invariants of a task.
    ///
    /// # Errors
    ///
    /// Returns [`TaskValidationError`] if the name is empty, the duration is
    /// zero, or progress lies outside `[0, 1]`.
    pub fn validate(&self) -> Result<(), TaskValidationError> {
        if self.name.trim().is_empty() {
            return Err(TaskValidationError::NameEmpty);
        }
        if self.duration_ms == 0 {
            return Err(TaskValidationError::ZeroDuration);
        }
        check_progress(self.progress)
    }
}

fn check_progress(progress: f64) -> Result<(), TaskValidationError> {
    if (0.0..=1.0).contains(&progress) {
        Ok(())
    } else {
        Err(TaskValidationError::ProgressOutOfRange(progress))
    }
}

/// Reasons a task or patch is malformed.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TaskValidationError {
    /// Task name is empty or whitespace.
    #[error("task name cannot be empty")]
    NameEmpty,
    /// Task duration is zero.
    #[error("task duration must be positive")]
    ZeroDuration,
    /// Progress is not a fraction in `[0, 1]`.
    #[error("progress {0} is outside [0, 1]")]
    ProgressOutOfRange(f64),
    /// A patch changes nothing.
    #[error("update changes no fields")]
    EmptyPatch,
    /// A reorder list names the same task twice.
    #[error("task {0} appears twice in the ordering")]
    DuplicateInOrder(TaskId),
}

/// A partial update to a task. Only `Some` fields are changed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskPatch {
    /// New display name.
    pub name: Option<String>,
    /// New priority.
    pub priority: Option<i32>,
    /// New progress.
    pub progress: Option<f64>,
    /// New start time.
    pub start_time: Option<u64>,
    /// New completion flag.
    pub completed: Option<bool>,
    /// New duration.
    pub duration_ms: Option<u64>,
    /// Replacement reward list.
    pub rewards: Option<Vec<Reward>>,
}

impl TaskPatch {
    /// Returns `true` if the patch changes nothing.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.priority.is_none()
            && self.progress.is_none()
            && self.start_time.is_none()
            && self.completed.is_none()
            && self.duration_ms.is_none()
            && self.rewards.is_none()
    }

    /// Builds the minimal patch that turns `base` into `target`.
    #[must_use]
    pub fn diff(base: &Task, target: &Task) -> Self {
        Self {
            name: (base.name != target.name).then(|| target.name.clone()),
            priority: (base.priority != target.priority).then_some(target.priority),
            progress: (base.progress.to_bits() != target.progress.to_bits())
                .then_some(target.progress),
            start_time: (base.start_time != target.start_time).then_some(target.start_time),
            completed: (base.completed != target.completed).then_some(target.completed),
            duration_ms: (base.duration_ms != target.duration_ms).then_some(target.duration_ms),
            rewards: (base.rewards != target.rewards).then(|| target.rewards.clone()),
        }
    }

    /// Drops every field that already matches `task`.
    #[must_use]
    pub fn changed_against(&self, task: &Task) -> Self {
        Self::diff(task, &self.apply_to(task))
    }

    /// Returns a new task with this patch applied.
    #[must_use]
    pub fn apply_to(&self, task: &Task) -> Task {
        let mut next = task.clone();
        if let Some(name) = &self.name {
            next.name.clone_from(name);
        }
        if let Some(priority) = self.priority {
            next.priority = priority;
        }
        if let Some(progress) = self.progress {
            next.progress = progress;
        }
        if let Some(start_time) = self.start_time {
            next.start_time = start_time;
        }
        if let Some(completed) = self.completed {
            next.completed = completed;
        }
        if let Some(duration_ms) = self.duration_ms {
            next.duration_ms = duration_ms;
        }
        if let Some(rewards) = &self.rewards {
            next.rewards.clone_from(rewards);
        }
        next
    }

    /// Names of the fields this patch changes, in declaration order.
    #[must_use]
    pub fn changed_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.name.is_some() {
            fields.push("name");
        }
        if self.priority.is_some() {
            fields.push("priority");
        }
        if self.progress.is_some() {
            fields.push("progress");
        }
        if self.start_time.is_some() {
            fields.push("start_time");
        }
        if self.completed.is_some() {
            fields.push("completed");
        }
        if self.duration_ms.is_some() {
            fields.push("duration_ms");
        }
        if self.rewards.is_some() {
            fields.push("rewards");
        }
        fields
    }

    /// Checks that the patch changes something and keeps task invariants.
    ///
    /// # Errors
    ///
    /// Returns [`TaskValidationError`] for an empty patch, an empty name,
    /// a zero duration, or out-of-range progress.
    pub fn validate(&self) -> Result<(), TaskValidationError> {
        if self.is_empty() {
            return Err(TaskValidationError::EmptyPatch);
        }
        if self.name.as_deref().is_some_and(|n| n.trim().is_empty()) {
            return Err(TaskValidationError::NameEmpty);
        }
        if self.duration_ms == Some(0) {
            return Err(TaskValidationError::ZeroDuration);
        }
        self.progress.map_or(Ok(()), check_progress)
    }
}
