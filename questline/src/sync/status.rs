//! Per-player sync bookkeeping and its UI projection.
//!
//! [`SyncStatus`] is updated by the manager and the engine; [`project`] is a
//! pure function turning it into the [`SyncIndicator`] a status bar renders.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// One failed sync attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncErrorRecord {
    /// When the attempt failed (ms since epoch).
    pub at: u64,
    /// Human-readable failure.
    pub message: String,
}

/// Sync bookkeeping for one player.
///
/// Connectivity and in-flight flags are runtime-only and reset on load.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    /// Whether the device currently has connectivity.
    #[serde(skip)]
    pub is_online: bool,
    /// When the last attempt started (ms since epoch).
    pub last_sync_attempt: Option<u64>,
    /// When the last attempt succeeded (ms since epoch).
    pub last_successful_sync: Option<u64>,
    /// A round-trip is in flight.
    #[serde(skip)]
    pub sync_in_progress: bool,
    /// Unapplied operations in the log.
    pub pending_operations_count: usize,
    /// Conflicts awaiting a manual decision.
    pub conflicts_detected: usize,
    /// Recent failures, oldest first.
    pub sync_errors: VecDeque<SyncErrorRecord>,
    /// A manual sync was requested and has not finished yet.
    #[serde(skip)]
    pub manual_sync_requested: bool,
    /// Failures since the last success; drives retry backoff.
    pub consecutive_failures: u32,
}

impl SyncStatus {
    /// Records a failed attempt, keeping at most `max_errors` records.
    pub fn record_failure(&mut self, at: u64, message: impl Into<String>, max_errors: usize) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.sync_errors.push_back(SyncErrorRecord {
            at,
            message: message.into(),
        });
        while self.sync_errors.len() > max_errors {
            self.sync_errors.pop_front();
        }
    }

    /// Records a successful attempt, clearing the error history.
    pub fn record_success(&mut self, at: u64) {
        self.last_successful_sync = Some(at);
        self.consecutive_failures = 0;
        self.sync_errors.clear();
    }
}

/// Coarse state shown to the player.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndicatorStatus {
    /// Connected and up to date.
    Online,
    /// No connectivity; changes are kept locally.
    Offline,
    /// A sync is running or changes are waiting to be sent.
    Syncing,
    /// The last attempts failed.
    Error,
    /// Conflicts need a decision.
    Conflict,
}

impl std::fmt::Display for IndicatorStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Online => write!(f, "online"),
            Self::Offline => write!(f, "offline"),
            Self::Syncing => write!(f, "syncing"),
            Self::Error => write!(f, "error"),
            Self::Conflict => write!(f, "conflict"),
        }
    }
}

/// UI-facing summary of a player's sync state.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncIndicator {
    /// Coarse state.
    pub status: IndicatorStatus,
    /// One-line description.
    pub message: String,
    /// `Some(0.0)` while a round-trip is in flight.
    pub progress: Option<f64>,
    /// Last successful sync (ms since epoch).
    pub last_sync: Option<u64>,
    /// Unapplied operations.
    pub pending_count: usize,
    /// Whether a manual sync button should be enabled.
    pub can_manual_sync: bool,
}

/// Derives the indicator from bookkeeping. The first matching rule wins:
/// in flight, offline, errors, conflicts, pending changes, idle.
#[must_use]
pub fn project(status: &SyncStatus, now_ms: u64) -> SyncIndicator {
    let pending = status.pending_operations_count;
    let age = describe_age(status.last_successful_sync, now_ms);

    let (state, message) = if status.sync_in_progress {
        (IndicatorStatus::Syncing, "Syncing...".to_string())
    } else if !status.is_online {
        let message = if pending > 0 {
            format!("Offline, {pending} change(s) saved locally")
        } else {
            "Offline".to_string()
        };
        (IndicatorStatus::Offline, message)
    } else if let Some(last) = status.sync_errors.back() {
        (
            IndicatorStatus::Error,
            format!("Sync failed: {} (retrying)", last.message),
        )
    } else if status.conflicts_detected > 0 {
        (
            IndicatorStatus::Conflict,
            format!("{} conflict(s) need review", status.conflicts_detected),
        )
    } else if pending > 0 {
        (
            IndicatorStatus::Syncing,
            format!("{pending} pending change(s), last synced {age}"),
        )
    } else {
        (IndicatorStatus::Online, format!("Up to date, last synced {age}"))
    };

    SyncIndicator {
        status: state,
        message,
        progress: status.sync_in_progress.then_some(0.0),
        last_sync: status.last_successful_sync,
        pending_count: pending,
        can_manual_sync: !status.sync_in_progress && status.is_online,
    }
}

/// Renders a human age such as `"just now"` or `"5m ago"`.
fn describe_age(last: Option<u64>, now_ms: u64) -> String {
    let Some(last) = last else {
        return "never".to_string();
    };
    let secs = now_ms.saturating_sub(last) / 1000;
    match secs {
        0..=9 => "just now".to_string(),
        10..=59 => format!("{secs}s ago"),
        60..=3599 => format!("{}m ago", secs / 60),
        3600..=86_399 => format!("{}h ago", secs / 3600),
        _ => format!("{}d ago", secs / 86_400),
    }
}
