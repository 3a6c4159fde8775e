//! Offline-first task queue synchronization for idle games.
//!
//! Local mutations apply immediately and are logged; a scheduler replays
//! the log against the server whenever the device is online, resolving
//! divergences with a configurable strategy.

pub mod config;
pub mod events;
pub mod manager;
pub mod queue;
pub mod remote;
pub mod store;
pub mod sync;

pub use manager::OfflineQueueManager;
