//! Shared protocol definitions for the Questline task-queue sync format.
//!
//! Both the client engine and the authority depend on this crate, so the
//! replay rules in [`queue::TaskQueue::apply`] are the single source of
//! truth for how an operation changes a queue.

pub mod codec;
pub mod operation;
pub mod queue;
pub mod sync;
pub mod task;
