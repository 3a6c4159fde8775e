//! Questline authority library.
//!
//! The server side of the sync protocol: an in-process reconciler that
//! owns each player's authoritative queue, deduplicates operations by id,
//! and reports conflicts back to the client.

pub mod authority;
pub mod ledger;

pub use authority::{Authority, AuthorityError};
