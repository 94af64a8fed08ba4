//! In-memory implementation of every store contract.
//!
//! Data lives in DashMap/parking_lot structures keyed by tenant. Used for
//! development, demos and tests; a database-backed store implements the
//! same traits.

#![warn(clippy::unwrap_used)]

mod admin;
mod bandit;
mod catalog;
mod memory;
mod rules;
mod seed;

pub use memory::{FailPoint, MemoryStore};
