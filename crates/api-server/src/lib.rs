//! HTTP surface of the recommendation plane.

#![warn(clippy::unwrap_used)]

pub mod admin_rest;
pub mod audit_rest;
pub mod bandit_rest;
pub mod error;
pub mod extract;
pub mod rest;
pub mod rules_rest;
pub mod server;
pub mod state;

pub use error::{ApiError, Problem};
pub use extract::parse_tenant;
pub use server::{router, ApiServer};
pub use state::AppState;
