//! Admin plane: tenant config/rules documents with optimistic concurrency,
//! targeted cache invalidation, merchandising rule CRUD with dry-run, and
//! manual overrides. Every write lands in the admin audit log.

#![warn(clippy::unwrap_used)]

pub mod admin;
pub mod overrides;
pub mod rules_admin;

pub use admin::{AdminService, AuditLog, CacheInvalidateRequest, CacheInvalidateResult};
pub use overrides::{CreateOverrideRequest, ManualOverrideService};
pub use rules_admin::{DryRunRequest, DryRunResponse, RuleAdminService, RuleInput, RuleListQuery};
