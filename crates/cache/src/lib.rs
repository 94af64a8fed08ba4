#![warn(clippy::unwrap_used)]

pub mod local;
pub mod tenant;

pub use local::{CacheStats, TtlCache};
pub use tenant::{ArtifactCache, ConfigCache, RulesCache, TenantCache, TenantKey};
