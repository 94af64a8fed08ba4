//! Persistence contracts consumed by the serving plane.
//!
//! Every trait is async and object safe so services can hold
//! `Arc<dyn Store>`. Callers bound each call with
//! [`RequestCtx::run`](crate::context::RequestCtx::run).

use crate::error::RecsysResult;
use crate::trace::{DecisionTrace, TraceQuery};
use crate::types::{
    AdminAuditEvent, Algorithm, ArmKey, AuditQuery, BanditDecisionLog, BanditRewardLog,
    BanditStats, CacheInvalidationEvent, EventTypeWeight, Item, ItemScore, ManualOverride,
    OverrideStatus, PolicyConfig, ProfileTag, Rule, RuleAction, Segment, SegmentProfile,
    TenantDocument, User,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use uuid::Uuid;

/// Parameters for the decayed popularity query.
#[derive(Debug, Clone)]
pub struct PopQuery {
    pub half_life_days: f64,
    pub limit: usize,
    pub now: DateTime<Utc>,
    pub event_types: HashMap<String, EventTypeWeight>,
}

#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Items ordered by `sum(weight * 2^(-age_days / half_life_days))`
    /// over events, descending.
    async fn list_pop_items(&self, tenant: Uuid, ns: &str, q: &PopQuery)
        -> RecsysResult<Vec<ItemScore>>;

    /// Items co-occurring with `anchor` in user sessions since `since`.
    async fn list_co_vis(
        &self,
        tenant: Uuid,
        ns: &str,
        anchor: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> RecsysResult<Vec<ItemScore>>;

    /// Content neighbours of `anchor`.
    async fn list_similar(
        &self,
        tenant: Uuid,
        ns: &str,
        anchor: &str,
        limit: usize,
    ) -> RecsysResult<Vec<ItemScore>>;

    async fn get_user_profile(
        &self,
        tenant: Uuid,
        ns: &str,
        user: &str,
        since: DateTime<Utc>,
        top_n: usize,
    ) -> RecsysResult<Vec<ProfileTag>>;

    async fn list_items_tags(
        &self,
        tenant: Uuid,
        ns: &str,
        ids: &[String],
    ) -> RecsysResult<HashMap<String, Vec<String>>>;

    async fn get_user(&self, tenant: Uuid, ns: &str, user: &str) -> RecsysResult<Option<User>>;

    async fn list_items(
        &self,
        tenant: Uuid,
        ns: &str,
        limit: usize,
        offset: usize,
    ) -> RecsysResult<Vec<Item>>;

    /// Distinct items the user touched since `since`, most recent first.
    async fn list_user_recent_items(
        &self,
        tenant: Uuid,
        ns: &str,
        user: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> RecsysResult<Vec<String>>;

    async fn list_user_event_items_since(
        &self,
        tenant: Uuid,
        ns: &str,
        user: &str,
        since: DateTime<Utc>,
        event_types: &[String],
    ) -> RecsysResult<Vec<String>>;

    async fn count_user_events(
        &self,
        tenant: Uuid,
        ns: &str,
        user: &str,
        since: DateTime<Utc>,
    ) -> RecsysResult<usize>;
}

#[async_trait]
pub trait SegmentStore: Send + Sync {
    /// Active segments in listed order, each carrying its rules.
    async fn list_active_segments_with_rules(
        &self,
        tenant: Uuid,
        ns: &str,
    ) -> RecsysResult<Vec<Segment>>;

    async fn get_segment_profile(
        &self,
        tenant: Uuid,
        ns: &str,
        profile_id: &str,
    ) -> RecsysResult<Option<SegmentProfile>>;
}

#[derive(Debug, Clone, Default)]
pub struct RuleFilter {
    pub namespace: Option<String>,
    pub surface: Option<String>,
    pub action: Option<RuleAction>,
    pub enabled: Option<bool>,
}

#[async_trait]
pub trait RuleStore: Send + Sync {
    async fn create_rule(&self, rule: Rule) -> RecsysResult<Rule>;
    async fn update_rule(&self, rule: Rule) -> RecsysResult<Rule>;
    async fn get_rule(&self, tenant: Uuid, rule_id: Uuid) -> RecsysResult<Option<Rule>>;
    async fn list_rules(&self, tenant: Uuid, filter: &RuleFilter) -> RecsysResult<Vec<Rule>>;
    /// Enabled rules for (namespace, surface) regardless of validity window.
    async fn list_enabled_rules_for_scope(
        &self,
        tenant: Uuid,
        ns: &str,
        surface: &str,
    ) -> RecsysResult<Vec<Rule>>;
    /// Enabled rules for (namespace, surface) whose window contains `now`.
    async fn list_active_rules_for_scope(
        &self,
        tenant: Uuid,
        ns: &str,
        surface: &str,
        now: DateTime<Utc>,
    ) -> RecsysResult<Vec<Rule>>;
}

#[async_trait]
pub trait OverrideStore: Send + Sync {
    async fn create_override(&self, ov: ManualOverride) -> RecsysResult<ManualOverride>;
    async fn get_override(
        &self,
        tenant: Uuid,
        override_id: Uuid,
    ) -> RecsysResult<Option<ManualOverride>>;
    async fn list_overrides(
        &self,
        tenant: Uuid,
        ns: &str,
        status: Option<OverrideStatus>,
    ) -> RecsysResult<Vec<ManualOverride>>;
    async fn cancel_override(
        &self,
        tenant: Uuid,
        override_id: Uuid,
        at: DateTime<Utc>,
    ) -> RecsysResult<ManualOverride>;
}

#[async_trait]
pub trait BanditStore: Send + Sync {
    async fn upsert_policies(
        &self,
        tenant: Uuid,
        ns: &str,
        policies: &[PolicyConfig],
    ) -> RecsysResult<()>;
    async fn list_all_policies(&self, tenant: Uuid, ns: &str) -> RecsysResult<Vec<PolicyConfig>>;
    async fn list_active_policies(&self, tenant: Uuid, ns: &str)
        -> RecsysResult<Vec<PolicyConfig>>;
    async fn list_policies_by_ids(
        &self,
        tenant: Uuid,
        ns: &str,
        ids: &[String],
    ) -> RecsysResult<Vec<PolicyConfig>>;
    /// Stats keyed by policy id. Missing arms are absent, callers treat
    /// them as `(0, 0)`.
    async fn get_stats(
        &self,
        tenant: Uuid,
        ns: &str,
        surface: &str,
        bucket_key: &str,
        algorithm: Algorithm,
    ) -> RecsysResult<HashMap<String, BanditStats>>;
    /// Atomically add one trial (and one success when `reward`). A repeated
    /// non-empty `request_id` for the same arm is ignored; returns whether
    /// the increment was applied.
    async fn increment_stats(&self, key: &ArmKey, reward: bool, request_id: &str)
        -> RecsysResult<bool>;
    async fn log_decision(&self, row: BanditDecisionLog) -> RecsysResult<()>;
    async fn log_reward(&self, row: BanditRewardLog) -> RecsysResult<()>;
}

#[async_trait]
pub trait AdminStore: Send + Sync {
    /// `TenantNotFound` for unknown tenants.
    async fn resolve_tenant(&self, tenant: Uuid) -> RecsysResult<()>;
    async fn get_tenant_config(&self, tenant: Uuid) -> RecsysResult<TenantDocument>;
    async fn get_tenant_rules(&self, tenant: Uuid) -> RecsysResult<TenantDocument>;
    /// Compare-and-set on `if_match`; bumps the version on success.
    async fn update_tenant_config(
        &self,
        tenant: Uuid,
        document: serde_json::Value,
        if_match: &str,
        updated_by: Option<String>,
    ) -> RecsysResult<TenantDocument>;
    async fn update_tenant_rules(
        &self,
        tenant: Uuid,
        document: serde_json::Value,
        if_match: &str,
        updated_by: Option<String>,
    ) -> RecsysResult<TenantDocument>;
    async fn insert_cache_invalidation(&self, event: CacheInvalidationEvent) -> RecsysResult<()>;
    async fn insert_audit_event(&self, event: AdminAuditEvent) -> RecsysResult<()>;
    async fn list_audit_log(
        &self,
        tenant: Uuid,
        query: &AuditQuery,
    ) -> RecsysResult<Vec<AdminAuditEvent>>;
}

#[async_trait]
pub trait TraceStore: Send + Sync {
    async fn insert_decision_traces(&self, traces: &[DecisionTrace]) -> RecsysResult<()>;
    async fn get_decision_trace(
        &self,
        tenant: Uuid,
        decision_id: Uuid,
    ) -> RecsysResult<Option<DecisionTrace>>;
    async fn list_decision_traces(
        &self,
        tenant: Uuid,
        query: &TraceQuery,
    ) -> RecsysResult<Vec<DecisionTrace>>;
}

#[async_trait]
pub trait EventTypeProvider: Send + Sync {
    /// Tenant rows overlaid on [`default_event_types`](crate::types::default_event_types).
    async fn event_types(&self, tenant: Uuid) -> RecsysResult<HashMap<String, EventTypeWeight>>;
}

/// Everything the serving plane needs from persistence.
pub trait Store:
    CatalogStore
    + SegmentStore
    + RuleStore
    + OverrideStore
    + BanditStore
    + AdminStore
    + TraceStore
    + EventTypeProvider
{
}

impl<T> Store for T where
    T: CatalogStore
        + SegmentStore
        + RuleStore
        + OverrideStore
        + BanditStore
        + AdminStore
        + TraceStore
        + EventTypeProvider
{
}
