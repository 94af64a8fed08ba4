//! Manual boosts and suppressions. Each override is backed by an ITEM rule
//! so the serving path only ever evaluates rules.

use crate::admin::record_audit;
use chrono::{DateTime, Utc};
use recsys_core::types::{
    Actor, AdminAuditEvent, ManualOverride, OverrideAction, OverrideStatus, Rule, RuleAction,
    RuleTarget,
};
use recsys_core::{RecsysError, RecsysResult, RequestCtx, Store};
use recsys_rules::RulesManager;
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

pub const DEFAULT_OVERRIDE_PRIORITY: i32 = 1000;
pub const DEFAULT_OVERRIDE_BOOST: f64 = 1.0;

#[derive(Debug, Clone, Deserialize)]
pub struct CreateOverrideRequest {
    #[serde(default)]
    pub namespace: Option<String>,
    pub surface: String,
    pub item_id: String,
    pub action: OverrideAction,
    #[serde(default)]
    pub boost_value: Option<f64>,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

pub struct ManualOverrideService {
    store: Arc<dyn Store>,
    rules: Arc<RulesManager>,
    namespace: String,
}

impl ManualOverrideService {
    pub fn new(store: Arc<dyn Store>, rules: Arc<RulesManager>, namespace: impl Into<String>) -> Self {
        Self {
            store,
            rules,
            namespace: namespace.into(),
        }
    }

    pub async fn create(
        &self,
        ctx: &RequestCtx,
        tenant: Uuid,
        req: CreateOverrideRequest,
        actor: &Actor,
        now: DateTime<Utc>,
    ) -> RecsysResult<ManualOverride> {
        ctx.run(self.store.resolve_tenant(tenant)).await?;
        let namespace = req
            .namespace
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(&self.namespace)
            .to_string();
        let surface = req.surface.trim().to_lowercase();
        let item_id = req.item_id.trim().to_string();
        if surface.is_empty() {
            return Err(RecsysError::invalid("surface is required"));
        }
        if item_id.is_empty() {
            return Err(RecsysError::invalid("item_id is required"));
        }
        if req.expires_at.is_some_and(|at| at <= now) {
            return Err(RecsysError::unprocessable("expires_at must be in the future"));
        }

        let (rule_action, boost_value) = match req.action {
            OverrideAction::Boost => {
                let value = req.boost_value.unwrap_or(DEFAULT_OVERRIDE_BOOST);
                if !(value.is_finite() && value > 0.0) {
                    return Err(RecsysError::unprocessable("boost_value must be positive"));
                }
                (RuleAction::Boost, Some(value))
            }
            OverrideAction::Suppress => (RuleAction::Block, None),
        };
        let priority = req.priority.unwrap_or(DEFAULT_OVERRIDE_PRIORITY);
        let created_by = Some(actor.subject.clone()).filter(|s| !s.is_empty());

        let rule = Rule {
            rule_id: Uuid::new_v4(),
            tenant_id: tenant,
            namespace: namespace.clone(),
            surface: surface.clone(),
            name: format!("manual_{}_{}", action_label(req.action), item_id),
            description: req.notes.clone().unwrap_or_default(),
            action: rule_action,
            target_type: RuleTarget::Item,
            target_key: None,
            item_ids: vec![item_id.clone()],
            boost_value,
            max_pins: None,
            segment_id: None,
            priority,
            enabled: true,
            valid_from: Some(now),
            valid_until: req.expires_at,
            created_at: now,
            updated_at: now,
        };
        rule.validate()?;
        let rule = ctx.run(self.store.create_rule(rule)).await?;

        let ov = ManualOverride {
            override_id: Uuid::new_v4(),
            tenant_id: tenant,
            namespace: namespace.clone(),
            surface: surface.clone(),
            item_id,
            action: req.action,
            boost_value,
            priority,
            notes: req.notes,
            created_by,
            created_at: now,
            expires_at: req.expires_at,
            status: OverrideStatus::Active,
            rule_id: Some(rule.rule_id),
            cancelled_at: None,
        };
        let ov = ctx.run(self.store.create_override(ov)).await?;
        self.rules.invalidate(tenant, &namespace, &surface);
        self.audit(ctx, tenant, actor, "manual_override.create", &ov, None, now)
            .await?;
        info!(%tenant, override_id = %ov.override_id, item = %ov.item_id, action = action_label(ov.action), "Manual override created");
        Ok(ov)
    }

    pub async fn list(
        &self,
        ctx: &RequestCtx,
        tenant: Uuid,
        namespace: Option<&str>,
        status: Option<OverrideStatus>,
    ) -> RecsysResult<Vec<ManualOverride>> {
        ctx.run(self.store.resolve_tenant(tenant)).await?;
        let ns = namespace.unwrap_or(&self.namespace);
        ctx.run(self.store.list_overrides(tenant, ns, status)).await
    }

    /// Cancel an override and disable its backing rule. Cancelling twice
    /// returns the already-cancelled row.
    pub async fn cancel(
        &self,
        ctx: &RequestCtx,
        tenant: Uuid,
        override_id: Uuid,
        actor: &Actor,
        now: DateTime<Utc>,
    ) -> RecsysResult<ManualOverride> {
        let before = ctx
            .run(self.store.get_override(tenant, override_id))
            .await?
            .ok_or_else(|| RecsysError::not_found(format!("override {override_id} not found")))?;
        if before.status == OverrideStatus::Cancelled {
            return Ok(before);
        }
        let after = ctx
            .run(self.store.cancel_override(tenant, override_id, now))
            .await?;

        if let Some(rule_id) = after.rule_id {
            if let Some(mut rule) = ctx.run(self.store.get_rule(tenant, rule_id)).await? {
                rule.enabled = false;
                rule.updated_at = now;
                ctx.run(self.store.update_rule(rule)).await?;
            }
        }
        self.rules.invalidate(tenant, &after.namespace, &after.surface);
        self.audit(ctx, tenant, actor, "manual_override.cancel", &after, Some(&before), now)
            .await?;
        info!(%tenant, %override_id, "Manual override cancelled");
        Ok(after)
    }

    #[allow(clippy::too_many_arguments)]
    async fn audit(
        &self,
        ctx: &RequestCtx,
        tenant: Uuid,
        actor: &Actor,
        action: &str,
        after: &ManualOverride,
        before: Option<&ManualOverride>,
        now: DateTime<Utc>,
    ) -> RecsysResult<()> {
        record_audit(
            self.store.as_ref(),
            ctx,
            AdminAuditEvent {
                id: Uuid::new_v4(),
                tenant_id: tenant,
                actor: actor.clone(),
                action: action.to_string(),
                entity_type: "manual_override".to_string(),
                entity_id: after.override_id.to_string(),
                before: before.map(serde_json::to_value).transpose()?,
                after: Some(serde_json::to_value(after)?),
                request_id: ctx.request_id.clone(),
                occurred_at: now,
            },
        )
        .await
    }
}

fn action_label(action: OverrideAction) -> &'static str {
    match action {
        OverrideAction::Boost => "boost",
        OverrideAction::Suppress => "suppress",
    }
}
