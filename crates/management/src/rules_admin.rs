//! Merchandising rule CRUD and dry-run previews.

use crate::admin::record_audit;
use chrono::{DateTime, Utc};
use recsys_core::store::RuleFilter;
use recsys_core::types::{Actor, AdminAuditEvent, ItemScore, Rule, RuleAction, RuleTarget};
use recsys_core::{ConfigCell, RecsysError, RecsysResult, RequestCtx, Store};
use recsys_rules::{EvaluateRequest, EvaluateResult, RuleEvaluator, RulesManager};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Writable rule fields. Identity and timestamps are owned by the service.
#[derive(Debug, Clone, Deserialize)]
pub struct RuleInput {
    #[serde(default)]
    pub namespace: Option<String>,
    pub surface: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub action: RuleAction,
    pub target_type: RuleTarget,
    #[serde(default)]
    pub target_key: Option<String>,
    #[serde(default)]
    pub item_ids: Vec<String>,
    #[serde(default)]
    pub boost_value: Option<f64>,
    #[serde(default)]
    pub max_pins: Option<usize>,
    #[serde(default)]
    pub segment_id: Option<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "enabled_default")]
    pub enabled: bool,
    #[serde(default)]
    pub valid_from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub valid_until: Option<DateTime<Utc>>,
}

fn enabled_default() -> bool {
    true
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuleListQuery {
    pub namespace: Option<String>,
    pub surface: Option<String>,
    pub action: Option<RuleAction>,
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DryRunRequest {
    #[serde(default)]
    pub namespace: Option<String>,
    pub surface: String,
    #[serde(default)]
    pub segment_id: Option<String>,
    pub candidates: Vec<ItemScore>,
    #[serde(default)]
    pub item_tags: HashMap<String, Vec<String>>,
    /// Evaluation instant; defaults to now.
    #[serde(default)]
    pub at: Option<DateTime<Utc>>,
    /// Unsaved rules evaluated alongside the stored ones.
    #[serde(default)]
    pub rules: Vec<RuleInput>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DryRunResponse {
    pub tenant_id: Uuid,
    pub namespace: String,
    pub surface: String,
    pub evaluated_at: DateTime<Utc>,
    pub rule_count: usize,
    pub result: EvaluateResult,
}

pub struct RuleAdminService {
    store: Arc<dyn Store>,
    rules: Arc<RulesManager>,
    config: Arc<ConfigCell>,
    namespace: String,
}

impl RuleAdminService {
    pub fn new(
        store: Arc<dyn Store>,
        rules: Arc<RulesManager>,
        config: Arc<ConfigCell>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            store,
            rules,
            config,
            namespace: namespace.into(),
        }
    }

    fn build(&self, tenant: Uuid, rule_id: Uuid, input: RuleInput, created_at: DateTime<Utc>, now: DateTime<Utc>) -> Rule {
        let namespace = input
            .namespace
            .map(|ns| ns.trim().to_string())
            .filter(|ns| !ns.is_empty())
            .unwrap_or_else(|| self.namespace.clone());
        Rule {
            rule_id,
            tenant_id: tenant,
            namespace,
            surface: input.surface.trim().to_lowercase(),
            name: input.name.trim().to_string(),
            description: input.description,
            action: input.action,
            target_type: input.target_type,
            target_key: input
                .target_key
                .map(|k| k.trim().to_lowercase())
                .filter(|k| !k.is_empty()),
            item_ids: input
                .item_ids
                .into_iter()
                .map(|id| id.trim().to_string())
                .filter(|id| !id.is_empty())
                .collect(),
            boost_value: input.boost_value,
            max_pins: input.max_pins,
            segment_id: input
                .segment_id
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
            priority: input.priority,
            enabled: input.enabled,
            valid_from: input.valid_from,
            valid_until: input.valid_until,
            created_at,
            updated_at: now,
        }
    }

    pub async fn create(
        &self,
        ctx: &RequestCtx,
        tenant: Uuid,
        input: RuleInput,
        actor: &Actor,
        now: DateTime<Utc>,
    ) -> RecsysResult<Rule> {
        ctx.run(self.store.resolve_tenant(tenant)).await?;
        let rule = self.build(tenant, Uuid::new_v4(), input, now, now);
        rule.validate()?;
        let rule = ctx.run(self.store.create_rule(rule)).await?;
        self.rules.invalidate(tenant, &rule.namespace, &rule.surface);
        self.audit(ctx, tenant, actor, "rule.create", &rule, None, now).await?;
        info!(%tenant, rule_id = %rule.rule_id, action = ?rule.action, surface = %rule.surface, "Rule created");
        Ok(rule)
    }

    pub async fn get(&self, ctx: &RequestCtx, tenant: Uuid, rule_id: Uuid) -> RecsysResult<Rule> {
        ctx.run(self.store.get_rule(tenant, rule_id))
            .await?
            .ok_or_else(|| RecsysError::not_found(format!("rule {rule_id} not found")))
    }

    pub async fn list(&self, ctx: &RequestCtx, tenant: Uuid, query: RuleListQuery) -> RecsysResult<Vec<Rule>> {
        ctx.run(self.store.resolve_tenant(tenant)).await?;
        let filter = RuleFilter {
            namespace: Some(query.namespace.unwrap_or_else(|| self.namespace.clone())),
            surface: query.surface.map(|s| s.trim().to_lowercase()),
            action: query.action,
            enabled: query.enabled,
        };
        ctx.run(self.store.list_rules(tenant, &filter)).await
    }

    /// Replace a rule's writable fields. Both the old and the new scope are
    /// invalidated so a surface move takes effect immediately.
    pub async fn update(
        &self,
        ctx: &RequestCtx,
        tenant: Uuid,
        rule_id: Uuid,
        input: RuleInput,
        actor: &Actor,
        now: DateTime<Utc>,
    ) -> RecsysResult<Rule> {
        let before = self.get(ctx, tenant, rule_id).await?;
        let rule = self.build(tenant, rule_id, input, before.created_at, now);
        rule.validate()?;
        let rule = ctx.run(self.store.update_rule(rule)).await?;
        self.rules.invalidate(tenant, &before.namespace, &before.surface);
        self.rules.invalidate(tenant, &rule.namespace, &rule.surface);
        self.audit(ctx, tenant, actor, "rule.update", &rule, Some(&before), now)
            .await?;
        info!(%tenant, %rule_id, "Rule updated");
        Ok(rule)
    }

    /// Evaluate the scope's stored rules, plus any unsaved ones, over the
    /// caller's candidates. Nothing is persisted.
    pub async fn dry_run(
        &self,
        ctx: &RequestCtx,
        tenant: Uuid,
        req: DryRunRequest,
    ) -> RecsysResult<DryRunResponse> {
        ctx.run(self.store.resolve_tenant(tenant)).await?;
        let now = req.at.unwrap_or_else(Utc::now);
        let namespace = req
            .namespace
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(&self.namespace)
            .to_string();
        let surface = req.surface.trim().to_lowercase();
        if surface.is_empty() {
            return Err(RecsysError::invalid("surface is required"));
        }

        let mut rules = ctx
            .run(self.store.list_active_rules_for_scope(tenant, &namespace, &surface, now))
            .await?;
        for input in req.rules {
            let mut draft = self.build(tenant, Uuid::new_v4(), input, now, now);
            draft.namespace = namespace.clone();
            draft.surface = surface.clone();
            draft.validate()?;
            rules.push(draft);
        }

        let item_tags: HashMap<String, Vec<String>> = req
            .item_tags
            .into_iter()
            .map(|(id, tags)| (id, tags.iter().map(|t| t.trim().to_lowercase()).collect()))
            .collect();
        let snapshot = self.config.load();
        let evaluator = RuleEvaluator::new(
            self.rules.max_pin_slots(),
            &snapshot.config.brand_tag_prefixes,
            &snapshot.config.category_tag_prefixes,
        );
        let segment = req.segment_id.unwrap_or_default();
        let result = evaluator.apply(
            &rules,
            &EvaluateRequest {
                segment_id: segment.trim(),
                now,
                candidates: &req.candidates,
                item_tags: &item_tags,
            },
        );
        Ok(DryRunResponse {
            tenant_id: tenant,
            namespace,
            surface,
            evaluated_at: now,
            rule_count: rules.len(),
            result,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn audit(
        &self,
        ctx: &RequestCtx,
        tenant: Uuid,
        actor: &Actor,
        action: &str,
        after: &Rule,
        before: Option<&Rule>,
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
                entity_type: "rule".to_string(),
                entity_id: after.rule_id.to_string(),
                before: before.map(serde_json::to_value).transpose()?,
                after: Some(serde_json::to_value(after)?),
                request_id: ctx.request_id.clone(),
                occurred_at: now,
            },
        )
        .await
    }
}
