//! Tenant config and rules documents, cache invalidation and the admin
//! audit log.

use chrono::Utc;
use recsys_cache::{ArtifactCache, ConfigCache, RulesCache};
use recsys_core::types::{Actor, AdminAuditEvent, AuditQuery, CacheInvalidationEvent, TenantDocument};
use recsys_core::{RecsysError, RecsysResult, RequestCtx, Store};
use recsys_rules::RulesManager;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

pub const TARGET_CONFIG: &str = "config";
pub const TARGET_RULES: &str = "rules";
pub const TARGET_POPULARITY: &str = "popularity";

pub const DEFAULT_AUDIT_LIMIT: usize = 100;
pub const MAX_AUDIT_LIMIT: usize = 200;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CacheInvalidateRequest {
    #[serde(default)]
    pub targets: Vec<String>,
    #[serde(default)]
    pub surface: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CacheInvalidateResult {
    pub tenant_id: Uuid,
    pub targets: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub surface: Option<String>,
    pub status: String,
    /// Entries dropped per target.
    pub invalidated: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AuditLog {
    pub tenant_id: Uuid,
    pub limit: usize,
    pub offset: usize,
    pub events: Vec<AdminAuditEvent>,
}

#[derive(Clone, Copy)]
enum DocKind {
    Config,
    Rules,
}

impl DocKind {
    fn entity(self) -> &'static str {
        match self {
            DocKind::Config => "tenant_config",
            DocKind::Rules => "tenant_rules",
        }
    }
}

/// Lowercase, trim and dedupe targets, keeping first-seen order.
pub fn normalize_targets(targets: &[String]) -> RecsysResult<Vec<String>> {
    let mut out: Vec<String> = Vec::new();
    for raw in targets {
        let t = raw.trim().to_lowercase();
        if t.is_empty() || out.contains(&t) {
            continue;
        }
        if ![TARGET_CONFIG, TARGET_RULES, TARGET_POPULARITY].contains(&t.as_str()) {
            return Err(RecsysError::unprocessable(format!("unknown cache target {t:?}")));
        }
        out.push(t);
    }
    if out.is_empty() {
        return Err(RecsysError::unprocessable("targets must not be empty"));
    }
    Ok(out)
}

pub struct AdminService {
    store: Arc<dyn Store>,
    config_cache: Arc<ConfigCache>,
    rules_cache: Arc<RulesCache>,
    artifact_cache: Arc<ArtifactCache>,
    rules: Arc<RulesManager>,
    namespace: String,
}

impl AdminService {
    pub fn new(
        store: Arc<dyn Store>,
        config_cache: Arc<ConfigCache>,
        rules_cache: Arc<RulesCache>,
        artifact_cache: Arc<ArtifactCache>,
        rules: Arc<RulesManager>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            store,
            config_cache,
            rules_cache,
            artifact_cache,
            rules,
            namespace: namespace.into(),
        }
    }

    pub async fn get_tenant_config(&self, ctx: &RequestCtx, tenant: Uuid) -> RecsysResult<TenantDocument> {
        ctx.run(self.store.get_tenant_config(tenant)).await
    }

    pub async fn get_tenant_rules(&self, ctx: &RequestCtx, tenant: Uuid) -> RecsysResult<TenantDocument> {
        ctx.run(self.store.get_tenant_rules(tenant)).await
    }

    pub async fn update_tenant_config(
        &self,
        ctx: &RequestCtx,
        tenant: Uuid,
        document: serde_json::Value,
        if_match: Option<&str>,
        actor: &Actor,
    ) -> RecsysResult<TenantDocument> {
        self.update_document(ctx, tenant, DocKind::Config, document, if_match, actor)
            .await
    }

    pub async fn update_tenant_rules(
        &self,
        ctx: &RequestCtx,
        tenant: Uuid,
        document: serde_json::Value,
        if_match: Option<&str>,
        actor: &Actor,
    ) -> RecsysResult<TenantDocument> {
        self.update_document(ctx, tenant, DocKind::Rules, document, if_match, actor)
            .await
    }

    async fn update_document(
        &self,
        ctx: &RequestCtx,
        tenant: Uuid,
        kind: DocKind,
        document: serde_json::Value,
        if_match: Option<&str>,
        actor: &Actor,
    ) -> RecsysResult<TenantDocument> {
        let if_match = if_match.map(str::trim).filter(|v| !v.is_empty()).ok_or_else(|| {
            RecsysError::invalid("If-Match header is required")
        })?;
        if !document.is_object() {
            return Err(RecsysError::invalid("document must be a JSON object"));
        }
        let updated_by = Some(actor.subject.clone()).filter(|s| !s.is_empty());
        let (before, after) = match kind {
            DocKind::Config => {
                let before = ctx.run(self.store.get_tenant_config(tenant)).await?;
                let after = ctx
                    .run(self.store.update_tenant_config(tenant, document, if_match, updated_by))
                    .await?;
                (before, after)
            }
            DocKind::Rules => {
                let before = ctx.run(self.store.get_tenant_rules(tenant)).await?;
                let after = ctx
                    .run(self.store.update_tenant_rules(tenant, document, if_match, updated_by))
                    .await?;
                (before, after)
            }
        };
        match kind {
            DocKind::Config => {
                self.config_cache.invalidate(tenant, "");
            }
            DocKind::Rules => {
                self.rules_cache.invalidate(tenant, "");
                self.rules.invalidate(tenant, &self.namespace, "");
            }
        }

        // Best effort once the write has committed.
        let recorded = self
            .audit(
                ctx,
                tenant,
                actor,
                &format!("{}.update", kind.entity()),
                kind.entity(),
                &after.version,
                serde_json::to_value(&before).ok(),
                serde_json::to_value(&after).ok(),
            )
            .await;
        if let Err(e) = recorded {
            metrics::counter!("recsys.admin.audit_failures").increment(1);
            warn!(%tenant, entity = kind.entity(), version = %after.version, error = %e, "Audit insert failed");
        }
        info!(%tenant, entity = kind.entity(), version = %after.version, "Tenant document updated");
        Ok(after)
    }

    pub async fn invalidate_cache(
        &self,
        ctx: &RequestCtx,
        tenant: Uuid,
        req: &CacheInvalidateRequest,
        actor: &Actor,
    ) -> RecsysResult<CacheInvalidateResult> {
        ctx.run(self.store.resolve_tenant(tenant)).await?;
        let targets = normalize_targets(&req.targets)?;
        let surface = req
            .surface
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        let scope = surface.as_deref().unwrap_or("");

        let mut invalidated = BTreeMap::new();
        for target in &targets {
            let removed = match target.as_str() {
                TARGET_CONFIG => self.config_cache.invalidate(tenant, scope),
                TARGET_RULES => {
                    self.rules_cache.invalidate(tenant, scope)
                        + self.rules.invalidate(tenant, &self.namespace, scope)
                }
                _ => self.artifact_cache.invalidate(tenant, scope),
            };
            metrics::counter!("recsys.admin.invalidations", "target" => target.clone()).increment(1);
            invalidated.insert(target.clone(), removed);
        }

        let status = "applied".to_string();
        ctx.run(self.store.insert_cache_invalidation(CacheInvalidationEvent {
            id: Uuid::new_v4(),
            tenant_id: tenant,
            targets: targets.clone(),
            surface: surface.clone(),
            status: status.clone(),
            request_id: ctx.request_id.clone(),
            actor: actor.clone(),
            created_at: Utc::now(),
        }))
        .await?;
        self.audit(
            ctx,
            tenant,
            actor,
            "cache.invalidate",
            "cache_invalidation",
            "",
            None,
            Some(serde_json::json!({ "targets": targets, "surface": surface, "status": status })),
        )
        .await?;
        info!(%tenant, targets = ?targets, surface = scope, "Caches invalidated");

        Ok(CacheInvalidateResult {
            tenant_id: tenant,
            targets,
            surface,
            status,
            invalidated,
        })
    }

    pub async fn list_audit_log(
        &self,
        ctx: &RequestCtx,
        tenant: Uuid,
        mut query: AuditQuery,
    ) -> RecsysResult<AuditLog> {
        ctx.run(self.store.resolve_tenant(tenant)).await?;
        let limit = match query.limit {
            None | Some(0) => DEFAULT_AUDIT_LIMIT,
            Some(n) => n.min(MAX_AUDIT_LIMIT),
        };
        query.limit = Some(limit);
        let events = ctx.run(self.store.list_audit_log(tenant, &query)).await?;
        Ok(AuditLog {
            tenant_id: tenant,
            limit,
            offset: query.offset.unwrap_or(0),
            events,
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn audit(
        &self,
        ctx: &RequestCtx,
        tenant: Uuid,
        actor: &Actor,
        action: &str,
        entity_type: &str,
        entity_id: &str,
        before: Option<serde_json::Value>,
        after: Option<serde_json::Value>,
    ) -> RecsysResult<()> {
        record_audit(
            self.store.as_ref(),
            ctx,
            AdminAuditEvent {
                id: Uuid::new_v4(),
                tenant_id: tenant,
                actor: actor.clone(),
                action: action.to_string(),
                entity_type: entity_type.to_string(),
                entity_id: entity_id.to_string(),
                before,
                after,
                request_id: ctx.request_id.clone(),
                occurred_at: Utc::now(),
            },
        )
        .await
    }
}

pub(crate) async fn record_audit(
    store: &dyn Store,
    ctx: &RequestCtx,
    event: AdminAuditEvent,
) -> RecsysResult<()> {
    ctx.run(store.insert_audit_event(event)).await
}
