//! Cached access to active rules per (tenant, namespace, surface).

use crate::evaluate::{EvaluateRequest, EvaluateResult, RuleEvaluator};
use recsys_cache::TtlCache;
use recsys_core::store::RuleStore;
use recsys_core::types::Rule;
use recsys_core::{RecsysResult, RequestCtx};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

const MAX_SCOPES: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RuleScope {
    pub tenant_id: Uuid,
    pub namespace: String,
    pub surface: String,
}

impl RuleScope {
    pub fn new(tenant_id: Uuid, namespace: &str, surface: &str) -> Self {
        Self {
            tenant_id,
            namespace: namespace.to_string(),
            surface: surface.trim().to_lowercase(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RulesManagerOptions {
    pub enabled: bool,
    pub refresh_interval: Duration,
    pub max_pin_slots: usize,
}

impl Default for RulesManagerOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            refresh_interval: Duration::from_millis(2000),
            max_pin_slots: 3,
        }
    }
}

pub struct RulesManager {
    store: Arc<dyn RuleStore>,
    opts: RulesManagerOptions,
    cache: TtlCache<RuleScope, Arc<Vec<Rule>>>,
}

impl RulesManager {
    pub fn new(store: Arc<dyn RuleStore>, mut opts: RulesManagerOptions) -> Self {
        if opts.refresh_interval.is_zero() {
            opts.refresh_interval = Duration::from_millis(2000);
        }
        if opts.max_pin_slots == 0 {
            opts.max_pin_slots = 3;
        }
        let cache = TtlCache::new(opts.refresh_interval, MAX_SCOPES);
        Self { store, opts, cache }
    }

    pub fn enabled(&self) -> bool {
        self.opts.enabled
    }

    pub fn max_pin_slots(&self) -> usize {
        self.opts.max_pin_slots
    }

    /// Drop cached rules for a namespace. An empty `surface` clears every
    /// surface under it.
    pub fn invalidate(&self, tenant_id: Uuid, namespace: &str, surface: &str) -> usize {
        let surface = surface.trim().to_lowercase();
        let removed = self.cache.invalidate(|k, _| {
            k.tenant_id == tenant_id
                && k.namespace == namespace
                && (surface.is_empty() || k.surface == surface)
        });
        debug!(tenant = %tenant_id, namespace, surface = %surface, removed, "Rules cache invalidated");
        removed
    }

    /// Enabled rules for a scope, served from cache within the refresh
    /// interval. Validity windows are checked at evaluation time against
    /// the request clock.
    pub async fn load(&self, ctx: &RequestCtx, scope: &RuleScope) -> RecsysResult<Arc<Vec<Rule>>> {
        if let Some(rules) = self.cache.get(scope) {
            return Ok(rules);
        }
        let rules = ctx
            .run(self.store.list_enabled_rules_for_scope(
                scope.tenant_id,
                &scope.namespace,
                &scope.surface,
            ))
            .await?;
        metrics::counter!("recsys.rules.cache_refresh").increment(1);
        let rules = Arc::new(rules);
        self.cache.put(scope.clone(), Arc::clone(&rules));
        Ok(rules)
    }

    /// Load and apply the scope's rules. Disabled managers pass the pool
    /// through untouched.
    pub async fn evaluate(
        &self,
        ctx: &RequestCtx,
        scope: &RuleScope,
        req: &EvaluateRequest<'_>,
        brand_prefixes: &[String],
        category_prefixes: &[String],
    ) -> RecsysResult<EvaluateResult> {
        if !self.opts.enabled {
            return Ok(EvaluateResult::passthrough(req.candidates));
        }
        let rules = self.load(ctx, scope).await?;
        let evaluator = RuleEvaluator::new(self.opts.max_pin_slots, brand_prefixes, category_prefixes);
        Ok(evaluator.apply(&rules, req))
    }
}
