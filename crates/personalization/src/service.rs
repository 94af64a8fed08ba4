//! Request orchestration: normalize, pick a segment and (optionally) a
//! bandit policy, rank, then emit the decision trace and exposure event.

use crate::coverage::CoverageTracker;
use crate::engine::{EngineOutput, EngineRequest, RankedItem, RecommendationEngine};
use crate::similar::SimilarOutput;
use chrono::{DateTime, Utc};
use recsys_analytics::{
    hash_subject, DecisionRecorder, ExposedItem, ExposureEvent, ExposureLogger, TraceSampler,
    EXPOSURE_SCHEMA_VERSION,
};
use recsys_cache::{ConfigCache, RulesCache};
use recsys_core::recommendation::{ConfigCell, RecommendationConfig};
use recsys_core::request::{
    normalize_recommend, normalize_similar, ExperimentRef, NormalizedContext,
    NormalizedRecommendRequest, RecommendRequest, SimilarRequest, Weights,
};
use recsys_core::trace::{
    user_hash, DecisionTrace, TraceBandit, TraceConfig, TraceConstraints, TraceExtras,
};
use recsys_core::types::TenantDocument;
use recsys_core::{Clock, RecsysError, RecsysResult, RequestCtx, Store, SystemClock, Warning};
use recsys_rl_engine::{bucket_key, BanditManager, DecideInput, Decision, ExperimentAssigner};
use recsys_segmentation::SegmentSelection;
use recsys_segmentation::SegmentSelector;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const ALGO_VERSION: &str = concat!("recsys@", env!("CARGO_PKG_VERSION"));
pub const WARNING_SEGMENT_UNAVAILABLE: &str = "SEGMENT_UNAVAILABLE";

// ─── Wire types ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ResponseMeta {
    pub tenant_id: Uuid,
    pub surface: String,
    pub segment: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_id: Option<String>,
    pub k: usize,
    pub count: usize,
    pub model_version: String,
    pub algo_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rules_version: Option<String>,
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub experiment: Option<ExperimentRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bandit: Option<Decision>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RecommendResponse {
    pub items: Vec<RankedItem>,
    pub meta: ResponseMeta,
    pub warnings: Vec<Warning>,
    /// Present when the request asked for `options.include_trace`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<DecisionTrace>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ValidateMeta {
    pub tenant_id: Uuid,
    pub surface: String,
    pub segment: String,
    pub k: usize,
    pub request_id: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ValidateResponse {
    pub normalized_request: NormalizedRecommendRequest,
    pub warnings: Vec<Warning>,
    pub meta: ValidateMeta,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SimilarResponse {
    pub items: Vec<RankedItem>,
    pub meta: ResponseMeta,
    pub warnings: Vec<Warning>,
}

/// A recommend request served through a bandit-chosen policy.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BanditRecommendRequest {
    #[serde(flatten)]
    pub request: RecommendRequest,
    #[serde(default)]
    pub candidate_policy_ids: Vec<String>,
}

/// Bandit bucket context derived from the normalized request context.
pub fn bucket_context(ctx: Option<&NormalizedContext>) -> HashMap<String, String> {
    let mut out = HashMap::new();
    if let Some(c) = ctx {
        for (k, v) in [("locale", &c.locale), ("device", &c.device), ("country", &c.country)] {
            if !v.is_empty() {
                out.insert(k.to_string(), v.clone());
            }
        }
    }
    out
}

fn trace_config(cfg: &RecommendationConfig, output: &EngineOutput, surface: &str) -> TraceConfig {
    TraceConfig {
        alpha: output.weights.alpha,
        beta: output.weights.beta,
        gamma: output.weights.gamma,
        profile_boost: cfg.profile_boost,
        profile_window_days: cfg.profile_window_days,
        profile_top_n: cfg.profile_top_n,
        mmr_lambda: cfg.mmr_lambda_for_surface(surface),
        brand_cap: cfg.brand_cap,
        category_cap: cfg.category_cap,
        half_life_days: cfg.half_life_days,
        co_vis_window_days: cfg.co_vis_window_days,
        purchased_window_days: cfg.purchased_window_days,
        rule_exclude_events: cfg.rule_exclude_events,
        popularity_fanout: cfg.popularity_fanout,
    }
}

/// Per-request state carried from ranking into trace and exposure.
struct Served<'a> {
    req: &'a NormalizedRecommendRequest,
    cfg: &'a RecommendationConfig,
    selection: &'a SegmentSelection,
    segment_id: &'a str,
    decision: Option<&'a Decision>,
    output: &'a EngineOutput,
    warnings: &'a [Warning],
    duration_ms: u64,
    now: DateTime<Utc>,
}

// ─── Service ────────────────────────────────────────────────────────────────

pub struct RecommendationService {
    store: Arc<dyn Store>,
    config: Arc<ConfigCell>,
    engine: Arc<RecommendationEngine>,
    segments: SegmentSelector,
    bandit: Arc<BanditManager>,
    coverage: Arc<CoverageTracker>,
    config_cache: Arc<ConfigCache>,
    rules_cache: Arc<RulesCache>,
    namespace: String,
    assigner: Option<Arc<dyn ExperimentAssigner>>,
    recorder: Option<Arc<DecisionRecorder>>,
    sampler: TraceSampler,
    audit_salt: String,
    exposure: Option<Arc<dyn ExposureLogger>>,
    exposure_salt: String,
    clock: Arc<dyn Clock>,
}

pub struct ServiceParts {
    pub store: Arc<dyn Store>,
    pub config: Arc<ConfigCell>,
    pub engine: Arc<RecommendationEngine>,
    pub bandit: Arc<BanditManager>,
    pub coverage: Arc<CoverageTracker>,
    pub config_cache: Arc<ConfigCache>,
    pub rules_cache: Arc<RulesCache>,
    pub namespace: String,
}

impl RecommendationService {
    pub fn new(parts: ServiceParts) -> Self {
        Self {
            segments: SegmentSelector::new(parts.store.clone()),
            store: parts.store,
            config: parts.config,
            engine: parts.engine,
            bandit: parts.bandit,
            coverage: parts.coverage,
            config_cache: parts.config_cache,
            rules_cache: parts.rules_cache,
            namespace: parts.namespace,
            assigner: None,
            recorder: None,
            sampler: TraceSampler::new(1.0, HashMap::new()),
            audit_salt: String::new(),
            exposure: None,
            exposure_salt: String::new(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_assigner(mut self, assigner: Arc<dyn ExperimentAssigner>) -> Self {
        self.assigner = Some(assigner);
        self
    }

    pub fn with_recorder(
        mut self,
        recorder: Arc<DecisionRecorder>,
        sampler: TraceSampler,
        salt: impl Into<String>,
    ) -> Self {
        self.recorder = Some(recorder);
        self.sampler = sampler;
        self.audit_salt = salt.into();
        self
    }

    pub fn with_exposure(mut self, logger: Arc<dyn ExposureLogger>, salt: impl Into<String>) -> Self {
        self.exposure = Some(logger);
        self.exposure_salt = salt.into();
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn config(&self) -> &Arc<ConfigCell> {
        &self.config
    }

    pub fn coverage(&self) -> &Arc<CoverageTracker> {
        &self.coverage
    }

    pub fn engine(&self) -> &Arc<RecommendationEngine> {
        &self.engine
    }

    /// Normalize only. Nothing is served or recorded.
    pub async fn validate(
        &self,
        ctx: &RequestCtx,
        dto: &RecommendRequest,
    ) -> RecsysResult<ValidateResponse> {
        ctx.run(self.store.resolve_tenant(ctx.tenant_id)).await?;
        let (req, warnings) = normalize_recommend(dto)?;
        Ok(ValidateResponse {
            meta: ValidateMeta {
                tenant_id: ctx.tenant_id,
                surface: req.surface.clone(),
                segment: req.segment.clone(),
                k: req.k,
                request_id: ctx.request_id.clone(),
            },
            normalized_request: req,
            warnings,
        })
    }

    pub async fn recommend(
        &self,
        ctx: &RequestCtx,
        dto: &RecommendRequest,
    ) -> RecsysResult<RecommendResponse> {
        self.serve(ctx, dto, None).await
    }

    /// Decide a policy for the request context, overlay its knobs on the
    /// current config snapshot, then recommend.
    pub async fn bandit_recommend(
        &self,
        ctx: &RequestCtx,
        req: &BanditRecommendRequest,
    ) -> RecsysResult<RecommendResponse> {
        self.serve(ctx, &req.request, Some(&req.candidate_policy_ids))
            .await
    }

    async fn serve(
        &self,
        ctx: &RequestCtx,
        dto: &RecommendRequest,
        policy_ids: Option<&[String]>,
    ) -> RecsysResult<RecommendResponse> {
        let started = Instant::now();
        let tenant = ctx.tenant_id;
        let ns = self.namespace.as_str();
        ctx.run(self.store.resolve_tenant(tenant)).await?;

        let (mut req, mut warnings) = normalize_recommend(dto)?;
        if let Some(assigner) = &self.assigner {
            req.experiment = assigner.assign(req.experiment.as_ref(), &req.user);
        }
        let snapshot = self.config.load();
        let now = req
            .context
            .as_ref()
            .and_then(|c| c.now)
            .unwrap_or_else(|| self.clock.now());

        let selection = match self.segments.select(ctx, tenant, ns, &req, now).await {
            Ok(selection) => selection,
            Err(RecsysError::Cancelled) => return Err(RecsysError::Cancelled),
            Err(e) => {
                warn!(%tenant, error = %e, "Segment selection failed");
                warnings.push(Warning::new(
                    WARNING_SEGMENT_UNAVAILABLE,
                    "segment selection unavailable; using the requested segment",
                ));
                SegmentSelection::default()
            }
        };
        let segment_id = if selection.segment_id.is_empty() {
            req.segment.clone()
        } else {
            selection.segment_id.clone()
        };

        let mut cfg = snapshot.config.clone();
        if let Some(profile) = &selection.profile {
            cfg = cfg.with_overrides(&profile.overrides);
        } else if let Some(overrides) = snapshot.config.segment_profiles.get(&segment_id) {
            cfg = cfg.with_overrides(overrides);
        }

        let decision = match policy_ids {
            Some(ids) => {
                let decision = self.decide(ctx, &req, &cfg, ids).await?;
                match &decision.policy {
                    Some(policy) => cfg = cfg.with_overrides(&policy.knobs),
                    None => debug!(policy_id = %decision.policy_id, "Policy knobs unavailable; serving the config snapshot"),
                }
                Some(decision)
            }
            None => None,
        };

        let config_doc = self.tenant_doc(ctx, &req.surface, false).await?;
        let rules_doc = self.tenant_doc(ctx, &req.surface, true).await?;
        let tenant_weights = config_doc
            .as_ref()
            .and_then(|d| d.document.get("weights"))
            .and_then(|w| serde_json::from_value::<Weights>(w.clone()).ok())
            .filter(|w| w.pop >= 0.0 && w.cooc >= 0.0 && w.emb >= 0.0);

        let output = self
            .engine
            .recommend(
                ctx,
                &EngineRequest {
                    tenant,
                    namespace: ns,
                    request: &req,
                    config: &cfg,
                    segment_id: &segment_id,
                    tenant_weights,
                    now,
                },
            )
            .await?;
        warnings.extend(output.warnings.iter().cloned());

        self.observe_coverage(ctx, &output.items).await?;

        let duration_ms = started.elapsed().as_millis() as u64;
        let served = Served {
            req: &req,
            cfg: &cfg,
            selection: &selection,
            segment_id: &segment_id,
            decision: decision.as_ref(),
            output: &output,
            warnings: &warnings,
            duration_ms,
            now,
        };

        let sampled = self.recorder.is_some() && self.sampler.should_sample(ns, &ctx.request_id);
        let trace = if sampled || req.options.include_trace {
            Some(self.build_trace(ctx, &served))
        } else {
            None
        };
        if sampled {
            if let (Some(recorder), Some(trace)) = (&self.recorder, &trace) {
                recorder.record(trace.clone());
            }
        }

        let config_version = config_doc.map(|d| d.version);
        let rules_version = rules_doc.map(|d| d.version);
        if let Some(logger) = &self.exposure {
            logger.log(self.exposure_event(ctx, &served, config_version.clone(), rules_version.clone()));
        }

        metrics::counter!("recsys.recommend.requests", "surface" => req.surface.clone()).increment(1);
        metrics::histogram!("recsys.recommend.latency_ms").record(duration_ms as f64);
        info!(
            %tenant,
            request_id = %ctx.request_id,
            surface = %req.surface,
            segment = %segment_id,
            count = output.items.len(),
            duration_ms,
            "Recommendation served"
        );

        let profile_id = Some(selection.profile_id.clone()).filter(|p| !p.is_empty());
        Ok(RecommendResponse {
            meta: ResponseMeta {
                tenant_id: tenant,
                surface: req.surface.clone(),
                segment: segment_id.clone(),
                profile_id,
                k: req.k,
                count: output.items.len(),
                model_version: output.model_version.clone(),
                algo_version: ALGO_VERSION.to_string(),
                config_version,
                rules_version,
                request_id: ctx.request_id.clone(),
                experiment: req.experiment.clone(),
                bandit: decision.clone(),
            },
            items: output.items.clone(),
            warnings,
            trace: if req.options.include_trace { trace } else { None },
        })
    }

    pub async fn similar(
        &self,
        ctx: &RequestCtx,
        dto: &SimilarRequest,
    ) -> RecsysResult<SimilarResponse> {
        let tenant = ctx.tenant_id;
        ctx.run(self.store.resolve_tenant(tenant)).await?;
        let (req, mut warnings) = normalize_similar(dto)?;
        let snapshot = self.config.load();
        let cfg = match snapshot.config.segment_profiles.get(&req.segment) {
            Some(overrides) => snapshot.config.with_overrides(overrides),
            None => snapshot.config.clone(),
        };

        let SimilarOutput {
            items,
            warnings: extra,
            model_version,
        } = self
            .engine
            .similar(ctx, tenant, &self.namespace, &req, &cfg, self.clock.now())
            .await?;
        warnings.extend(extra);
        metrics::counter!("recsys.similar.requests", "surface" => req.surface.clone()).increment(1);

        Ok(SimilarResponse {
            meta: ResponseMeta {
                tenant_id: tenant,
                surface: req.surface.clone(),
                segment: req.segment.clone(),
                profile_id: None,
                k: req.k,
                count: items.len(),
                model_version,
                algo_version: ALGO_VERSION.to_string(),
                config_version: None,
                rules_version: None,
                request_id: ctx.request_id.clone(),
                experiment: None,
                bandit: None,
            },
            items,
            warnings,
        })
    }

    async fn decide(
        &self,
        ctx: &RequestCtx,
        req: &NormalizedRecommendRequest,
        cfg: &RecommendationConfig,
        policy_ids: &[String],
    ) -> RecsysResult<Decision> {
        let bucket = bucket_key(&bucket_context(req.context.as_ref()));
        let experiment = cfg.bandit_experiment.enabled.then_some(&cfg.bandit_experiment);
        self.bandit
            .decide(
                ctx,
                ctx.tenant_id,
                &self.namespace,
                &DecideInput {
                    surface: &req.surface,
                    bucket_key: &bucket,
                    candidate_policy_ids: policy_ids,
                    experiment,
                    seed: (req.options.seed != 0).then_some(req.options.seed),
                },
            )
            .await
    }

    /// Tenant config or rules document through its cache. A tenant without
    /// a document yields `None`; other store failures are logged and
    /// ignored.
    async fn tenant_doc(
        &self,
        ctx: &RequestCtx,
        surface: &str,
        rules: bool,
    ) -> RecsysResult<Option<TenantDocument>> {
        let tenant = ctx.tenant_id;
        let loaded = if rules {
            self.rules_cache
                .get_or_load(tenant, surface, || {
                    ctx.run(self.store.get_tenant_rules(tenant))
                })
                .await
        } else {
            self.config_cache
                .get_or_load(tenant, surface, || {
                    ctx.run(self.store.get_tenant_config(tenant))
                })
                .await
        };
        match loaded {
            Ok(doc) => Ok(Some(doc)),
            Err(RecsysError::Cancelled) => Err(RecsysError::Cancelled),
            Err(RecsysError::NotFound(_)) => Ok(None),
            Err(e) => {
                debug!(%tenant, rules, error = %e, "Tenant document unavailable");
                Ok(None)
            }
        }
    }

    async fn observe_coverage(&self, ctx: &RequestCtx, items: &[RankedItem]) -> RecsysResult<()> {
        if items.is_empty() {
            return Ok(());
        }
        let ids: Vec<String> = items.iter().map(|i| i.item_id.clone()).collect();
        match self
            .coverage
            .lookup(ctx, ctx.tenant_id, &self.namespace, &ids)
            .await
        {
            Ok(lookup) => {
                metrics::counter!("recsys.coverage.items_served").increment(ids.len() as u64);
                metrics::counter!("recsys.coverage.long_tail_served")
                    .increment(lookup.long_tail_count() as u64);
                Ok(())
            }
            Err(RecsysError::Cancelled) => Err(RecsysError::Cancelled),
            Err(e) => {
                debug!(error = %e, "Coverage lookup failed");
                Ok(())
            }
        }
    }

    fn build_trace(&self, ctx: &RequestCtx, s: &Served<'_>) -> DecisionTrace {
        let req = s.req;
        let out = s.output;
        let constraints = {
            let include_tags_any = req
                .constraints
                .as_ref()
                .map(|c| c.required_tags.clone())
                .unwrap_or_default();
            let exclude_item_ids = req
                .candidates
                .as_ref()
                .map(|c| c.exclude_ids.clone())
                .unwrap_or_default();
            (!include_tags_any.is_empty() || !exclude_item_ids.is_empty()).then_some(
                TraceConstraints {
                    include_tags_any,
                    exclude_item_ids,
                },
            )
        };
        let request_context_keys = req
            .context
            .as_ref()
            .map(|c| {
                let mut keys: Vec<String> = bucket_context(Some(c)).into_keys().collect();
                if c.now.is_some() {
                    keys.push("now".to_string());
                }
                keys.sort();
                keys
            })
            .unwrap_or_default();

        DecisionTrace {
            decision_id: Uuid::new_v4(),
            org_id: ctx.tenant_id,
            ts: s.now,
            namespace: self.namespace.clone(),
            surface: req.surface.clone(),
            request_id: Some(ctx.request_id.clone()).filter(|r| !r.is_empty()),
            user_hash: user_hash(&self.namespace, req.user.subject_key(), &self.audit_salt),
            k: req.k,
            constraints,
            effective_config: trace_config(s.cfg, out, &req.surface),
            bandit: s.decision.map(|d| TraceBandit {
                chosen_policy_id: d.policy_id.clone(),
                algorithm: d.algorithm.as_str().to_string(),
                bucket_key: d.bucket_key.clone(),
                explore: d.explore,
                request_id: ctx.request_id.clone(),
                explain: d.explain.clone(),
            }),
            candidates_pre: out.candidates_pre.clone(),
            final_items: out.final_items.clone(),
            mmr_info: out.mmr_info.clone(),
            caps: out.caps.clone(),
            extras: TraceExtras {
                model_version: out.model_version.clone(),
                duration_ms: s.duration_ms,
                include_reasons: req.options.include_reasons,
                explain_level: req.options.explain.as_str().to_string(),
                starter_profile: if out.starter { "starter" } else { "base" }.to_string(),
                anchors: out.anchors.clone(),
                segment_id: Some(s.segment_id.to_string()).filter(|v| !v.is_empty()),
                profile_id: Some(s.selection.profile_id.clone()).filter(|v| !v.is_empty()),
                personalized_items: out.personalized_items.clone(),
                request_context_keys,
                mmr_applied: out.mmr_applied,
                caps_applied: out.caps_applied,
                warnings: s.warnings.iter().map(|w| w.code.clone()).collect(),
                policy_summary: serde_json::to_value(&out.policy_summary).ok(),
                source_stats: out.source_stats.clone(),
            },
        }
    }

    fn exposure_event(
        &self,
        ctx: &RequestCtx,
        s: &Served<'_>,
        config_version: Option<String>,
        rules_version: Option<String>,
    ) -> ExposureEvent {
        let user = &s.req.user;
        let subject = if user.user_id.is_empty() {
            user.anonymous_id.as_str()
        } else {
            user.user_id.as_str()
        };
        ExposureEvent {
            schema_version: EXPOSURE_SCHEMA_VERSION.to_string(),
            ts: s.now,
            request_id: ctx.request_id.clone(),
            tenant_id: ctx.tenant_id,
            namespace: self.namespace.clone(),
            surface: s.req.surface.clone(),
            segment_id: s.segment_id.to_string(),
            subject_hash: hash_subject(&self.exposure_salt, subject),
            session_hash: hash_subject(&self.exposure_salt, &user.session_id),
            items: s
                .output
                .items
                .iter()
                .map(|i| ExposedItem {
                    item_id: i.item_id.clone(),
                    rank: i.rank,
                    score: i.score,
                })
                .collect(),
            experiment: s.req.experiment.clone(),
            model_version: s.output.model_version.clone(),
            algo_version: ALGO_VERSION.to_string(),
            config_version,
            rules_version,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use recsys_analytics::{MemoryExposureLogger, MemorySink, RecorderOptions};
    use recsys_core::request::{Options, RequestContext, UserRef};
    use recsys_core::store::BanditStore;
    use recsys_core::types::{Algorithm, PolicyConfig};
    use recsys_core::recommendation::TuningOverrides;
    use recsys_rl_engine::DeterministicAssigner;
    use recsys_rules::{RulesManager, RulesManagerOptions};
    use recsys_store::{FailPoint, MemoryStore};
    use std::time::Duration;

    struct Fixture {
        store: Arc<MemoryStore>,
        service: RecommendationService,
        exposure: Arc<MemoryExposureLogger>,
        sink: Arc<MemorySink>,
        recorder: Arc<DecisionRecorder>,
        tenant: Uuid,
    }

    fn fixture() -> Fixture {
        let tenant = Uuid::from_u128(99);
        let store = Arc::new(MemoryStore::new());
        store.seed_demo(tenant, "default");
        let dyn_store: Arc<dyn Store> = store.clone();
        let rules = Arc::new(RulesManager::new(dyn_store.clone(), RulesManagerOptions::default()));
        let engine = Arc::new(RecommendationEngine::new(dyn_store.clone(), rules));
        let bandit = Arc::new(BanditManager::new(store.clone(), Algorithm::Thompson));
        let cfg = RecommendationConfig::default();
        let coverage = Arc::new(CoverageTracker::new(
            dyn_store.clone(),
            Duration::from_secs(cfg.coverage_cache_ttl_secs),
            cfg.coverage_long_tail_hint_threshold,
        ));
        let exposure = Arc::new(MemoryExposureLogger::new());
        let sink = Arc::new(MemorySink::new());
        let recorder = DecisionRecorder::start(sink.clone(), RecorderOptions::default());
        let service = RecommendationService::new(ServiceParts {
            store: dyn_store,
            config: Arc::new(ConfigCell::new(cfg, "test")),
            engine,
            bandit,
            coverage,
            config_cache: Arc::new(ConfigCache::new("config", Duration::from_secs(60))),
            rules_cache: Arc::new(RulesCache::new("rules", Duration::from_secs(60))),
            namespace: "default".into(),
        })
        .with_recorder(recorder.clone(), TraceSampler::new(1.0, HashMap::new()), "pepper")
        .with_exposure(exposure.clone(), "salt")
        .with_assigner(Arc::new(DeterministicAssigner::new(
            vec!["A".into(), "B".into()],
            "salt",
        )));
        Fixture {
            store,
            service,
            exposure,
            sink,
            recorder,
            tenant,
        }
    }

    fn request(user: &str) -> RecommendRequest {
        RecommendRequest {
            surface: "home".into(),
            user: Some(UserRef {
                user_id: user.into(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_defaults_and_meta() {
        let f = fixture();
        let ctx = RequestCtx::new("req-1", f.tenant);
        let resp = f.service.recommend(&ctx, &request("user_01")).await.unwrap();
        assert_eq!(resp.meta.k, 20);
        assert_eq!(resp.meta.request_id, "req-1");
        assert_eq!(resp.meta.algo_version, ALGO_VERSION);
        assert!(resp.items.len() <= 20);
        assert!(!resp.items.is_empty());
        assert!(resp.warnings.iter().any(|w| w.code == "DEFAULT_APPLIED"));
        assert!(resp.meta.experiment.is_some());
        assert!(resp.trace.is_none());
    }

    #[tokio::test]
    async fn test_trace_and_exposure_emitted() {
        let f = fixture();
        let ctx = RequestCtx::new("req-2", f.tenant);
        let mut dto = request("user_02");
        dto.options = Some(Options {
            include_trace: Some(true),
            ..Default::default()
        });
        let resp = f.service.recommend(&ctx, &dto).await.unwrap();
        let trace = resp.trace.as_ref().unwrap();
        assert_eq!(trace.user_hash, user_hash("default", "user_02", "pepper"));
        assert_eq!(trace.final_items.len(), resp.items.len());
        assert_eq!(trace.extras.starter_profile, "base");

        f.recorder.shutdown().await;
        assert_eq!(f.sink.len(), 1);
        let events = f.exposure.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].subject_hash, hash_subject("salt", "user_02"));
        assert_eq!(events[0].items.len(), resp.items.len());
    }

    #[tokio::test]
    async fn test_segment_failure_degrades() {
        let f = fixture();
        f.store.set_fail(FailPoint::Segments, true);
        let ctx = RequestCtx::new("req-3", f.tenant);
        let resp = f.service.recommend(&ctx, &request("user_03")).await.unwrap();
        assert!(resp
            .warnings
            .iter()
            .any(|w| w.code == WARNING_SEGMENT_UNAVAILABLE));
        assert_eq!(resp.meta.segment, "default");
    }

    #[tokio::test]
    async fn test_bandit_recommend_overlays_policy() {
        let f = fixture();
        f.store
            .upsert_policies(
                f.tenant,
                "default",
                &[PolicyConfig {
                    policy_id: "tight".into(),
                    name: "tight".into(),
                    active: true,
                    knobs: TuningOverrides {
                        brand_cap: Some(1),
                        ..Default::default()
                    },
                    notes: String::new(),
                }],
            )
            .await
            .unwrap();
        let ctx = RequestCtx::new("req-4", f.tenant);
        let mut dto = request("user_04");
        dto.context = Some(RequestContext {
            device: "mobile".into(),
            ..Default::default()
        });
        dto.options = Some(Options {
            include_trace: Some(true),
            ..Default::default()
        });
        let resp = f
            .service
            .bandit_recommend(
                &ctx,
                &BanditRecommendRequest {
                    request: dto,
                    candidate_policy_ids: vec!["tight".into()],
                },
            )
            .await
            .unwrap();
        let bandit = resp.meta.bandit.as_ref().unwrap();
        assert_eq!(bandit.policy_id, "tight");
        assert_eq!(bandit.bucket_key, "ctx:device=mobile");
        let trace = resp.trace.unwrap();
        assert_eq!(trace.effective_config.brand_cap, 1);
        assert_eq!(trace.bandit.unwrap().chosen_policy_id, "tight");
    }

    #[tokio::test]
    async fn test_unknown_tenant() {
        let f = fixture();
        let ctx = RequestCtx::new("req-5", Uuid::from_u128(1));
        let err = f.service.recommend(&ctx, &request("user_05")).await.unwrap_err();
        assert_eq!(err.status(), 404);
    }

    #[tokio::test]
    async fn test_validate_does_not_serve() {
        let f = fixture();
        let ctx = RequestCtx::new("req-6", f.tenant);
        let resp = f.service.validate(&ctx, &request("user_06")).await.unwrap();
        assert_eq!(resp.normalized_request.k, 20);
        assert!(f.exposure.events().is_empty());
    }

    #[test]
    fn test_bucket_context() {
        let ctx = NormalizedContext {
            locale: "fi-FI".into(),
            device: String::new(),
            country: "FI".into(),
            now: None,
        };
        let m = bucket_context(Some(&ctx));
        assert_eq!(m.len(), 2);
        assert!(bucket_context(None).is_empty());
    }
}
