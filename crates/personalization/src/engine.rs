//! The ranking pipeline.
//!
//! Candidate sources run concurrently, then the pool is filtered, blended,
//! personalized, passed through merchandising rules and diversified. Every
//! stage past retrieval is pure and in memory.

use crate::blend::{self, Candidate, SignalScores, REASON_ANCHOR};
use crate::candidates::{self, days_before, SourceRequest, WARNING_SIGNAL_UNAVAILABLE};
use crate::mmr::{self, DiversityParams, Pick, REASON_DIVERSITY};
use crate::personalize;
use chrono::{DateTime, Utc};
use recsys_cache::ArtifactCache;
use recsys_core::recommendation::{BlendWeights, RecommendationConfig};
use recsys_core::request::{
    ExplainLevel, NormalizedConstraints, NormalizedRecommendRequest, Weights, DEFAULT_MAX_ANCHORS,
};
use recsys_core::trace::{CapsExplain, TraceFinalItem, TraceMmr};
use recsys_core::types::ItemScore;
use recsys_core::{RecsysError, RecsysResult, RequestCtx, Store, Warning};
use recsys_rules::evaluate::prefix_matchers;
use recsys_rules::{EvaluateRequest, EvaluateResult, PolicySummary, RuleScope, RulesManager};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

pub const WARNING_RULES_UNAVAILABLE: &str = "RULES_UNAVAILABLE";
pub const WARNING_RULE_PIN_INJECTED: &str = "RULE_PIN_INJECTED";
pub const WARNING_CONSTRAINTS_FILTERED: &str = "CONSTRAINTS_FILTERED";
pub const WARNING_CANDIDATES_INCLUDE_FILTERED: &str = "CANDIDATES_INCLUDE_FILTERED";
pub const WARNING_CANDIDATES_INCLUDE_EMPTY: &str = "CANDIDATES_INCLUDE_EMPTY";

pub const MODEL_POPULARITY: &str = "popularity_v1";
pub const MODEL_BLEND: &str = "blend_v1";

pub const REASON_RULE_PIN: &str = "rule_pin";
pub const REASON_RULE_BOOST: &str = "rule_boost";

const MAX_PROMOTED_ANCHORS: usize = 3;

// ─── Response items ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ItemExplain {
    /// Weighted contribution of each signal.
    pub signals: SignalScores,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<SignalScores>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub normalized: Option<SignalScores>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub personalization: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mmr: Option<TraceMmr>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RankedItem {
    pub item_id: String,
    pub rank: usize,
    pub score: f64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub reasons: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explain: Option<ItemExplain>,
}

pub(crate) fn item_explain(
    level: ExplainLevel,
    candidate: Option<&Candidate>,
    weights: BlendWeights,
    rules: Vec<String>,
    mmr: Option<&TraceMmr>,
) -> Option<ItemExplain> {
    if level == ExplainLevel::None {
        return None;
    }
    let full = level == ExplainLevel::Full;
    let raw = candidate.map(|c| c.raw).unwrap_or_default();
    let normalized = candidate.map(|c| c.normalized).unwrap_or_default();
    Some(ItemExplain {
        signals: SignalScores {
            pop: weights.alpha * normalized.pop,
            cooc: weights.beta * normalized.cooc,
            emb: weights.gamma * normalized.emb,
        },
        rules,
        raw: full.then_some(raw),
        normalized: full.then_some(normalized),
        personalization: full.then(|| candidate.map_or(1.0, |c| c.multiplier)),
        mmr: if full { mmr.cloned() } else { None },
    })
}

// ─── Engine ─────────────────────────────────────────────────────────────────

pub struct EngineRequest<'a> {
    pub tenant: Uuid,
    pub namespace: &'a str,
    pub request: &'a NormalizedRecommendRequest,
    /// Effective knobs after segment and policy overlays.
    pub config: &'a RecommendationConfig,
    pub segment_id: &'a str,
    /// Weights from the tenant config document.
    pub tenant_weights: Option<Weights>,
    pub now: DateTime<Utc>,
}

/// Ranked items plus everything the decision trace needs.
#[derive(Debug, Clone, Default)]
pub struct EngineOutput {
    pub items: Vec<RankedItem>,
    pub warnings: Vec<Warning>,
    pub model_version: String,
    pub weights: BlendWeights,
    /// The cold-start blend was used.
    pub starter: bool,
    pub anchors: Vec<String>,
    pub candidates_pre: Vec<ItemScore>,
    pub final_items: Vec<TraceFinalItem>,
    pub mmr_info: Vec<TraceMmr>,
    pub caps: BTreeMap<String, CapsExplain>,
    pub personalized_items: Vec<String>,
    pub mmr_applied: bool,
    pub caps_applied: bool,
    pub policy_summary: PolicySummary,
    pub source_stats: Option<serde_json::Value>,
}

pub struct RecommendationEngine {
    pub(crate) store: Arc<dyn Store>,
    rules: Arc<RulesManager>,
    popularity_cache: Option<Arc<ArtifactCache>>,
}

fn push_unique(pool: &mut Vec<String>, seen: &mut HashSet<String>, id: &str) {
    if !id.is_empty() && seen.insert(id.to_string()) {
        pool.push(id.to_string());
    }
}

fn sorted_keys(m: &HashMap<String, f64>) -> Vec<&String> {
    let mut keys: Vec<&String> = m.keys().collect();
    keys.sort();
    keys
}

/// `required_tags` is any-of; `forbidden_tags` is none-of.
pub(crate) fn passes_constraints(tags: &[String], c: &NormalizedConstraints) -> bool {
    let required = c.required_tags.is_empty() || tags.iter().any(|t| c.required_tags.contains(t));
    required && !tags.iter().any(|t| c.forbidden_tags.contains(t))
}

impl RecommendationEngine {
    pub fn new(store: Arc<dyn Store>, rules: Arc<RulesManager>) -> Self {
        Self {
            store,
            rules,
            popularity_cache: None,
        }
    }

    pub fn with_popularity_cache(mut self, cache: Arc<ArtifactCache>) -> Self {
        self.popularity_cache = Some(cache);
        self
    }

    pub fn rules(&self) -> &Arc<RulesManager> {
        &self.rules
    }

    /// Lowercased tags for `ids`. Failures degrade to no tags.
    pub(crate) async fn load_tags(
        &self,
        ctx: &RequestCtx,
        tenant: Uuid,
        ns: &str,
        ids: &[String],
        warnings: Option<&mut Vec<Warning>>,
    ) -> RecsysResult<HashMap<String, Vec<String>>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        match ctx.run(self.store.list_items_tags(tenant, ns, ids)).await {
            Ok(tags) => Ok(tags
                .into_iter()
                .map(|(id, t)| {
                    let t = t
                        .into_iter()
                        .map(|s| s.trim().to_lowercase())
                        .filter(|s| !s.is_empty())
                        .collect();
                    (id, t)
                })
                .collect()),
            Err(RecsysError::Cancelled) => Err(RecsysError::Cancelled),
            Err(e) => {
                warn!(error = %e, "Item tags unavailable");
                metrics::counter!("recsys.source.errors", "source" => "tags").increment(1);
                if let Some(warnings) = warnings {
                    warnings.push(Warning::new(WARNING_SIGNAL_UNAVAILABLE, "item tags unavailable"));
                }
                Ok(HashMap::new())
            }
        }
    }

    pub async fn recommend(
        &self,
        ctx: &RequestCtx,
        req: &EngineRequest<'_>,
    ) -> RecsysResult<EngineOutput> {
        let r = req.request;
        let cfg = req.config;
        let subject = r.user.subject_key();
        let k = r.k.min(cfg.max_k);
        let mut warnings: Vec<Warning> = Vec::new();

        // Decide which signals are worth fetching before the cold-start
        // verdict is known.
        let explicit = r.weights.or(req.tenant_weights);
        let starter_possible = explicit.is_none() && cfg.profile_min_events_for_boost > 0;
        let preview = match explicit {
            Some(w) => BlendWeights::new(w.pop, w.cooc, w.emb).sanitized(),
            None => cfg.blend_for_surface(&r.surface).sanitized(),
        };
        let starter = cfg.starter_blend.sanitized();
        let request_anchors: &[String] = r.anchors.as_ref().map_or(&[], |a| a.item_ids.as_slice());

        let signals = candidates::gather(
            ctx,
            self.store.as_ref(),
            &SourceRequest {
                tenant: req.tenant,
                namespace: req.namespace,
                surface: &r.surface,
                subject,
                k,
                now: req.now,
                request_anchors,
                max_anchors: r.anchors.as_ref().map_or(DEFAULT_MAX_ANCHORS, |a| a.max_anchors),
                config: cfg,
                want_co_vis: preview.beta > 0.0 || (starter_possible && starter.beta > 0.0),
                want_similarity: preview.gamma > 0.0 || (starter_possible && starter.gamma > 0.0),
                want_profile: cfg.profile_boost > 0.0 || starter_possible,
                popularity_cache: self.popularity_cache.as_deref(),
            },
        )
        .await?;
        warnings.extend(signals.warnings.iter().cloned());

        let cold = cfg.profile_min_events_for_boost > 0
            && signals
                .user_events
                .is_some_and(|n| n < cfg.profile_min_events_for_boost);
        let (weights, starter_used) =
            blend::resolve_weights(cfg, &r.surface, r.weights, req.tenant_weights, cold);

        // ─── Pool ───
        let mut popularity: HashMap<String, f64> = signals
            .popularity
            .iter()
            .map(|s| (s.item_id.clone(), s.score))
            .collect();
        let injected_anchors: Vec<String> = if signals.anchors_from_request {
            signals.anchors.clone()
        } else {
            Vec::new()
        };
        let anchor_score = signals
            .popularity
            .iter()
            .map(|s| s.score)
            .fold(0.0, f64::max);
        let anchor_score = if anchor_score > 0.0 { anchor_score } else { 1.0 };

        let mut pool: Vec<String> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        for s in &signals.popularity {
            push_unique(&mut pool, &mut seen, &s.item_id);
        }
        for a in &injected_anchors {
            popularity.entry(a.clone()).or_insert(anchor_score);
            push_unique(&mut pool, &mut seen, a);
        }
        for id in sorted_keys(&signals.co_vis) {
            push_unique(&mut pool, &mut seen, id);
        }
        for id in sorted_keys(&signals.similarity) {
            push_unique(&mut pool, &mut seen, id);
        }
        if let Some(c) = &r.candidates {
            for id in &c.include_ids {
                push_unique(&mut pool, &mut seen, id);
            }
        }

        let mut summary = PolicySummary {
            total_candidates: pool.len(),
            ..Default::default()
        };

        // ─── Exclusions ───
        if let Some(c) = r.candidates.as_ref().filter(|c| !c.exclude_ids.is_empty()) {
            let exclude: HashSet<&str> = c.exclude_ids.iter().map(String::as_str).collect();
            let before = pool.len();
            pool.retain(|id| !exclude.contains(id.as_str()));
            summary.explicit_exclude_hits = before - pool.len();
        }
        if cfg.rule_exclude_events && !subject.is_empty() && !cfg.exclude_event_types.is_empty() {
            let since = days_before(req.now, cfg.purchased_window_days);
            let recent = ctx
                .run(self.store.list_user_event_items_since(
                    req.tenant,
                    req.namespace,
                    subject,
                    since,
                    &cfg.exclude_event_types,
                ))
                .await;
            match recent {
                Ok(ids) => {
                    let exclude: HashSet<String> = ids.into_iter().collect();
                    let before = pool.len();
                    pool.retain(|id| !exclude.contains(id));
                    summary.recent_event_exclude_hits = before - pool.len();
                }
                Err(RecsysError::Cancelled) => return Err(RecsysError::Cancelled),
                Err(e) => {
                    warn!(error = %e, "Recent event exclusions unavailable");
                    warnings.push(Warning::new(
                        WARNING_SIGNAL_UNAVAILABLE,
                        "recent event exclusions unavailable",
                    ));
                }
            }
        }
        summary.after_exclusions = pool.len();

        let mut item_tags = self
            .load_tags(ctx, req.tenant, req.namespace, &pool, Some(&mut warnings))
            .await?;

        // ─── Allow-list and tag constraints ───
        if let Some(c) = r.candidates.as_ref().filter(|c| !c.include_ids.is_empty()) {
            let allow: HashSet<&str> = c.include_ids.iter().map(String::as_str).collect();
            let before = pool.len();
            pool.retain(|id| allow.contains(id.as_str()));
            let removed = before - pool.len();
            if removed > 0 {
                warnings.push(Warning::new(
                    WARNING_CANDIDATES_INCLUDE_FILTERED,
                    format!("{removed} candidates outside include_ids removed"),
                ));
            }
            if pool.is_empty() {
                warnings.push(Warning::new(
                    WARNING_CANDIDATES_INCLUDE_EMPTY,
                    "no candidates left after include_ids filter",
                ));
            }
        }

        let mut filtered: HashSet<String> = HashSet::new();
        if let Some(c) = &r.constraints {
            let no_tags: Vec<String> = Vec::new();
            let removed: Vec<String> = pool
                .iter()
                .filter(|id| !passes_constraints(item_tags.get(*id).unwrap_or(&no_tags), c))
                .cloned()
                .collect();
            if !removed.is_empty() {
                summary.record_constraint_filtered(&removed);
                warnings.push(Warning::new(
                    WARNING_CONSTRAINTS_FILTERED,
                    format!("{} candidates removed by tag constraints", removed.len()),
                ));
                pool.retain(|id| !removed.contains(id));
                filtered.extend(removed);
            }
        }
        summary.after_constraint_filters = pool.len();

        // ─── Blend and personalize ───
        let mut ranked = blend::blend(&pool, &popularity, &signals.co_vis, &signals.similarity, weights);
        for c in ranked.iter_mut() {
            if injected_anchors.contains(&c.item_id) {
                c.add_reason(REASON_ANCHOR);
            }
        }

        let attenuation = if cold {
            cfg.profile_cold_start_multiplier * cfg.profile_starter_blend_weight
        } else {
            1.0
        };
        let profile = personalize::profile_weights(
            &signals.profile,
            &cfg.starter_profile,
            cold,
            cfg.profile_starter_blend_weight,
        );
        let personalized_items =
            personalize::apply(&mut ranked, &item_tags, &profile, cfg.profile_boost, attenuation);
        if !personalized_items.is_empty() {
            blend::sort_candidates(&mut ranked);
        }

        // ─── Rules ───
        let pre_rule: HashSet<String> = ranked.iter().map(|c| c.item_id.clone()).collect();
        let scores: Vec<ItemScore> = ranked.iter().map(Candidate::to_item_score).collect();
        let mut by_id: HashMap<String, Candidate> =
            ranked.into_iter().map(|c| (c.item_id.clone(), c)).collect();

        let mut rules_result: Option<EvaluateResult> = None;
        if cfg.rules_enabled && self.rules.enabled() {
            let scope = RuleScope::new(req.tenant, req.namespace, &r.surface);
            let eval = EvaluateRequest {
                segment_id: req.segment_id,
                now: req.now,
                candidates: &scores,
                item_tags: &item_tags,
            };
            match self
                .rules
                .evaluate(ctx, &scope, &eval, &cfg.brand_tag_prefixes, &cfg.category_tag_prefixes)
                .await
            {
                Ok(result) => rules_result = Some(result),
                Err(RecsysError::Cancelled) => return Err(RecsysError::Cancelled),
                Err(e) => {
                    warn!(error = %e, surface = %r.surface, "Rules unavailable");
                    warnings.push(Warning::new(
                        WARNING_RULES_UNAVAILABLE,
                        "rules unavailable; serving without rule effects",
                    ));
                }
            }
        }

        let (pinned, mut rule_pool) = match &rules_result {
            Some(result) => {
                summary.record_rules(result, &pre_rule);
                let outside: Vec<&str> = result
                    .pinned
                    .iter()
                    .filter(|p| !p.from_candidates)
                    .map(|p| p.item_id.as_str())
                    .collect();
                if !outside.is_empty() {
                    warnings.push(Warning::new(
                        WARNING_RULE_PIN_INJECTED,
                        format!("pinned items outside the candidate pool: {}", outside.join(",")),
                    ));
                }
                let pinned: Vec<ItemScore> = result
                    .pinned
                    .iter()
                    .map(|p| ItemScore::new(p.item_id.clone(), p.score))
                    .collect();
                (pinned, result.candidates.clone())
            }
            None => {
                summary.after_rules = scores.len();
                (Vec::new(), scores)
            }
        };
        blend::sort_scores(&mut rule_pool);

        for s in pinned.iter().chain(rule_pool.iter()) {
            by_id
                .entry(s.item_id.clone())
                .and_modify(|c| c.score = s.score)
                .or_insert_with(|| Candidate::bare(s.item_id.clone(), s.score));
        }
        let untagged: Vec<String> = pinned
            .iter()
            .chain(rule_pool.iter())
            .filter(|s| !item_tags.contains_key(&s.item_id))
            .map(|s| s.item_id.clone())
            .collect();
        if !untagged.is_empty() {
            let extra = self
                .load_tags(ctx, req.tenant, req.namespace, &untagged, None)
                .await?;
            item_tags.extend(extra);
        }

        let mut candidates_pre: Vec<ItemScore> = pinned.iter().chain(rule_pool.iter()).cloned().collect();
        blend::sort_scores(&mut candidates_pre);

        // ─── Diversify ───
        let brand_matchers = prefix_matchers(&cfg.brand_tag_prefixes);
        let category_matchers = prefix_matchers(&cfg.category_tag_prefixes);
        let no_tag_caps = BTreeMap::new();
        let params = DiversityParams {
            k,
            lambda: cfg.mmr_lambda_for_surface(&r.surface),
            brand_cap: cfg.brand_cap,
            category_cap: cfg.category_cap,
            brand_matchers: &brand_matchers,
            category_matchers: &category_matchers,
            max_per_tag: r.constraints.as_ref().map_or(&no_tag_caps, |c| &c.max_per_tag),
        };
        let selection = mmr::select(&pinned, &rule_pool, &item_tags, &params);
        if !selection.tag_cap_filtered.is_empty() {
            summary.record_constraint_filtered(&selection.tag_cap_filtered);
            warnings.push(Warning::new(
                WARNING_CONSTRAINTS_FILTERED,
                format!(
                    "{} candidates removed by max_per_tag",
                    selection.tag_cap_filtered.len()
                ),
            ));
            filtered.extend(selection.tag_cap_filtered.iter().cloned());
        }

        let picks = promote_anchors(selection.picks, request_anchors);

        // ─── Shape ───
        let level = r.options.explain;
        let mut items = Vec::with_capacity(picks.len());
        let mut final_items = Vec::with_capacity(picks.len());
        for (i, pick) in picks.iter().enumerate() {
            let candidate = by_id.get(&pick.item_id);
            let mut reasons = candidate.map(|c| c.reasons.clone()).unwrap_or_default();
            let effect = rules_result
                .as_ref()
                .and_then(|res| res.item_effects.get(&pick.item_id));
            if pick.pinned {
                reasons.push(REASON_RULE_PIN.to_string());
            }
            if effect.is_some_and(|e| e.boost_delta != 0.0) {
                reasons.push(REASON_RULE_BOOST.to_string());
            }
            if pick
                .mmr
                .as_ref()
                .is_some_and(|m| m.penalty > 0.0 || m.brand_cap_hit || m.category_cap_hit)
            {
                reasons.push(REASON_DIVERSITY.to_string());
            }
            let rule_tokens = rules_result
                .as_ref()
                .and_then(|res| res.reason_tags.get(&pick.item_id))
                .cloned()
                .unwrap_or_default();

            final_items.push(TraceFinalItem {
                item_id: pick.item_id.clone(),
                score: pick.score,
                reasons: reasons.clone(),
            });
            items.push(RankedItem {
                item_id: pick.item_id.clone(),
                rank: i + 1,
                score: pick.score,
                explain: item_explain(level, candidate, weights, rule_tokens, pick.mmr.as_ref()),
                reasons: if r.options.include_reasons { reasons } else { Vec::new() },
            });
        }

        let final_ids: Vec<String> = final_items.iter().map(|f| f.item_id.clone()).collect();
        summary.finalize(&final_ids, rules_result.as_ref(), &filtered);

        let model_version = if weights.beta == 0.0 && weights.gamma == 0.0 {
            MODEL_POPULARITY
        } else {
            MODEL_BLEND
        };
        debug!(
            tenant = %req.tenant,
            surface = %r.surface,
            pool = candidates_pre.len(),
            served = items.len(),
            starter = starter_used,
            "Ranked recommendation"
        );

        Ok(EngineOutput {
            items,
            warnings,
            model_version: model_version.to_string(),
            weights,
            starter: starter_used,
            anchors: signals.anchors.clone(),
            candidates_pre,
            final_items,
            mmr_info: picks.iter().filter_map(|p| p.mmr.clone()).collect(),
            caps: selection.caps,
            personalized_items,
            mmr_applied: selection.mmr_applied,
            caps_applied: selection.caps_applied,
            policy_summary: summary,
            source_stats: signals.stats_json(),
        })
    }
}

/// Move up to three requested anchors that made the list to just after
/// the pins, in request order.
fn promote_anchors(picks: Vec<Pick>, anchors: &[String]) -> Vec<Pick> {
    if anchors.is_empty() {
        return picks;
    }
    let pins = picks.iter().take_while(|p| p.pinned).count();
    let mut promoted: Vec<String> = Vec::new();
    for a in anchors {
        if promoted.len() >= MAX_PROMOTED_ANCHORS {
            break;
        }
        if picks.iter().skip(pins).any(|p| &p.item_id == a) {
            promoted.push(a.clone());
        }
    }
    if promoted.is_empty() {
        return picks;
    }
    let mut head: Vec<Pick> = Vec::with_capacity(picks.len());
    let mut rest: Vec<Pick> = Vec::new();
    let mut lifted: HashMap<String, Pick> = HashMap::new();
    for (i, p) in picks.into_iter().enumerate() {
        if i < pins {
            head.push(p);
        } else if promoted.contains(&p.item_id) {
            lifted.insert(p.item_id.clone(), p);
        } else {
            rest.push(p);
        }
    }
    for id in &promoted {
        if let Some(p) = lifted.remove(id) {
            head.push(p);
        }
    }
    head.extend(rest);
    head
}
