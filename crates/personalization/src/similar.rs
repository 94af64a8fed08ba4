use crate::blend::{self, Candidate};
use crate::candidates::{days_before, PER_ANCHOR_LIMIT, SOURCE_CO_VISITATION, SOURCE_SIMILARITY, WARNING_SIGNAL_UNAVAILABLE};
use crate::engine::{item_explain, passes_constraints, RankedItem, RecommendationEngine, WARNING_CONSTRAINTS_FILTERED};
use crate::mmr::{self, DiversityParams};
use chrono::{DateTime, Utc};
use recsys_core::recommendation::{BlendWeights, RecommendationConfig};
use recsys_core::request::NormalizedSimilarRequest;
use recsys_core::types::ItemScore;
use recsys_core::{RecsysError, RecsysResult, RequestCtx, Warning};
use std::collections::{BTreeMap, HashMap};
use tracing::warn;
use uuid::Uuid;

pub const MODEL_SIMILAR: &str = "similar_v1";

#[derive(Debug, Clone, Default)]
pub struct SimilarOutput {
    pub items: Vec<RankedItem>,
    pub warnings: Vec<Warning>,
    pub model_version: String,
}

fn source_scores(
    source: &str,
    result: RecsysResult<Vec<ItemScore>>,
    warnings: &mut Vec<Warning>,
) -> RecsysResult<Option<HashMap<String, f64>>> {
    match result {
        Ok(scores) => Ok(Some(
            scores.into_iter().map(|s| (s.item_id, s.score)).collect(),
        )),
        Err(RecsysError::Cancelled) => Err(RecsysError::Cancelled),
        Err(e) => {
            warn!(source, error = %e, "Similar-items source failed");
            metrics::counter!("recsys.source.errors", "source" => source.to_string()).increment(1);
            warnings.push(Warning::new(
                WARNING_SIGNAL_UNAVAILABLE,
                format!("{source} unavailable"),
            ));
            Ok(None)
        }
    }
}

impl RecommendationEngine {
    /// Items related to a single item: embedding neighbours blended with
    /// co-visitation. A missing signal yields an empty list with a warning.
    pub async fn similar(
        &self,
        ctx: &RequestCtx,
        tenant: Uuid,
        ns: &str,
        req: &NormalizedSimilarRequest,
        cfg: &RecommendationConfig,
        now: DateTime<Utc>,
    ) -> RecsysResult<SimilarOutput> {
        let mut warnings = Vec::new();
        let since = days_before(now, cfg.co_vis_window_days);
        let (sim, cooc) = tokio::join!(
            ctx.run(self.store.list_similar(tenant, ns, &req.item_id, PER_ANCHOR_LIMIT)),
            ctx.run(self.store.list_co_vis(tenant, ns, &req.item_id, since, PER_ANCHOR_LIMIT)),
        );
        let mut similarity = source_scores(SOURCE_SIMILARITY, sim, &mut warnings)?.unwrap_or_default();
        let mut co_vis = source_scores(SOURCE_CO_VISITATION, cooc, &mut warnings)?.unwrap_or_default();
        similarity.remove(&req.item_id);
        co_vis.remove(&req.item_id);

        if similarity.is_empty() && co_vis.is_empty() {
            warnings.push(Warning::new(
                WARNING_SIGNAL_UNAVAILABLE,
                format!("no similarity signal for item {}", req.item_id),
            ));
            return Ok(SimilarOutput {
                items: Vec::new(),
                warnings,
                model_version: MODEL_SIMILAR.to_string(),
            });
        }

        let mut pool: Vec<String> = similarity.keys().chain(co_vis.keys()).cloned().collect();
        pool.sort();
        pool.dedup();

        let item_tags = self.load_tags(ctx, tenant, ns, &pool, Some(&mut warnings)).await?;
        if let Some(c) = &req.constraints {
            let no_tags = Vec::new();
            let before = pool.len();
            pool.retain(|id| passes_constraints(item_tags.get(id).unwrap_or(&no_tags), c));
            let removed = before - pool.len();
            if removed > 0 {
                warnings.push(Warning::new(
                    WARNING_CONSTRAINTS_FILTERED,
                    format!("{removed} candidates removed by tag constraints"),
                ));
            }
        }

        let (beta, gamma) = if cfg.blend.beta <= 0.0 && cfg.blend.gamma <= 0.0 {
            (1.0, 1.0)
        } else {
            (cfg.blend.beta.max(0.0), cfg.blend.gamma.max(0.0))
        };
        let weights = BlendWeights::new(0.0, beta, gamma);
        let ranked = blend::blend(&pool, &HashMap::new(), &co_vis, &similarity, weights);
        let scores: Vec<ItemScore> = ranked.iter().map(Candidate::to_item_score).collect();
        let by_id: HashMap<&str, &Candidate> = ranked.iter().map(|c| (c.item_id.as_str(), c)).collect();

        let no_tag_caps = BTreeMap::new();
        let params = DiversityParams {
            k: req.k.min(cfg.max_k),
            lambda: 1.0,
            brand_cap: 0,
            category_cap: 0,
            brand_matchers: &[],
            category_matchers: &[],
            max_per_tag: req.constraints.as_ref().map_or(&no_tag_caps, |c| &c.max_per_tag),
        };
        let selection = mmr::select(&[], &scores, &item_tags, &params);
        if !selection.tag_cap_filtered.is_empty() {
            warnings.push(Warning::new(
                WARNING_CONSTRAINTS_FILTERED,
                format!(
                    "{} candidates removed by max_per_tag",
                    selection.tag_cap_filtered.len()
                ),
            ));
        }

        let items = selection
            .picks
            .iter()
            .enumerate()
            .map(|(i, pick)| {
                let candidate = by_id.get(pick.item_id.as_str()).copied();
                RankedItem {
                    item_id: pick.item_id.clone(),
                    rank: i + 1,
                    score: pick.score,
                    reasons: if req.options.include_reasons {
                        candidate.map(|c| c.reasons.clone()).unwrap_or_default()
                    } else {
                        Vec::new()
                    },
                    explain: item_explain(req.options.explain, candidate, weights, Vec::new(), None),
                }
            })
            .collect();

        Ok(SimilarOutput {
            items,
            warnings,
            model_version: MODEL_SIMILAR.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use recsys_core::request::{normalize_similar, Constraints, SimilarRequest};
    use recsys_core::types::{Event, Item};
    use recsys_rules::{RulesManager, RulesManagerOptions};
    use recsys_store::{FailPoint, MemoryStore};
    use std::sync::Arc;

    fn tenant() -> Uuid {
        Uuid::from_u128(7)
    }

    fn fixture() -> (Arc<MemoryStore>, RecommendationEngine) {
        let store = Arc::new(MemoryStore::new());
        store.add_tenant(tenant());
        store.upsert_items(
            tenant(),
            "default",
            vec![
                Item::new("a", &["shoes", "brand:acme"]),
                Item::new("b", &["shoes", "brand:acme"]),
                Item::new("c", &["shoes", "brand:globex"]),
                Item::new("d", &["hats"]),
            ],
        );
        let now = Utc::now();
        let events = ["a", "b", "a", "c"]
            .iter()
            .enumerate()
            .map(|(i, item)| Event {
                user_id: format!("u{}", i / 2),
                item_id: item.to_string(),
                event_type: "view".into(),
                ts: now - Duration::hours(1),
            })
            .collect();
        store.record_events(tenant(), "default", events);
        let rules = Arc::new(RulesManager::new(store.clone(), RulesManagerOptions::default()));
        let engine = RecommendationEngine::new(store.clone(), rules);
        (store, engine)
    }

    fn request(item: &str, constraints: Option<Constraints>) -> NormalizedSimilarRequest {
        normalize_similar(&SimilarRequest {
            surface: "pdp".into(),
            item_id: item.into(),
            k: Some(5),
            constraints,
            ..Default::default()
        })
        .unwrap()
        .0
    }

    #[tokio::test]
    async fn test_similar_excludes_self() {
        let (_, engine) = fixture();
        let ctx = RequestCtx::background(tenant());
        let out = engine
            .similar(&ctx, tenant(), "default", &request("a", None), &RecommendationConfig::default(), Utc::now())
            .await
            .unwrap();
        let ids: Vec<_> = out.items.iter().map(|i| i.item_id.as_str()).collect();
        assert!(!ids.contains(&"a"));
        assert_eq!(ids[0], "b");
        assert_eq!(out.model_version, MODEL_SIMILAR);
    }

    #[tokio::test]
    async fn test_similar_constraints() {
        let (_, engine) = fixture();
        let ctx = RequestCtx::background(tenant());
        let constraints = Constraints {
            forbidden_tags: vec!["brand:acme".into()],
            ..Default::default()
        };
        let out = engine
            .similar(&ctx, tenant(), "default", &request("a", Some(constraints)), &RecommendationConfig::default(), Utc::now())
            .await
            .unwrap();
        assert!(out.items.iter().all(|i| i.item_id != "b"));
        assert!(out.warnings.iter().any(|w| w.code == WARNING_CONSTRAINTS_FILTERED));
    }

    #[tokio::test]
    async fn test_missing_signal_is_empty_with_warning() {
        let (store, engine) = fixture();
        store.set_fail(FailPoint::Similar, true);
        store.set_fail(FailPoint::CoVis, true);
        let ctx = RequestCtx::background(tenant());
        let out = engine
            .similar(&ctx, tenant(), "default", &request("a", None), &RecommendationConfig::default(), Utc::now())
            .await
            .unwrap();
        assert!(out.items.is_empty());
        assert!(out.warnings.iter().all(|w| w.code == WARNING_SIGNAL_UNAVAILABLE));
        assert_eq!(out.warnings.len(), 3);
    }
}
