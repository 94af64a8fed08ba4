//! Score blending: per-source min-max normalization and a weighted sum.

use recsys_core::recommendation::{BlendWeights, RecommendationConfig};
use recsys_core::request::Weights;
use recsys_core::types::ItemScore;
use serde::Serialize;
use std::collections::HashMap;

pub const REASON_POPULARITY: &str = "recent_popularity";
pub const REASON_CO_VISITATION: &str = "co_visitation";
pub const REASON_SIMILARITY: &str = "embedding_similarity";
pub const REASON_ANCHOR: &str = "anchor";

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq)]
pub struct SignalScores {
    pub pop: f64,
    pub cooc: f64,
    pub emb: f64,
}

/// One pool item as it moves through the ranking stages.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub item_id: String,
    pub score: f64,
    pub raw: SignalScores,
    pub normalized: SignalScores,
    /// Personalization multiplier, 1.0 when untouched.
    pub multiplier: f64,
    pub reasons: Vec<String>,
}

impl Candidate {
    /// A pool entry without any signal, e.g. an injected include id.
    pub fn bare(item_id: impl Into<String>, score: f64) -> Self {
        Self {
            item_id: item_id.into(),
            score,
            raw: SignalScores::default(),
            normalized: SignalScores::default(),
            multiplier: 1.0,
            reasons: Vec::new(),
        }
    }

    pub fn add_reason(&mut self, reason: &str) {
        if !self.reasons.iter().any(|r| r == reason) {
            self.reasons.push(reason.to_string());
        }
    }

    pub fn to_item_score(&self) -> ItemScore {
        ItemScore::new(self.item_id.clone(), self.score)
    }
}

/// Min-max normalize into [0, 1]. A degenerate range maps positive
/// values to 1 and the rest to 0.
pub fn min_max<'a>(values: impl IntoIterator<Item = (&'a str, f64)>) -> HashMap<String, f64> {
    let values: Vec<(&str, f64)> = values.into_iter().filter(|(_, v)| v.is_finite()).collect();
    let (lo, hi) = values
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), (_, v)| (lo.min(*v), hi.max(*v)));
    let range = hi - lo;
    values
        .into_iter()
        .map(|(id, v)| {
            let n = if range > f64::EPSILON {
                (v - lo) / range
            } else if v > 0.0 {
                1.0
            } else {
                0.0
            };
            (id.to_string(), n)
        })
        .collect()
}

/// Blend weights for a request.
///
/// Explicit weights (request, then tenant document) win. Otherwise cold
/// users get the starter triplet and everyone else the surface blend.
/// Returns the weights and whether the starter triplet was used.
pub fn resolve_weights(
    cfg: &RecommendationConfig,
    surface: &str,
    request: Option<Weights>,
    tenant: Option<Weights>,
    cold: bool,
) -> (BlendWeights, bool) {
    if let Some(w) = request.or(tenant) {
        return (BlendWeights::new(w.pop, w.cooc, w.emb).sanitized(), false);
    }
    if cold {
        return (cfg.starter_blend.sanitized(), true);
    }
    (cfg.blend_for_surface(surface).sanitized(), false)
}

/// Blend every pool id. Items missing from a source score 0 there.
pub fn blend(
    pool: &[String],
    popularity: &HashMap<String, f64>,
    co_vis: &HashMap<String, f64>,
    similarity: &HashMap<String, f64>,
    weights: BlendWeights,
) -> Vec<Candidate> {
    let in_pool = |m: &HashMap<String, f64>| -> HashMap<String, f64> {
        min_max(
            pool.iter()
                .filter_map(|id| m.get(id).map(|v| (id.as_str(), *v))),
        )
    };
    let pop_n = in_pool(popularity);
    let cooc_n = in_pool(co_vis);
    let emb_n = in_pool(similarity);

    let mut out: Vec<Candidate> = pool
        .iter()
        .map(|id| {
            let raw = SignalScores {
                pop: popularity.get(id).copied().unwrap_or(0.0),
                cooc: co_vis.get(id).copied().unwrap_or(0.0),
                emb: similarity.get(id).copied().unwrap_or(0.0),
            };
            let normalized = SignalScores {
                pop: pop_n.get(id).copied().unwrap_or(0.0),
                cooc: cooc_n.get(id).copied().unwrap_or(0.0),
                emb: emb_n.get(id).copied().unwrap_or(0.0),
            };
            let score = weights.alpha * normalized.pop
                + weights.beta * normalized.cooc
                + weights.gamma * normalized.emb;
            let mut c = Candidate::bare(id.clone(), score);
            c.raw = raw;
            c.normalized = normalized;
            if raw.pop > 0.0 {
                c.add_reason(REASON_POPULARITY);
            }
            if raw.cooc > 0.0 {
                c.add_reason(REASON_CO_VISITATION);
            }
            if raw.emb > 0.0 {
                c.add_reason(REASON_SIMILARITY);
            }
            c
        })
        .collect();
    sort_candidates(&mut out);
    out
}

/// Score descending, ties by item id ascending.
pub fn sort_candidates(items: &mut [Candidate]) {
    items.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.item_id.cmp(&b.item_id))
    });
}

pub fn sort_scores(items: &mut [ItemScore]) {
    items.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.item_id.cmp(&b.item_id))
    });
}
