//! Profile-based score boosting.

use crate::blend::Candidate;
use recsys_core::types::ProfileTag;
use std::collections::HashMap;

pub const REASON_PERSONALIZATION: &str = "personalization";

/// Tag weights used for boosting, normalized to sum to 1.
///
/// Cold users get the starter profile blended in with `starter_weight`;
/// with no history at all the starter profile is used alone.
pub fn profile_weights(
    profile: &[ProfileTag],
    starter: &HashMap<String, f64>,
    cold: bool,
    starter_weight: f64,
) -> HashMap<String, f64> {
    let user = normalize(
        profile
            .iter()
            .map(|t| (t.tag.trim().to_lowercase(), t.weight)),
    );
    if !cold || starter.is_empty() {
        return user;
    }
    let starter = normalize(starter.iter().map(|(t, w)| (t.trim().to_lowercase(), *w)));
    if user.is_empty() {
        return starter;
    }
    let w = starter_weight.clamp(0.0, 1.0);
    let mut merged: HashMap<String, f64> = HashMap::new();
    for (tag, v) in user {
        *merged.entry(tag).or_default() += (1.0 - w) * v;
    }
    for (tag, v) in starter {
        *merged.entry(tag).or_default() += w * v;
    }
    normalize(merged)
}

fn normalize(weights: impl IntoIterator<Item = (String, f64)>) -> HashMap<String, f64> {
    let mut out: HashMap<String, f64> = HashMap::new();
    for (tag, w) in weights {
        if tag.is_empty() || !w.is_finite() || w <= 0.0 {
            continue;
        }
        *out.entry(tag).or_default() += w;
    }
    let total: f64 = out.values().sum();
    if total > 0.0 {
        for w in out.values_mut() {
            *w /= total;
        }
    }
    out
}

/// Multiply each candidate by `1 + boost * overlap * attenuation`, where
/// overlap is the profile weight carried by the item's tags. Returns the
/// boosted item ids, sorted.
pub fn apply(
    candidates: &mut [Candidate],
    item_tags: &HashMap<String, Vec<String>>,
    weights: &HashMap<String, f64>,
    boost: f64,
    attenuation: f64,
) -> Vec<String> {
    if boost <= 0.0 || attenuation <= 0.0 || weights.is_empty() {
        return Vec::new();
    }
    let mut boosted = Vec::new();
    for c in candidates.iter_mut() {
        let Some(tags) = item_tags.get(&c.item_id) else {
            continue;
        };
        let mut seen: Vec<&str> = Vec::with_capacity(tags.len());
        let mut overlap = 0.0;
        for tag in tags {
            if seen.contains(&tag.as_str()) {
                continue;
            }
            seen.push(tag.as_str());
            overlap += weights.get(tag).copied().unwrap_or(0.0);
        }
        if overlap <= 0.0 {
            continue;
        }
        let multiplier = 1.0 + boost * overlap.min(1.0) * attenuation;
        c.score *= multiplier;
        c.multiplier = multiplier;
        c.add_reason(REASON_PERSONALIZATION);
        boosted.push(c.item_id.clone());
    }
    boosted.sort();
    boosted
}
