//! Greedy maximal-marginal-relevance selection with brand, category and
//! per-tag caps.

use crate::blend::min_max;
use recsys_core::trace::{CapUsage, CapsExplain, TraceMmr};
use recsys_core::types::ItemScore;
use recsys_rules::evaluate::structured_value;
use std::collections::{BTreeMap, HashMap, HashSet};

pub const REASON_DIVERSITY: &str = "diversity";

#[derive(Debug, Clone)]
pub struct DiversityParams<'a> {
    pub k: usize,
    /// 1.0 ranks by relevance alone.
    pub lambda: f64,
    /// 0 disables the cap.
    pub brand_cap: usize,
    pub category_cap: usize,
    /// `"prefix:"` matchers, see [`recsys_rules::evaluate::prefix_matchers`].
    pub brand_matchers: &'a [String],
    pub category_matchers: &'a [String],
    pub max_per_tag: &'a BTreeMap<String, usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Pick {
    pub item_id: String,
    pub score: f64,
    pub pinned: bool,
    pub mmr: Option<TraceMmr>,
}

#[derive(Debug, Clone, Default)]
pub struct Selection {
    pub picks: Vec<Pick>,
    pub caps: BTreeMap<String, CapsExplain>,
    pub mmr_applied: bool,
    pub caps_applied: bool,
    /// Items dropped by `max_per_tag`.
    pub tag_cap_filtered: Vec<String>,
}

enum Verdict {
    Admit,
    Brand(String, usize),
    Category(String, usize),
    Tag,
}

struct Caps<'p, 'a> {
    params: &'p DiversityParams<'a>,
    brands: HashMap<String, usize>,
    categories: HashMap<String, usize>,
    tags: HashMap<String, usize>,
}

impl<'p, 'a> Caps<'p, 'a> {
    fn new(params: &'p DiversityParams<'a>) -> Self {
        Self {
            params,
            brands: HashMap::new(),
            categories: HashMap::new(),
            tags: HashMap::new(),
        }
    }

    fn values(tags: &[String], matchers: &[String]) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for tag in tags {
            if let Some(v) = structured_value(tag, matchers) {
                if !out.iter().any(|o| o == v) {
                    out.push(v.to_string());
                }
            }
        }
        out
    }

    fn check(&self, tags: &[String]) -> Verdict {
        let p = self.params;
        if p.brand_cap > 0 {
            for v in Self::values(tags, p.brand_matchers) {
                let n = self.brands.get(&v).copied().unwrap_or(0);
                if n >= p.brand_cap {
                    return Verdict::Brand(v, n);
                }
            }
        }
        if p.category_cap > 0 {
            for v in Self::values(tags, p.category_matchers) {
                let n = self.categories.get(&v).copied().unwrap_or(0);
                if n >= p.category_cap {
                    return Verdict::Category(v, n);
                }
            }
        }
        for tag in tags {
            if let Some(limit) = p.max_per_tag.get(tag) {
                if self.tags.get(tag).copied().unwrap_or(0) >= *limit {
                    return Verdict::Tag;
                }
            }
        }
        Verdict::Admit
    }

    /// Count the item and describe its cap usage.
    fn admit(&mut self, tags: &[String]) -> CapsExplain {
        let p = self.params;
        let mut explain = CapsExplain::default();
        if p.brand_cap > 0 {
            for v in Self::values(tags, p.brand_matchers) {
                let n = self.brands.entry(v.clone()).or_default();
                *n += 1;
                explain.brand.get_or_insert(CapUsage {
                    applied: false,
                    limit: Some(p.brand_cap),
                    count: Some(*n),
                    value: v,
                });
            }
        }
        if p.category_cap > 0 {
            for v in Self::values(tags, p.category_matchers) {
                let n = self.categories.entry(v.clone()).or_default();
                *n += 1;
                explain.category.get_or_insert(CapUsage {
                    applied: false,
                    limit: Some(p.category_cap),
                    count: Some(*n),
                    value: v,
                });
            }
        }
        let mut seen = HashSet::new();
        for tag in tags {
            if p.max_per_tag.contains_key(tag) && seen.insert(tag.as_str()) {
                *self.tags.entry(tag.clone()).or_default() += 1;
            }
        }
        explain
    }
}

fn jaccard(a: &HashSet<&str>, b: &HashSet<&str>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let inter = a.intersection(b).count();
    inter as f64 / (a.len() + b.len() - inter) as f64
}

/// Place `pinned` first, then fill up to `k` from `pool`.
///
/// Pins bypass scoring and caps but count toward both. Each later pick
/// maximizes `lambda * relevance - (1 - lambda) * max_similarity`, ties
/// by score then item id; capped candidates are skipped for good since
/// counts only grow.
pub fn select(
    pinned: &[ItemScore],
    pool: &[ItemScore],
    item_tags: &HashMap<String, Vec<String>>,
    params: &DiversityParams<'_>,
) -> Selection {
    let empty: Vec<String> = Vec::new();
    let tags_of = |id: &str| item_tags.get(id).unwrap_or(&empty);
    let tag_set = |id: &str| -> HashSet<&str> { tags_of(id).iter().map(String::as_str).collect() };

    let mut out = Selection::default();
    let mut caps = Caps::new(params);
    let mut selected: Vec<HashSet<&str>> = Vec::new();

    for pin in pinned.iter().take(params.k) {
        let explain = caps.admit(tags_of(&pin.item_id));
        if explain.brand.is_some() || explain.category.is_some() {
            out.caps.insert(pin.item_id.clone(), explain);
        }
        selected.push(tag_set(&pin.item_id));
        out.picks.push(Pick {
            item_id: pin.item_id.clone(),
            score: pin.score,
            pinned: true,
            mmr: None,
        });
    }

    let use_mmr = params.lambda < 1.0;
    let lambda = params.lambda.clamp(0.0, 1.0);
    let relevance = min_max(pool.iter().map(|c| (c.item_id.as_str(), c.score)));
    let pool_sets: Vec<HashSet<&str>> = pool.iter().map(|c| tag_set(&c.item_id)).collect();
    let mut remaining: Vec<usize> = (0..pool.len()).collect();
    out.mmr_applied = use_mmr && !pool.is_empty() && out.picks.len() < params.k;

    while out.picks.len() < params.k && !remaining.is_empty() {
        let mut ranked: Vec<(usize, f64, f64, f64)> = remaining
            .iter()
            .map(|&i| {
                let rel = relevance.get(&pool[i].item_id).copied().unwrap_or(0.0);
                if !use_mmr {
                    return (i, rel, rel, 0.0);
                }
                let max_sim = selected
                    .iter()
                    .map(|s| jaccard(&pool_sets[i], s))
                    .fold(0.0, f64::max);
                (i, lambda * rel - (1.0 - lambda) * max_sim, rel, max_sim)
            })
            .collect();
        ranked.sort_by(|a, b| {
            b.1.total_cmp(&a.1)
                .then_with(|| pool[b.0].score.total_cmp(&pool[a.0].score))
                .then_with(|| pool[a.0].item_id.cmp(&pool[b.0].item_id))
        });

        let mut dropped: HashSet<usize> = HashSet::new();
        let mut chosen = None;
        let (mut brand_hit, mut category_hit) = (false, false);
        for &(i, _, rel, max_sim) in &ranked {
            let id = &pool[i].item_id;
            match caps.check(tags_of(id)) {
                Verdict::Admit => {
                    chosen = Some((i, rel, max_sim));
                    break;
                }
                Verdict::Brand(value, count) => {
                    brand_hit = true;
                    out.caps.entry(id.clone()).or_default().brand = Some(CapUsage {
                        applied: true,
                        limit: Some(params.brand_cap),
                        count: Some(count),
                        value,
                    });
                }
                Verdict::Category(value, count) => {
                    category_hit = true;
                    out.caps.entry(id.clone()).or_default().category = Some(CapUsage {
                        applied: true,
                        limit: Some(params.category_cap),
                        count: Some(count),
                        value,
                    });
                }
                Verdict::Tag => out.tag_cap_filtered.push(id.clone()),
            }
            dropped.insert(i);
        }
        out.caps_applied |= brand_hit || category_hit;

        let Some((i, rel, max_sim)) = chosen else {
            break;
        };
        remaining.retain(|r| *r != i && !dropped.contains(r));

        let item = &pool[i];
        let explain = caps.admit(tags_of(&item.item_id));
        if explain.brand.is_some() || explain.category.is_some() {
            out.caps.insert(item.item_id.clone(), explain);
        }
        selected.push(pool_sets[i].clone());
        let mmr = use_mmr.then(|| TraceMmr {
            pick_index: out.picks.len(),
            item_id: item.item_id.clone(),
            max_sim,
            relevance: rel,
            penalty: (1.0 - lambda) * max_sim,
            brand_cap_hit: brand_hit,
            category_cap_hit: category_hit,
        });
        out.picks.push(Pick {
            item_id: item.item_id.clone(),
            score: item.score,
            pinned: false,
            mmr,
        });
    }
    out
}
