use chrono::{DateTime, Utc};
use recsys_core::types::{ItemScore, Rule, RuleAction, RuleTarget};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use uuid::Uuid;

/// Inputs of one evaluation pass. Candidates arrive in pool order.
#[derive(Debug, Clone)]
pub struct EvaluateRequest<'a> {
    pub segment_id: &'a str,
    pub now: DateTime<Utc>,
    pub candidates: &'a [ItemScore],
    pub item_tags: &'a HashMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BoostDetail {
    pub rule_id: Uuid,
    pub delta: f64,
}

/// What the rules did to one item.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ItemEffect {
    pub blocked: bool,
    pub pinned: bool,
    pub boost_delta: f64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub block_rules: Vec<Uuid>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub pin_rules: Vec<Uuid>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub boost_rules: Vec<BoostDetail>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PinnedItem {
    pub item_id: String,
    pub score: f64,
    /// False when the pin pulled the item in from outside the pool.
    pub from_candidates: bool,
    pub rules: Vec<Uuid>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RuleMatch {
    pub rule_id: Uuid,
    pub action: RuleAction,
    pub target_type: RuleTarget,
    pub item_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct EvaluateResult {
    /// Remaining pool with boosted scores, blocked and pinned items removed.
    pub candidates: Vec<ItemScore>,
    /// Pinned items in placement order.
    pub pinned: Vec<PinnedItem>,
    pub matches: Vec<RuleMatch>,
    pub evaluated_rule_ids: Vec<Uuid>,
    pub item_effects: HashMap<String, ItemEffect>,
    /// Sorted `blocked:{id}` / `pinned:{id}` / `boosted:{id}` tokens per item.
    pub reason_tags: HashMap<String, Vec<String>>,
}

impl EvaluateResult {
    /// Result of a pass with no rules.
    pub fn passthrough(candidates: &[ItemScore]) -> Self {
        Self {
            candidates: candidates.to_vec(),
            ..Default::default()
        }
    }

    pub fn is_blocked(&self, item_id: &str) -> bool {
        self.item_effects.get(item_id).is_some_and(|e| e.blocked)
    }

    pub fn blocked_ids(&self) -> HashSet<&str> {
        self.item_effects
            .iter()
            .filter(|(_, e)| e.blocked)
            .map(|(id, _)| id.as_str())
            .collect()
    }
}

#[derive(Default)]
struct ItemState {
    blocked: bool,
    block_rules: Vec<Uuid>,
    pinned: bool,
    pin_rules: Vec<Uuid>,
    boost_delta: f64,
    boost_rules: Vec<BoostDetail>,
}

/// Normalize configured prefixes into `"prefix:"` matchers.
pub fn prefix_matchers(prefixes: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(prefixes.len());
    for raw in prefixes {
        let p = raw.trim().to_lowercase();
        let p = p.trim_end_matches(':');
        if p.is_empty() {
            continue;
        }
        let m = format!("{p}:");
        if !out.contains(&m) {
            out.push(m);
        }
    }
    out
}

/// Value of a structured tag such as `brand:acme` under any matcher.
pub fn structured_value<'t>(tag: &'t str, matchers: &[String]) -> Option<&'t str> {
    matchers.iter().find_map(|m| {
        tag.strip_prefix(m.as_str())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    })
}

fn normalize_tag(tag: &str) -> String {
    tag.trim().to_lowercase()
}

/// Applies an ordered rule set to a candidate pool.
pub struct RuleEvaluator {
    max_pin_slots: usize,
    brand_matchers: Vec<String>,
    category_matchers: Vec<String>,
}

impl RuleEvaluator {
    pub fn new(max_pin_slots: usize, brand_prefixes: &[String], category_prefixes: &[String]) -> Self {
        Self {
            max_pin_slots,
            brand_matchers: prefix_matchers(brand_prefixes),
            category_matchers: prefix_matchers(category_prefixes),
        }
    }

    /// Rules not applying to `req.segment_id` at `req.now` are skipped.
    /// The rest run by priority descending, ties by rule id.
    pub fn apply(&self, rules: &[Rule], req: &EvaluateRequest<'_>) -> EvaluateResult {
        let mut ordered: Vec<&Rule> = rules
            .iter()
            .filter(|r| r.applies_to(req.now, req.segment_id))
            .collect();
        ordered.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.rule_id.to_string().cmp(&b.rule_id.to_string()))
        });

        let mut scores: HashMap<String, f64> =
            req.candidates.iter().map(|c| (c.item_id.clone(), c.score)).collect();
        let original: HashSet<&str> = req.candidates.iter().map(|c| c.item_id.as_str()).collect();
        let mut order: Vec<String> = Vec::with_capacity(req.candidates.len());
        for c in req.candidates {
            if !order.contains(&c.item_id) {
                order.push(c.item_id.clone());
            }
        }

        let index = self.index(req.item_tags);
        let mut states: HashMap<String, ItemState> = HashMap::new();
        let mut pinned_order: Vec<String> = Vec::new();
        let mut remaining_pins = self.max_pin_slots;
        let mut result = EvaluateResult::default();

        for rule in ordered {
            result.evaluated_rule_ids.push(rule.rule_id);
            let matched = index.match_rule(rule);
            if matched.is_empty() {
                continue;
            }
            result.matches.push(RuleMatch {
                rule_id: rule.rule_id,
                action: rule.action,
                target_type: rule.target_type,
                item_ids: matched.clone(),
            });

            match rule.action {
                RuleAction::Block => {
                    for id in matched {
                        let st = states.entry(id).or_default();
                        if st.pinned {
                            st.pinned = false;
                            remaining_pins = (remaining_pins + 1).min(self.max_pin_slots);
                        }
                        st.blocked = true;
                        if !st.block_rules.contains(&rule.rule_id) {
                            st.block_rules.push(rule.rule_id);
                        }
                    }
                }
                RuleAction::Pin => {
                    let limit = rule
                        .max_pins
                        .map_or(self.max_pin_slots, |m| m.min(self.max_pin_slots));
                    let mut pinned_by_rule = 0;
                    for id in matched {
                        if remaining_pins == 0 || pinned_by_rule >= limit {
                            break;
                        }
                        let st = states.entry(id.clone()).or_default();
                        if st.blocked || st.pinned {
                            continue;
                        }
                        st.pinned = true;
                        st.pin_rules.push(rule.rule_id);
                        if !pinned_order.contains(&id) {
                            pinned_order.push(id);
                        }
                        remaining_pins -= 1;
                        pinned_by_rule += 1;
                    }
                }
                RuleAction::Boost => {
                    let Some(boost) = rule.boost_value.filter(|v| *v != 0.0 && v.is_finite()) else {
                        continue;
                    };
                    for id in matched {
                        let st = states.entry(id.clone()).or_default();
                        if st.blocked {
                            continue;
                        }
                        let score = scores.entry(id.clone()).or_insert_with(|| {
                            order.push(id.clone());
                            0.0
                        });
                        *score += boost;
                        st.boost_delta += boost;
                        st.boost_rules.push(BoostDetail {
                            rule_id: rule.rule_id,
                            delta: boost,
                        });
                    }
                }
            }
        }

        let excluded = |id: &str| states.get(id).is_some_and(|s| s.blocked || s.pinned);
        result.candidates = order
            .iter()
            .filter(|id| !excluded(id.as_str()))
            .filter_map(|id| scores.get(id).map(|s| ItemScore::new(id.clone(), *s)))
            .collect();

        result.pinned = pinned_order
            .iter()
            .filter_map(|id| {
                let st = states.get(id)?;
                if !st.pinned || st.blocked {
                    return None;
                }
                Some(PinnedItem {
                    item_id: id.clone(),
                    score: scores.get(id).copied().unwrap_or(0.0),
                    from_candidates: original.contains(id.as_str()),
                    rules: st.pin_rules.clone(),
                })
            })
            .collect();

        for (id, st) in states {
            let mut tokens = BTreeSet::new();
            tokens.extend(st.block_rules.iter().filter(|_| st.blocked).map(|r| format!("blocked:{r}")));
            tokens.extend(st.pin_rules.iter().filter(|_| st.pinned).map(|r| format!("pinned:{r}")));
            tokens.extend(st.boost_rules.iter().map(|b| format!("boosted:{}", b.rule_id)));
            let effect = ItemEffect {
                blocked: st.blocked,
                pinned: st.pinned,
                boost_delta: st.boost_delta,
                block_rules: if st.blocked { st.block_rules } else { Vec::new() },
                pin_rules: if st.pinned { st.pin_rules } else { Vec::new() },
                boost_rules: st.boost_rules,
            };
            if !tokens.is_empty() {
                result.reason_tags.insert(id.clone(), tokens.into_iter().collect());
            }
            if effect.blocked || effect.pinned || effect.boost_delta != 0.0 {
                result.item_effects.insert(id, effect);
            }
        }
        result
    }

    fn index(&self, item_tags: &HashMap<String, Vec<String>>) -> TagIndex {
        let mut index = TagIndex::default();
        for (item_id, tags) in item_tags {
            for tag in tags {
                let tag = normalize_tag(tag);
                if tag.is_empty() {
                    continue;
                }
                if let Some(v) = structured_value(&tag, &self.brand_matchers) {
                    index.brands.entry(v.to_string()).or_default().insert(item_id.clone());
                } else if let Some(v) = structured_value(&tag, &self.category_matchers) {
                    index.categories.entry(v.to_string()).or_default().insert(item_id.clone());
                }
                index.tags.entry(tag).or_default().insert(item_id.clone());
            }
        }
        index
    }
}

/// Reverse indexes from tag, brand and category values to item ids.
#[derive(Default)]
struct TagIndex {
    tags: HashMap<String, BTreeSet<String>>,
    brands: HashMap<String, BTreeSet<String>>,
    categories: HashMap<String, BTreeSet<String>>,
}

impl TagIndex {
    /// Concrete item ids a rule targets, deduplicated in a stable order.
    fn match_rule(&self, rule: &Rule) -> Vec<String> {
        match rule.target_type {
            RuleTarget::Item => {
                let mut out: Vec<String> = Vec::with_capacity(rule.item_ids.len());
                for id in &rule.item_ids {
                    let id = id.trim();
                    if !id.is_empty() && !out.iter().any(|o| o == id) {
                        out.push(id.to_string());
                    }
                }
                out
            }
            RuleTarget::Tag => Self::lookup(&self.tags, rule),
            RuleTarget::Brand => Self::lookup(&self.brands, rule),
            RuleTarget::Category => Self::lookup(&self.categories, rule),
        }
    }

    fn lookup(map: &HashMap<String, BTreeSet<String>>, rule: &Rule) -> Vec<String> {
        let key = rule.target_key.as_deref().map(normalize_tag).unwrap_or_default();
        if key.is_empty() {
            return Vec::new();
        }
        map.get(&key)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn rule(action: RuleAction, target: RuleTarget, items: &[&str], priority: i32) -> Rule {
        let now = Utc::now();
        Rule {
            rule_id: Uuid::new_v4(),
            tenant_id: Uuid::nil(),
            namespace: "default".into(),
            surface: "home".into(),
            name: String::new(),
            description: String::new(),
            action,
            target_type: target,
            target_key: None,
            item_ids: items.iter().map(|s| s.to_string()).collect(),
            boost_value: None,
            max_pins: None,
            segment_id: None,
            priority,
            enabled: true,
            valid_from: None,
            valid_until: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn pool(ids: &[(&str, f64)]) -> Vec<ItemScore> {
        ids.iter().map(|(id, s)| ItemScore::new(*id, *s)).collect()
    }

    fn tags() -> HashMap<String, Vec<String>> {
        [
            ("x", vec!["brand:Acme", "category:shoes"]),
            ("y", vec!["brand:globex", "sale"]),
            ("z", vec!["cat:shoes", "Sale"]),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.into_iter().map(String::from).collect()))
        .collect()
    }

    fn evaluator() -> RuleEvaluator {
        RuleEvaluator::new(3, &["brand".into()], &["category".into(), "cat:".into()])
    }

    fn run(rules: &[Rule], candidates: &[ItemScore]) -> EvaluateResult {
        let tags = tags();
        evaluator().apply(
            rules,
            &EvaluateRequest {
                segment_id: "default",
                now: Utc::now(),
                candidates,
                item_tags: &tags,
            },
        )
    }

    #[test]
    fn test_block_beats_lower_priority_pin() {
        let block = rule(RuleAction::Block, RuleTarget::Item, &["x"], 10);
        let pin = rule(RuleAction::Pin, RuleTarget::Item, &["x", "y"], 5);
        let res = run(&[pin, block.clone()], &pool(&[("x", 3.0), ("y", 2.0), ("z", 1.0)]));

        let pinned: Vec<_> = res.pinned.iter().map(|p| p.item_id.as_str()).collect();
        assert_eq!(pinned, vec!["y"]);
        let rest: Vec<_> = res.candidates.iter().map(|c| c.item_id.as_str()).collect();
        assert_eq!(rest, vec!["z"]);
        assert!(res.is_blocked("x"));
        assert_eq!(res.reason_tags["x"], vec![format!("blocked:{}", block.rule_id)]);
    }

    #[test]
    fn test_later_block_releases_pin() {
        let pin = rule(RuleAction::Pin, RuleTarget::Item, &["x"], 10);
        let block = rule(RuleAction::Block, RuleTarget::Item, &["x"], 1);
        let res = run(&[pin, block], &pool(&[("x", 1.0)]));
        assert!(res.pinned.is_empty());
        assert!(res.candidates.is_empty());
        let effect = &res.item_effects["x"];
        assert!(effect.blocked && !effect.pinned);
        assert!(effect.pin_rules.is_empty());
    }

    #[test]
    fn test_pin_slots_and_per_rule_limit() {
        let mut first = rule(RuleAction::Pin, RuleTarget::Item, &["a", "b", "c"], 10);
        first.max_pins = Some(2);
        let second = rule(RuleAction::Pin, RuleTarget::Item, &["d", "e"], 5);
        let res = run(&[first, second], &pool(&[("a", 1.0), ("d", 1.0)]));
        let pinned: Vec<_> = res
            .pinned
            .iter()
            .map(|p| (p.item_id.as_str(), p.from_candidates))
            .collect();
        assert_eq!(pinned, vec![("a", true), ("b", false), ("d", true)]);
    }

    #[test]
    fn test_boost_accumulates_and_injects() {
        let mut b1 = rule(RuleAction::Boost, RuleTarget::Item, &["y", "new"], 3);
        b1.boost_value = Some(0.5);
        let mut b2 = rule(RuleAction::Boost, RuleTarget::Tag, &[], 2);
        b2.target_key = Some("SALE".into());
        b2.boost_value = Some(0.25);
        let res = run(&[b1, b2], &pool(&[("y", 1.0), ("z", 1.0)]));

        let scores: HashMap<_, _> =
            res.candidates.iter().map(|c| (c.item_id.as_str(), c.score)).collect();
        assert_eq!(scores["y"], 1.75);
        assert_eq!(scores["z"], 1.25);
        assert_eq!(scores["new"], 0.5);
        assert_eq!(res.item_effects["y"].boost_delta, 0.75);
        assert_eq!(res.reason_tags["y"].len(), 2);
        // Injected item lands after the original pool.
        assert_eq!(res.candidates.last().map(|c| c.item_id.as_str()), Some("new"));
    }

    #[test]
    fn test_brand_and_category_targets() {
        let mut brand = rule(RuleAction::Block, RuleTarget::Brand, &[], 1);
        brand.target_key = Some("acme".into());
        let mut cat = rule(RuleAction::Block, RuleTarget::Category, &[], 1);
        cat.target_key = Some("Shoes".into());
        let res = run(&[brand], &pool(&[("x", 1.0), ("y", 1.0), ("z", 1.0)]));
        assert!(res.is_blocked("x") && !res.is_blocked("y"));
        let res = run(&[cat], &pool(&[("x", 1.0), ("y", 1.0), ("z", 1.0)]));
        let left: Vec<_> = res.candidates.iter().map(|c| c.item_id.as_str()).collect();
        assert_eq!(left, vec!["y"]);
    }

    #[test]
    fn test_inactive_rules_skipped() {
        let mut expired = rule(RuleAction::Block, RuleTarget::Item, &["x"], 1);
        expired.valid_until = Some(Utc::now() - Duration::minutes(1));
        let mut other_segment = rule(RuleAction::Block, RuleTarget::Item, &["y"], 1);
        other_segment.segment_id = Some("vip".into());
        let res = run(&[expired, other_segment], &pool(&[("x", 1.0), ("y", 1.0)]));
        assert_eq!(res.candidates.len(), 2);
        assert!(res.evaluated_rule_ids.is_empty());
    }

    #[test]
    fn test_prefix_matchers() {
        let m = prefix_matchers(&["Brand".into(), "brand:".into(), " ".into()]);
        assert_eq!(m, vec!["brand:".to_string()]);
        assert_eq!(structured_value("brand:acme", &m), Some("acme"));
        assert_eq!(structured_value("brand:", &m), None);
    }
}
