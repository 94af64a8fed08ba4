use crate::evaluate::EvaluateResult;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

const MAX_SAMPLE_IDS: usize = 20;

/// Reach of exclusions, constraints and rules over one request.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PolicySummary {
    pub total_candidates: usize,
    pub explicit_exclude_hits: usize,
    pub recent_event_exclude_hits: usize,
    pub after_exclusions: usize,
    pub constraint_filtered_count: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub constraint_filtered_ids: Vec<String>,
    pub after_constraint_filters: usize,
    pub rule_block_count: usize,
    pub rule_pin_count: usize,
    pub rule_boost_count: usize,
    pub rule_boost_injected: usize,
    pub rule_block_exposure: usize,
    pub rule_boost_exposure: usize,
    pub rule_pin_exposure: usize,
    pub after_rules: usize,
    pub final_count: usize,
    pub constraint_leak_count: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub constraint_leak_ids: Vec<String>,
}

impl PolicySummary {
    pub fn record_constraint_filtered(&mut self, ids: &[String]) {
        self.constraint_filtered_count += ids.len();
        for id in ids {
            if self.constraint_filtered_ids.len() >= MAX_SAMPLE_IDS {
                break;
            }
            self.constraint_filtered_ids.push(id.clone());
        }
    }

    /// Count rule effects. `pre_rule` holds the pool ids before evaluation
    /// so boost injections can be told apart.
    pub fn record_rules(&mut self, result: &EvaluateResult, pre_rule: &HashSet<String>) {
        self.rule_pin_count = result.pinned.len();
        self.rule_block_count = result.item_effects.values().filter(|e| e.blocked).count();
        self.rule_boost_count = result
            .item_effects
            .values()
            .filter(|e| e.boost_delta != 0.0)
            .count();
        self.rule_boost_injected = result
            .candidates
            .iter()
            .filter(|c| !pre_rule.contains(&c.item_id))
            .count();
        self.rule_block_exposure = self.rule_block_count;
        self.after_rules = result.candidates.len() + result.pinned.len();
    }

    /// Fill the served-side counters once the final list is known.
    /// `filtered` holds ids removed by constraints earlier in the pipeline.
    pub fn finalize(
        &mut self,
        final_ids: &[String],
        rules: Option<&EvaluateResult>,
        filtered: &HashSet<String>,
    ) {
        self.final_count = final_ids.len();
        let leaks: Vec<&String> = final_ids.iter().filter(|id| filtered.contains(*id)).collect();
        self.constraint_leak_count = leaks.len();
        self.constraint_leak_ids = leaks.into_iter().take(MAX_SAMPLE_IDS).cloned().collect();

        let Some(rules) = rules else {
            self.rule_boost_exposure = 0;
            self.rule_pin_exposure = 0;
            return;
        };
        let effects = final_ids.iter().filter_map(|id| rules.item_effects.get(id));
        let (mut boost, mut pin) = (0, 0);
        for effect in effects {
            if effect.boost_delta != 0.0 {
                boost += 1;
            }
            if effect.pinned {
                pin += 1;
            }
        }
        self.rule_boost_exposure = boost;
        self.rule_pin_exposure = pin;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluate::{ItemEffect, PinnedItem};
    use recsys_core::types::ItemScore;
    use std::collections::HashMap;

    #[test]
    fn test_exposure_and_leaks() {
        let mut effects = HashMap::new();
        effects.insert(
            "a".to_string(),
            ItemEffect {
                pinned: true,
                ..Default::default()
            },
        );
        effects.insert(
            "b".to_string(),
            ItemEffect {
                boost_delta: 0.5,
                ..Default::default()
            },
        );
        effects.insert(
            "c".to_string(),
            ItemEffect {
                blocked: true,
                ..Default::default()
            },
        );
        let result = EvaluateResult {
            candidates: vec![ItemScore::new("b", 1.5), ItemScore::new("n", 0.2)],
            pinned: vec![PinnedItem {
                item_id: "a".into(),
                score: 1.0,
                from_candidates: true,
                rules: vec![],
            }],
            item_effects: effects,
            ..Default::default()
        };
        let pre: HashSet<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();

        let mut summary = PolicySummary::default();
        summary.record_rules(&result, &pre);
        assert_eq!(summary.rule_pin_count, 1);
        assert_eq!(summary.rule_block_count, 1);
        assert_eq!(summary.rule_boost_injected, 1);
        assert_eq!(summary.after_rules, 3);

        let filtered: HashSet<String> = ["n".to_string()].into_iter().collect();
        let served = vec!["a".to_string(), "b".to_string(), "n".to_string()];
        summary.finalize(&served, Some(&result), &filtered);
        assert_eq!(summary.final_count, 3);
        assert_eq!(summary.rule_pin_exposure, 1);
        assert_eq!(summary.rule_boost_exposure, 1);
        assert_eq!(summary.constraint_leak_ids, vec!["n".to_string()]);
    }
}
