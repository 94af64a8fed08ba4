//! Property tests for rule evaluation over arbitrary pools and rule sets.

#![allow(clippy::unwrap_used)]

use chrono::Utc;
use proptest::prelude::*;
use recsys_core::types::{ItemScore, Rule, RuleAction, RuleTarget};
use recsys_rules::{EvaluateRequest, RuleEvaluator};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

const MAX_PINS: usize = 3;

fn item_id() -> impl Strategy<Value = String> {
    (0u8..12).prop_map(|i| format!("i{i}"))
}

fn action() -> impl Strategy<Value = RuleAction> {
    prop_oneof![
        Just(RuleAction::Block),
        Just(RuleAction::Pin),
        Just(RuleAction::Boost)
    ]
}

fn rule() -> impl Strategy<Value = Rule> {
    (
        action(),
        prop::collection::vec(item_id(), 1..4),
        -5i32..5,
        -2.0f64..2.0,
    )
        .prop_map(|(action, items, priority, boost)| {
            let now = Utc::now();
            Rule {
                rule_id: Uuid::new_v4(),
                tenant_id: Uuid::nil(),
                namespace: "default".into(),
                surface: "home".into(),
                name: String::new(),
                description: String::new(),
                action,
                target_type: RuleTarget::Item,
                target_key: None,
                item_ids: items,
                boost_value: Some(boost),
                max_pins: None,
                segment_id: None,
                priority,
                enabled: true,
                valid_from: None,
                valid_until: None,
                created_at: now,
                updated_at: now,
            }
        })
}

fn pool() -> impl Strategy<Value = Vec<ItemScore>> {
    prop::collection::hash_map(item_id(), 0.0f64..10.0, 0..10)
        .prop_map(|m| m.into_iter().map(|(id, s)| ItemScore::new(id, s)).collect())
}

proptest! {
    #[test]
    fn blocked_items_never_survive(candidates in pool(), rules in prop::collection::vec(rule(), 0..8)) {
        let tags = HashMap::new();
        let res = RuleEvaluator::new(MAX_PINS, &[], &[]).apply(&rules, &EvaluateRequest {
            segment_id: "",
            now: Utc::now(),
            candidates: &candidates,
            item_tags: &tags,
        });

        let blocked = res.blocked_ids();
        for c in &res.candidates {
            prop_assert!(!blocked.contains(c.item_id.as_str()));
        }
        for p in &res.pinned {
            prop_assert!(!blocked.contains(p.item_id.as_str()));
        }
    }

    #[test]
    fn pins_are_bounded_and_disjoint(candidates in pool(), rules in prop::collection::vec(rule(), 0..8)) {
        let tags = HashMap::new();
        let res = RuleEvaluator::new(MAX_PINS, &[], &[]).apply(&rules, &EvaluateRequest {
            segment_id: "",
            now: Utc::now(),
            candidates: &candidates,
            item_tags: &tags,
        });

        prop_assert!(res.pinned.len() <= MAX_PINS);
        let pinned: HashSet<&str> = res.pinned.iter().map(|p| p.item_id.as_str()).collect();
        prop_assert_eq!(pinned.len(), res.pinned.len());
        for c in &res.candidates {
            prop_assert!(!pinned.contains(c.item_id.as_str()));
        }
    }

    #[test]
    fn pool_only_grows_by_boost_injection(candidates in pool(), rules in prop::collection::vec(rule(), 0..8)) {
        let tags = HashMap::new();
        let res = RuleEvaluator::new(MAX_PINS, &[], &[]).apply(&rules, &EvaluateRequest {
            segment_id: "",
            now: Utc::now(),
            candidates: &candidates,
            item_tags: &tags,
        });

        let original: HashSet<&str> = candidates.iter().map(|c| c.item_id.as_str()).collect();
        for c in &res.candidates {
            if !original.contains(c.item_id.as_str()) {
                let effect = res.item_effects.get(&c.item_id);
                prop_assert!(effect.is_some_and(|e| e.boost_delta != 0.0));
            }
        }
    }
}
