//! Property tests for diversification: caps, pins and length bounds hold
//! for arbitrary pools.

#![allow(clippy::unwrap_used)]

use proptest::prelude::*;
use recsys_core::types::ItemScore;
use recsys_personalization::mmr::{select, DiversityParams};
use std::collections::{BTreeMap, HashMap};

const BRANDS: [&str; 3] = ["acme", "globex", "initech"];
const CATEGORIES: [&str; 2] = ["shoes", "hats"];

fn pool() -> impl Strategy<Value = (Vec<ItemScore>, HashMap<String, Vec<String>>)> {
    prop::collection::vec((0usize..3, 0usize..2, 0.0f64..10.0), 0..25).prop_map(|rows| {
        let mut items = Vec::new();
        let mut tags = HashMap::new();
        for (i, (b, c, score)) in rows.into_iter().enumerate() {
            let id = format!("i{i:02}");
            tags.insert(
                id.clone(),
                vec![format!("brand:{}", BRANDS[b]), format!("category:{}", CATEGORIES[c])],
            );
            items.push(ItemScore::new(id, score));
        }
        (items, tags)
    })
}

fn count_prefix(ids: &[&str], tags: &HashMap<String, Vec<String>>, prefix: &str) -> HashMap<String, usize> {
    let mut counts = HashMap::new();
    for id in ids {
        for t in tags.get(*id).into_iter().flatten() {
            if t.starts_with(prefix) {
                *counts.entry(t.clone()).or_insert(0) += 1;
            }
        }
    }
    counts
}

proptest! {
    #[test]
    fn caps_and_length_hold(
        (items, tags) in pool(),
        k in 1usize..15,
        lambda in 0.0f64..=1.0,
        brand_cap in 0usize..4,
        category_cap in 0usize..4,
    ) {
        let brand = vec!["brand:".to_string()];
        let category = vec!["category:".to_string()];
        let no_tag_caps = BTreeMap::new();
        let params = DiversityParams {
            k,
            lambda,
            brand_cap,
            category_cap,
            brand_matchers: &brand,
            category_matchers: &category,
            max_per_tag: &no_tag_caps,
        };
        let out = select(&[], &items, &tags, &params);
        let ids: Vec<&str> = out.picks.iter().map(|p| p.item_id.as_str()).collect();

        prop_assert!(ids.len() <= k);
        prop_assert!(ids.len() <= items.len());
        if brand_cap > 0 {
            for n in count_prefix(&ids, &tags, "brand:").values() {
                prop_assert!(*n <= brand_cap);
            }
        }
        if category_cap > 0 {
            for n in count_prefix(&ids, &tags, "category:").values() {
                prop_assert!(*n <= category_cap);
            }
        }
        let mut unique = ids.clone();
        unique.sort();
        unique.dedup();
        prop_assert_eq!(unique.len(), ids.len());
    }

    #[test]
    fn pins_lead_in_order(
        (items, tags) in pool(),
        pin_count in 0usize..4,
        k in 1usize..10,
    ) {
        let pinned: Vec<ItemScore> = (0..pin_count)
            .map(|i| ItemScore::new(format!("pin{i}"), 0.0))
            .collect();
        let brand = vec!["brand:".to_string()];
        let no_tag_caps = BTreeMap::new();
        let params = DiversityParams {
            k,
            lambda: 0.7,
            brand_cap: 1,
            category_cap: 0,
            brand_matchers: &brand,
            category_matchers: &[],
            max_per_tag: &no_tag_caps,
        };
        let out = select(&pinned, &items, &tags, &params);
        let expected = pin_count.min(k);
        for (i, pick) in out.picks.iter().take(expected).enumerate() {
            prop_assert!(pick.pinned);
            prop_assert_eq!(&pick.item_id, &format!("pin{i}"));
        }
        prop_assert!(out.picks.iter().skip(expected).all(|p| !p.pinned));
        prop_assert!(out.picks.len() <= k);
    }

    #[test]
    fn selection_is_deterministic((items, tags) in pool(), k in 1usize..15) {
        let brand = vec!["brand:".to_string()];
        let no_tag_caps = BTreeMap::new();
        let params = DiversityParams {
            k,
            lambda: 0.5,
            brand_cap: 2,
            category_cap: 0,
            brand_matchers: &brand,
            category_matchers: &[],
            max_per_tag: &no_tag_caps,
        };
        let a = select(&[], &items, &tags, &params);
        let b = select(&[], &items, &tags, &params);
        let ids_a: Vec<_> = a.picks.iter().map(|p| &p.item_id).collect();
        let ids_b: Vec<_> = b.picks.iter().map(|p| &p.item_id).collect();
        prop_assert_eq!(ids_a, ids_b);
    }
}
