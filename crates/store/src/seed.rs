use crate::memory::MemoryStore;
use chrono::{Duration, Utc};
use recsys_core::recommendation::TuningOverrides;
use recsys_core::types::{Event, Item, PolicyConfig, Segment, SegmentProfile, SegmentRule, User};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

const BRANDS: [&str; 4] = ["acme", "globex", "initech", "umbrella"];
const CATEGORIES: [&str; 3] = ["shoes", "outerwear", "accessories"];

impl MemoryStore {
    /// Populate a small demo catalog with users, events, segments and
    /// bandit policies.
    pub fn seed_demo(&self, tenant_id: Uuid, ns: &str) {
        self.add_tenant(tenant_id);

        let items: Vec<Item> = (0..40)
            .map(|i| {
                let brand = BRANDS[i % BRANDS.len()];
                let category = CATEGORIES[i % CATEGORIES.len()];
                Item {
                    item_id: format!("item_{i:03}"),
                    tags: vec![
                        format!("brand:{brand}"),
                        format!("category:{category}"),
                        if i % 2 == 0 { "sale".to_string() } else { "new".to_string() },
                    ],
                    props: json!({ "popularity_hint": 1.0 / (i as f64 + 1.0) }),
                    available: true,
                }
            })
            .collect();
        self.upsert_items(tenant_id, ns, items);

        let now = Utc::now();
        let kinds = ["view", "view", "click", "add_to_cart", "purchase"];
        let mut events = Vec::new();
        for u in 0..12 {
            let user_id = format!("user_{u:02}");
            self.upsert_user(
                tenant_id,
                ns,
                User {
                    user_id: user_id.clone(),
                    traits: json!({ "tier": if u % 4 == 0 { "vip" } else { "standard" }, "age": 20 + u }),
                    created_at: now - Duration::days(90 - u as i64),
                },
            );
            for e in 0..(u * 2) {
                let item = (u * 7 + e * 3) % 40;
                events.push(Event {
                    user_id: user_id.clone(),
                    item_id: format!("item_{item:03}"),
                    event_type: kinds[(u + e) % kinds.len()].to_string(),
                    ts: now - Duration::hours((e * 11 + u) as i64),
                });
            }
        }
        let event_count = events.len();
        self.record_events(tenant_id, ns, events);

        self.put_segments(
            tenant_id,
            ns,
            vec![
                Segment {
                    segment_id: "vip".into(),
                    name: "VIP shoppers".into(),
                    priority: 10,
                    active: true,
                    profile_id: "vip-high-novelty".into(),
                    rules: vec![SegmentRule {
                        rule_id: "vip-tier".into(),
                        enabled: true,
                        expr: json!({ "eq": ["user.traits.tier", "vip"] }),
                        description: None,
                    }],
                },
                Segment {
                    segment_id: "default".into(),
                    name: "Everyone".into(),
                    priority: 0,
                    active: true,
                    profile_id: "baseline".into(),
                    rules: vec![],
                },
            ],
        );
        self.put_segment_profile(
            tenant_id,
            ns,
            SegmentProfile {
                profile_id: "vip-high-novelty".into(),
                description: "More diversity for VIPs".into(),
                overrides: TuningOverrides {
                    mmr_lambda: Some(0.5),
                    brand_cap: Some(2),
                    ..Default::default()
                },
            },
        );
        self.put_segment_profile(
            tenant_id,
            ns,
            SegmentProfile {
                profile_id: "baseline".into(),
                description: String::new(),
                overrides: TuningOverrides::default(),
            },
        );

        let policies = vec![
            PolicyConfig {
                policy_id: "popular".into(),
                name: "Popularity heavy".into(),
                active: true,
                knobs: TuningOverrides {
                    blend_alpha: Some(1.0),
                    blend_beta: Some(0.0),
                    blend_gamma: Some(0.0),
                    ..Default::default()
                },
                notes: String::new(),
            },
            PolicyConfig {
                policy_id: "diverse".into(),
                name: "Diverse blend".into(),
                active: true,
                knobs: TuningOverrides {
                    blend_alpha: Some(0.5),
                    blend_beta: Some(0.3),
                    blend_gamma: Some(0.2),
                    mmr_lambda: Some(0.4),
                    brand_cap: Some(2),
                    ..Default::default()
                },
                notes: String::new(),
            },
        ];
        self.policies.insert((tenant_id, ns.to_string()), policies);

        info!(tenant = %tenant_id, ns, items = 40, events = event_count, "Seeded demo data");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use recsys_core::store::{AdminStore, BanditStore, CatalogStore, SegmentStore};

    #[tokio::test]
    async fn test_seed_demo() {
        let store = MemoryStore::new();
        let t = Uuid::new_v4();
        store.seed_demo(t, "default");
        assert!(store.resolve_tenant(t).await.is_ok());
        assert_eq!(store.list_items(t, "default", 500, 0).await.unwrap().len(), 40);
        assert_eq!(
            store.list_active_segments_with_rules(t, "default").await.unwrap().len(),
            2
        );
        assert_eq!(store.list_active_policies(t, "default").await.unwrap().len(), 2);
    }
}
