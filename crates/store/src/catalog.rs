use crate::memory::{FailPoint, MemoryStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use recsys_core::store::{CatalogStore, EventTypeProvider, PopQuery, SegmentStore};
use recsys_core::types::{
    default_event_types, EventTypeWeight, Item, ItemScore, ProfileTag, Segment, SegmentProfile,
    User,
};
use recsys_core::RecsysResult;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

fn sort_scores(scores: HashMap<String, f64>, limit: usize) -> Vec<ItemScore> {
    let mut out: Vec<ItemScore> = scores
        .into_iter()
        .filter(|(_, s)| *s > 0.0)
        .map(|(item_id, score)| ItemScore { item_id, score })
        .collect();
    out.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.item_id.cmp(&b.item_id))
    });
    out.truncate(limit);
    out
}

fn age_days(now: DateTime<Utc>, ts: DateTime<Utc>) -> f64 {
    ((now - ts).num_milliseconds() as f64 / 86_400_000.0).max(0.0)
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let inter = a.intersection(b).count() as f64;
    let union = a.union(b).count() as f64;
    inter / union
}

#[async_trait]
impl EventTypeProvider for MemoryStore {
    async fn event_types(&self, tenant: Uuid) -> RecsysResult<HashMap<String, EventTypeWeight>> {
        let mut types = default_event_types();
        if let Some(overlay) = self.event_types.get(&tenant) {
            for (code, w) in overlay.iter() {
                types.insert(code.clone(), *w);
            }
        }
        Ok(types)
    }
}

#[async_trait]
impl CatalogStore for MemoryStore {
    async fn list_pop_items(
        &self,
        tenant: Uuid,
        ns: &str,
        q: &PopQuery,
    ) -> RecsysResult<Vec<ItemScore>> {
        self.check(FailPoint::Popularity)?;
        let Some(catalog) = self.catalogs.get(&(tenant, ns.to_string())) else {
            return Ok(Vec::new());
        };
        let catalog = catalog.read();
        let half_life = if q.half_life_days > 0.0 { q.half_life_days } else { 14.0 };
        let mut scores: HashMap<String, f64> = HashMap::new();
        for ev in &catalog.events {
            let Some(w) = q.event_types.get(&ev.event_type) else {
                continue;
            };
            if !w.active || w.weight <= 0.0 {
                continue;
            }
            if !catalog.items.get(&ev.item_id).is_some_and(|i| i.available) {
                continue;
            }
            let decay = 2f64.powf(-age_days(q.now, ev.ts) / half_life);
            *scores.entry(ev.item_id.clone()).or_default() += w.weight * decay;
        }
        Ok(sort_scores(scores, q.limit))
    }

    async fn list_co_vis(
        &self,
        tenant: Uuid,
        ns: &str,
        anchor: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> RecsysResult<Vec<ItemScore>> {
        self.check(FailPoint::CoVis)?;
        let Some(catalog) = self.catalogs.get(&(tenant, ns.to_string())) else {
            return Ok(Vec::new());
        };
        let catalog = catalog.read();
        let recent: Vec<_> = catalog.events.iter().filter(|e| e.ts >= since).collect();
        let users: HashSet<&str> = recent
            .iter()
            .filter(|e| e.item_id == anchor)
            .map(|e| e.user_id.as_str())
            .collect();
        let mut scores: HashMap<String, f64> = HashMap::new();
        for ev in recent {
            if ev.item_id == anchor || !users.contains(ev.user_id.as_str()) {
                continue;
            }
            *scores.entry(ev.item_id.clone()).or_default() += 1.0;
        }
        Ok(sort_scores(scores, limit))
    }

    async fn list_similar(
        &self,
        tenant: Uuid,
        ns: &str,
        anchor: &str,
        limit: usize,
    ) -> RecsysResult<Vec<ItemScore>> {
        self.check(FailPoint::Similar)?;
        let tags = self.item_tag_sets(tenant, ns);
        let Some(anchor_tags) = tags.get(anchor) else {
            return Ok(Vec::new());
        };
        let scores = tags
            .iter()
            .filter(|(id, _)| id.as_str() != anchor)
            .map(|(id, t)| (id.clone(), jaccard(anchor_tags, t)))
            .collect();
        Ok(sort_scores(scores, limit))
    }

    async fn get_user_profile(
        &self,
        tenant: Uuid,
        ns: &str,
        user: &str,
        since: DateTime<Utc>,
        top_n: usize,
    ) -> RecsysResult<Vec<ProfileTag>> {
        self.check(FailPoint::Profile)?;
        let types = self.event_types(tenant).await?;
        let Some(catalog) = self.catalogs.get(&(tenant, ns.to_string())) else {
            return Ok(Vec::new());
        };
        let catalog = catalog.read();
        let mut weights: HashMap<String, f64> = HashMap::new();
        for ev in catalog.events.iter().filter(|e| e.user_id == user && e.ts >= since) {
            let w = types.get(&ev.event_type).filter(|t| t.active).map_or(1.0, |t| t.weight);
            if let Some(item) = catalog.items.get(&ev.item_id) {
                for tag in &item.tags {
                    *weights.entry(tag.to_lowercase()).or_default() += w;
                }
            }
        }
        let mut tags: Vec<ProfileTag> = weights
            .into_iter()
            .map(|(tag, weight)| ProfileTag { tag, weight })
            .collect();
        tags.sort_by(|a, b| b.weight.total_cmp(&a.weight).then_with(|| a.tag.cmp(&b.tag)));
        tags.truncate(top_n);
        Ok(tags)
    }

    async fn list_items_tags(
        &self,
        tenant: Uuid,
        ns: &str,
        ids: &[String],
    ) -> RecsysResult<HashMap<String, Vec<String>>> {
        self.check(FailPoint::Tags)?;
        let Some(catalog) = self.catalogs.get(&(tenant, ns.to_string())) else {
            return Ok(HashMap::new());
        };
        let catalog = catalog.read();
        Ok(ids
            .iter()
            .filter_map(|id| catalog.items.get(id).map(|i| (id.clone(), i.tags.clone())))
            .collect())
    }

    async fn get_user(&self, tenant: Uuid, ns: &str, user: &str) -> RecsysResult<Option<User>> {
        Ok(self
            .catalogs
            .get(&(tenant, ns.to_string()))
            .and_then(|c| c.read().users.get(user).cloned()))
    }

    async fn list_items(
        &self,
        tenant: Uuid,
        ns: &str,
        limit: usize,
        offset: usize,
    ) -> RecsysResult<Vec<Item>> {
        Ok(self
            .catalogs
            .get(&(tenant, ns.to_string()))
            .map(|c| c.read().items.values().skip(offset).take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn list_user_recent_items(
        &self,
        tenant: Uuid,
        ns: &str,
        user: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> RecsysResult<Vec<String>> {
        let Some(catalog) = self.catalogs.get(&(tenant, ns.to_string())) else {
            return Ok(Vec::new());
        };
        let catalog = catalog.read();
        let mut events: Vec<_> = catalog
            .events
            .iter()
            .filter(|e| e.user_id == user && e.ts >= since)
            .collect();
        events.sort_by(|a, b| b.ts.cmp(&a.ts).then_with(|| a.item_id.cmp(&b.item_id)));
        let mut seen = HashSet::new();
        Ok(events
            .into_iter()
            .filter(|e| seen.insert(e.item_id.clone()))
            .take(limit)
            .map(|e| e.item_id.clone())
            .collect())
    }

    async fn list_user_event_items_since(
        &self,
        tenant: Uuid,
        ns: &str,
        user: &str,
        since: DateTime<Utc>,
        event_types: &[String],
    ) -> RecsysResult<Vec<String>> {
        let Some(catalog) = self.catalogs.get(&(tenant, ns.to_string())) else {
            return Ok(Vec::new());
        };
        let catalog = catalog.read();
        let mut seen = HashSet::new();
        Ok(catalog
            .events
            .iter()
            .filter(|e| e.user_id == user && e.ts >= since)
            .filter(|e| event_types.is_empty() || event_types.contains(&e.event_type))
            .filter(|e| seen.insert(e.item_id.clone()))
            .map(|e| e.item_id.clone())
            .collect())
    }

    async fn count_user_events(
        &self,
        tenant: Uuid,
        ns: &str,
        user: &str,
        since: DateTime<Utc>,
    ) -> RecsysResult<usize> {
        Ok(self
            .catalogs
            .get(&(tenant, ns.to_string()))
            .map(|c| {
                c.read()
                    .events
                    .iter()
                    .filter(|e| e.user_id == user && e.ts >= since)
                    .count()
            })
            .unwrap_or(0))
    }
}

#[async_trait]
impl SegmentStore for MemoryStore {
    async fn list_active_segments_with_rules(
        &self,
        tenant: Uuid,
        ns: &str,
    ) -> RecsysResult<Vec<Segment>> {
        self.check(FailPoint::Segments)?;
        Ok(self
            .segments
            .get(&(tenant, ns.to_string()))
            .map(|s| s.iter().filter(|seg| seg.active).cloned().collect())
            .unwrap_or_default())
    }

    async fn get_segment_profile(
        &self,
        tenant: Uuid,
        ns: &str,
        profile_id: &str,
    ) -> RecsysResult<Option<SegmentProfile>> {
        self.check(FailPoint::Segments)?;
        Ok(self
            .profiles
            .get(&(tenant, ns.to_string()))
            .and_then(|p| p.get(profile_id).cloned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use recsys_core::types::Event;

    fn ev(user: &str, item: &str, kind: &str, ts: DateTime<Utc>) -> Event {
        Event {
            user_id: user.into(),
            item_id: item.into(),
            event_type: kind.into(),
            ts,
        }
    }

    fn seeded() -> (MemoryStore, Uuid, DateTime<Utc>) {
        let store = MemoryStore::new();
        let t = Uuid::new_v4();
        let now = Utc::now();
        store.upsert_items(
            t,
            "default",
            vec![
                Item::new("a", &["brand:x", "shoes"]),
                Item::new("b", &["brand:x", "shoes", "running"]),
                Item::new("c", &["brand:y", "hats"]),
            ],
        );
        store.record_events(
            t,
            "default",
            vec![
                ev("u1", "a", "view", now - Duration::days(1)),
                ev("u1", "b", "purchase", now - Duration::days(1)),
                ev("u2", "a", "view", now - Duration::days(2)),
                ev("u2", "c", "view", now - Duration::days(60)),
            ],
        );
        (store, t, now)
    }

    #[tokio::test]
    async fn test_popularity_decays_and_weights() {
        let (store, t, now) = seeded();
        let q = PopQuery {
            half_life_days: 14.0,
            limit: 10,
            now,
            event_types: default_event_types(),
        };
        let pop = store.list_pop_items(t, "default", &q).await.unwrap();
        assert_eq!(pop[0].item_id, "b");
        assert_eq!(pop.last().unwrap().item_id, "c");
    }

    #[tokio::test]
    async fn test_co_vis_window() {
        let (store, t, now) = seeded();
        let co = store
            .list_co_vis(t, "default", "a", now - Duration::days(30), 10)
            .await
            .unwrap();
        let ids: Vec<_> = co.iter().map(|s| s.item_id.as_str()).collect();
        assert_eq!(ids, vec!["b"]);
    }

    #[tokio::test]
    async fn test_similar_by_tags() {
        let (store, t, _) = seeded();
        let sim = store.list_similar(t, "default", "a", 10).await.unwrap();
        assert_eq!(sim[0].item_id, "b");
        assert!(sim.iter().all(|s| s.item_id != "c"));
    }

    #[tokio::test]
    async fn test_fail_switch() {
        let (store, t, now) = seeded();
        store.set_fail(FailPoint::CoVis, true);
        assert!(store.list_co_vis(t, "default", "a", now, 10).await.is_err());
        store.set_fail(FailPoint::CoVis, false);
        assert!(store.list_co_vis(t, "default", "a", now, 10).await.is_ok());
    }

    #[tokio::test]
    async fn test_event_type_overlay() {
        let store = MemoryStore::new();
        let t = Uuid::new_v4();
        store.set_event_type(
            t,
            "view",
            EventTypeWeight {
                weight: 0.5,
                half_life_days: 7.0,
                active: true,
            },
        );
        let types = store.event_types(t).await.unwrap();
        assert_eq!(types["view"].weight, 0.5);
        assert_eq!(types["purchase"].weight, 5.0);
    }
}
