//! Catalog coverage tracking: which served items are long-tail.
//!
//! A per-namespace snapshot of the catalog is loaded lazily and refreshed
//! when its TTL lapses or a served item is missing from it. Concurrent
//! reloads of the same namespace collapse into one. A reload that started
//! before a reconfigure is served once but never cached.

use parking_lot::{Mutex, RwLock};
use recsys_core::{RecsysResult, RequestCtx, Store};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use uuid::Uuid;

const PAGE_SIZE: usize = 500;

#[derive(Debug)]
struct Snapshot {
    long_tail: HashMap<String, bool>,
    loaded_at: Instant,
}

#[derive(Debug, Clone, Copy)]
struct Settings {
    ttl: Duration,
    threshold: f64,
}

type Key = (Uuid, String);

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CoverageLookup {
    pub total_catalog: usize,
    /// Parallel to the looked-up ids.
    pub long_tail: Vec<bool>,
}

impl CoverageLookup {
    pub fn long_tail_count(&self) -> usize {
        self.long_tail.iter().filter(|b| **b).count()
    }
}

pub struct CoverageTracker {
    store: Arc<dyn Store>,
    settings: RwLock<Settings>,
    snapshots: RwLock<HashMap<Key, Arc<Snapshot>>>,
    loaders: Mutex<HashMap<Key, Arc<tokio::sync::Mutex<()>>>>,
    /// Bumped by every reconfigure.
    generation: AtomicU64,
}

impl CoverageTracker {
    pub fn new(store: Arc<dyn Store>, ttl: Duration, threshold: f64) -> Self {
        Self {
            store,
            settings: RwLock::new(Settings { ttl, threshold }),
            snapshots: RwLock::new(HashMap::new()),
            loaders: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// Apply new settings and drop every snapshot.
    pub fn reconfigure(&self, ttl: Duration, threshold: f64) {
        let mut snapshots = self.snapshots.write();
        *self.settings.write() = Settings { ttl, threshold };
        self.generation.fetch_add(1, Ordering::AcqRel);
        snapshots.clear();
        drop(snapshots);
        info!(ttl_secs = ttl.as_secs(), threshold, "Coverage tracker reconfigured");
    }

    fn fresh(&self, key: &Key, ids: &[String]) -> Option<Arc<Snapshot>> {
        let ttl = self.settings.read().ttl;
        let snap = self.snapshots.read().get(key).cloned()?;
        let expired = snap.loaded_at.elapsed() >= ttl;
        let missing = ids.iter().any(|id| !snap.long_tail.contains_key(id));
        (!expired && !missing).then_some(snap)
    }

    pub async fn lookup(
        &self,
        ctx: &RequestCtx,
        tenant: Uuid,
        ns: &str,
        ids: &[String],
    ) -> RecsysResult<CoverageLookup> {
        let key: Key = (tenant, ns.to_string());
        let snap = match self.fresh(&key, ids) {
            Some(snap) => snap,
            None => {
                let loader = self.loaders.lock().entry(key.clone()).or_default().clone();
                let _guard = loader.lock().await;
                match self.fresh(&key, ids) {
                    Some(snap) => snap,
                    None => {
                        let generation = self.generation.load(Ordering::Acquire);
                        let snap = Arc::new(self.load(ctx, tenant, ns).await?);
                        self.install(key, snap.clone(), generation);
                        snap
                    }
                }
            }
        };
        Ok(CoverageLookup {
            total_catalog: snap.long_tail.len(),
            long_tail: ids
                .iter()
                .map(|id| snap.long_tail.get(id).copied().unwrap_or(true))
                .collect(),
        })
    }

    /// Cache `snap` unless settings changed since its load began.
    fn install(&self, key: Key, snap: Arc<Snapshot>, generation: u64) -> bool {
        let mut snapshots = self.snapshots.write();
        if self.generation.load(Ordering::Acquire) != generation {
            debug!(tenant = %key.0, namespace = %key.1, "Discarding coverage snapshot from before reconfigure");
            return false;
        }
        snapshots.insert(key, snap);
        true
    }

    async fn load(&self, ctx: &RequestCtx, tenant: Uuid, ns: &str) -> RecsysResult<Snapshot> {
        let threshold = self.settings.read().threshold;
        let mut long_tail = HashMap::new();
        let mut offset = 0;
        loop {
            let page = ctx
                .run(self.store.list_items(tenant, ns, PAGE_SIZE, offset))
                .await?;
            let n = page.len();
            for item in page {
                let tail = item.popularity_hint().map_or(true, |h| h <= threshold);
                long_tail.insert(item.item_id, tail);
            }
            if n < PAGE_SIZE {
                break;
            }
            offset += n;
        }
        metrics::counter!("recsys.coverage.reloads").increment(1);
        debug!(%tenant, namespace = ns, items = long_tail.len(), "Coverage snapshot loaded");
        Ok(Snapshot {
            long_tail,
            loaded_at: Instant::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use recsys_core::types::Item;
    use recsys_store::MemoryStore;

    fn item(id: &str, hint: Option<f64>) -> Item {
        let mut item = Item::new(id, &[]);
        if let Some(h) = hint {
            item.props = serde_json::json!({ "popularity_hint": h });
        }
        item
    }

    fn setup() -> (Arc<MemoryStore>, CoverageTracker, Uuid) {
        let tenant = Uuid::from_u128(3);
        let store = Arc::new(MemoryStore::new());
        store.add_tenant(tenant);
        store.upsert_items(
            tenant,
            "default",
            vec![item("hot", Some(0.5)), item("tail", Some(0.001)), item("unknown", None)],
        );
        let tracker = CoverageTracker::new(store.clone(), Duration::from_secs(600), 0.01);
        (store, tracker, tenant)
    }

    #[tokio::test]
    async fn test_long_tail_flags() {
        let (_, tracker, tenant) = setup();
        let ctx = RequestCtx::background(tenant);
        let ids = vec!["hot".to_string(), "tail".to_string(), "unknown".to_string()];
        let out = tracker.lookup(&ctx, tenant, "default", &ids).await.unwrap();
        assert_eq!(out.total_catalog, 3);
        assert_eq!(out.long_tail, vec![false, true, true]);
        assert_eq!(out.long_tail_count(), 2);
    }

    #[tokio::test]
    async fn test_miss_triggers_reload() {
        let (store, tracker, tenant) = setup();
        let ctx = RequestCtx::background(tenant);
        tracker
            .lookup(&ctx, tenant, "default", &["hot".to_string()])
            .await
            .unwrap();
        store.upsert_items(tenant, "default", vec![item("new", Some(0.9))]);
        let out = tracker
            .lookup(&ctx, tenant, "default", &["new".to_string()])
            .await
            .unwrap();
        assert_eq!(out.total_catalog, 4);
        assert_eq!(out.long_tail, vec![false]);
    }

    #[tokio::test]
    async fn test_reconfigure_changes_threshold() {
        let (_, tracker, tenant) = setup();
        let ctx = RequestCtx::background(tenant);
        let ids = vec!["hot".to_string()];
        assert_eq!(tracker.lookup(&ctx, tenant, "default", &ids).await.unwrap().long_tail, vec![false]);
        tracker.reconfigure(Duration::from_secs(600), 0.9);
        assert_eq!(tracker.lookup(&ctx, tenant, "default", &ids).await.unwrap().long_tail, vec![true]);
    }

    #[tokio::test]
    async fn test_reload_racing_reconfigure_is_not_cached() {
        let (_, tracker, tenant) = setup();
        let ctx = RequestCtx::background(tenant);
        let key: Key = (tenant, "default".to_string());

        // A reload begins under the old threshold...
        let generation = tracker.generation.load(Ordering::Acquire);
        let stale = Arc::new(tracker.load(&ctx, tenant, "default").await.unwrap());
        assert_eq!(stale.long_tail.get("hot"), Some(&false));

        // ...and finishes after settings moved on.
        tracker.reconfigure(Duration::from_secs(600), 0.9);
        assert!(!tracker.install(key.clone(), stale, generation));
        assert!(tracker.snapshots.read().get(&key).is_none());

        let out = tracker
            .lookup(&ctx, tenant, "default", &["hot".to_string()])
            .await
            .unwrap();
        assert_eq!(out.long_tail, vec![true]);

        let current = tracker.generation.load(Ordering::Acquire);
        let fresh = Arc::new(tracker.load(&ctx, tenant, "default").await.unwrap());
        assert!(tracker.install(key, fresh, current));
    }
}
