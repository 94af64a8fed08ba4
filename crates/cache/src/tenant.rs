//! Per-tenant caches for admin documents and ranking artifacts.

use crate::local::{CacheStats, TtlCache};
use recsys_core::types::{ItemScore, TenantDocument};
use recsys_core::RecsysResult;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

const MAX_TENANT_ENTRIES: usize = 100_000;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TenantKey {
    pub tenant_id: Uuid,
    pub surface: String,
    /// Distinguishes artifacts built from different inputs for the same
    /// surface. Empty for admin documents.
    pub scope: String,
}

impl TenantKey {
    pub fn new(tenant_id: Uuid, surface: &str) -> Self {
        Self::scoped(tenant_id, surface, "")
    }

    pub fn scoped(tenant_id: Uuid, surface: &str, scope: &str) -> Self {
        Self {
            tenant_id,
            surface: surface.trim().to_string(),
            scope: scope.to_string(),
        }
    }
}

/// Read-through cache keyed by (tenant, surface, scope).
pub struct TenantCache<V> {
    name: &'static str,
    inner: TtlCache<TenantKey, V>,
}

pub type ConfigCache = TenantCache<TenantDocument>;
pub type RulesCache = TenantCache<TenantDocument>;
/// Popularity pools keyed by (tenant, surface) and scoped by the inputs
/// they were built from.
pub type ArtifactCache = TenantCache<Arc<Vec<ItemScore>>>;

impl<V: Clone> TenantCache<V> {
    pub fn new(name: &'static str, ttl: Duration) -> Self {
        Self {
            name,
            inner: TtlCache::new(ttl, MAX_TENANT_ENTRIES),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn get(&self, tenant_id: Uuid, surface: &str) -> Option<V> {
        self.lookup(&TenantKey::new(tenant_id, surface))
    }

    pub fn get_scoped(&self, tenant_id: Uuid, surface: &str, scope: &str) -> Option<V> {
        self.lookup(&TenantKey::scoped(tenant_id, surface, scope))
    }

    fn lookup(&self, key: &TenantKey) -> Option<V> {
        let value = self.inner.get(key);
        if value.is_some() {
            metrics::counter!("recsys.cache.hit", "cache" => self.name).increment(1);
        } else {
            metrics::counter!("recsys.cache.miss", "cache" => self.name).increment(1);
        }
        value
    }

    pub fn put(&self, tenant_id: Uuid, surface: &str, value: V) {
        self.inner.put(TenantKey::new(tenant_id, surface), value);
    }

    /// Return the cached value or run `load` and cache its result. Errors
    /// are not cached.
    pub async fn get_or_load<F, Fut>(&self, tenant_id: Uuid, surface: &str, load: F) -> RecsysResult<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = RecsysResult<V>>,
    {
        self.get_or_load_scoped(tenant_id, surface, "", load).await
    }

    /// [`get_or_load`](Self::get_or_load) under an extra `scope` key.
    pub async fn get_or_load_scoped<F, Fut>(
        &self,
        tenant_id: Uuid,
        surface: &str,
        scope: &str,
        load: F,
    ) -> RecsysResult<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = RecsysResult<V>>,
    {
        let key = TenantKey::scoped(tenant_id, surface, scope);
        if let Some(v) = self.lookup(&key) {
            return Ok(v);
        }
        let value = load().await?;
        self.inner.put(key, value.clone());
        Ok(value)
    }

    /// Drop entries for `tenant_id` across every scope. An empty `surface`
    /// matches every surface of the tenant. Returns the number of entries
    /// removed.
    pub fn invalidate(&self, tenant_id: Uuid, surface: &str) -> usize {
        let surface = surface.trim();
        let removed = self.inner.invalidate(|k, _| {
            k.tenant_id == tenant_id && (surface.is_empty() || k.surface == surface)
        });
        debug!(cache = self.name, tenant = %tenant_id, surface, removed, "Cache invalidated");
        removed
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use recsys_core::RecsysError;

    #[tokio::test]
    async fn test_get_or_load_caches() {
        let cache: TenantCache<u32> = TenantCache::new("test", Duration::from_secs(60));
        let t = Uuid::new_v4();
        let v = cache.get_or_load(t, "home", || async { Ok(7) }).await.unwrap();
        assert_eq!(v, 7);
        let v = cache
            .get_or_load(t, "home", || async { Err(RecsysError::internal("not called")) })
            .await
            .unwrap();
        assert_eq!(v, 7);
    }

    #[tokio::test]
    async fn test_errors_not_cached() {
        let cache: TenantCache<u32> = TenantCache::new("test", Duration::from_secs(60));
        let t = Uuid::new_v4();
        assert!(cache
            .get_or_load(t, "", || async { Err(RecsysError::internal("boom")) })
            .await
            .is_err());
        assert!(cache.get(t, "").is_none());
    }

    #[tokio::test]
    async fn test_scopes_are_separate_entries() {
        let cache: TenantCache<u32> = TenantCache::new("test", Duration::from_secs(60));
        let t = Uuid::new_v4();
        let a = cache.get_or_load_scoped(t, "home", "hl=1", || async { Ok(1) }).await.unwrap();
        let b = cache.get_or_load_scoped(t, "home", "hl=2", || async { Ok(2) }).await.unwrap();
        assert_eq!((a, b), (1, 2));
        assert_eq!(cache.get_scoped(t, "home", "hl=1"), Some(1));
        assert!(cache.get(t, "home").is_none());
        assert_eq!(cache.invalidate(t, "home"), 2);
    }

    #[test]
    fn test_invalidate_scoped_to_surface() {
        let cache: TenantCache<u32> = TenantCache::new("test", Duration::from_secs(60));
        let t = Uuid::new_v4();
        let other = Uuid::new_v4();
        cache.put(t, "home", 1);
        cache.put(t, "pdp", 2);
        cache.put(other, "home", 3);

        assert_eq!(cache.invalidate(t, "home"), 1);
        assert!(cache.get(t, "pdp").is_some());
        assert_eq!(cache.invalidate(t, ""), 1);
        assert!(cache.get(other, "home").is_some());
    }
}
