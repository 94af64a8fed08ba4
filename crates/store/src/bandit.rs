use crate::memory::{FailPoint, MemoryStore};
use async_trait::async_trait;
use recsys_core::store::BanditStore;
use recsys_core::types::{
    Algorithm, ArmKey, BanditDecisionLog, BanditRewardLog, BanditStats, PolicyConfig,
};
use recsys_core::RecsysResult;
use std::collections::HashMap;
use uuid::Uuid;

#[async_trait]
impl BanditStore for MemoryStore {
    async fn upsert_policies(
        &self,
        tenant: Uuid,
        ns: &str,
        policies: &[PolicyConfig],
    ) -> RecsysResult<()> {
        self.check(FailPoint::Bandit)?;
        let mut entry = self.policies.entry((tenant, ns.to_string())).or_default();
        for p in policies {
            match entry.iter_mut().find(|e| e.policy_id == p.policy_id) {
                Some(existing) => *existing = p.clone(),
                None => entry.push(p.clone()),
            }
        }
        Ok(())
    }

    async fn list_all_policies(&self, tenant: Uuid, ns: &str) -> RecsysResult<Vec<PolicyConfig>> {
        self.check(FailPoint::Bandit)?;
        Ok(self
            .policies
            .get(&(tenant, ns.to_string()))
            .map(|p| p.clone())
            .unwrap_or_default())
    }

    async fn list_active_policies(
        &self,
        tenant: Uuid,
        ns: &str,
    ) -> RecsysResult<Vec<PolicyConfig>> {
        Ok(self
            .list_all_policies(tenant, ns)
            .await?
            .into_iter()
            .filter(|p| p.active)
            .collect())
    }

    async fn list_policies_by_ids(
        &self,
        tenant: Uuid,
        ns: &str,
        ids: &[String],
    ) -> RecsysResult<Vec<PolicyConfig>> {
        let all = self.list_all_policies(tenant, ns).await?;
        Ok(ids
            .iter()
            .filter_map(|id| all.iter().find(|p| &p.policy_id == id).cloned())
            .collect())
    }

    async fn get_stats(
        &self,
        tenant: Uuid,
        ns: &str,
        surface: &str,
        bucket_key: &str,
        algorithm: Algorithm,
    ) -> RecsysResult<HashMap<String, BanditStats>> {
        self.check(FailPoint::Bandit)?;
        Ok(self
            .stats
            .iter()
            .filter(|e| {
                let k = e.key();
                k.tenant_id == tenant
                    && k.namespace == ns
                    && k.surface == surface
                    && k.bucket_key == bucket_key
                    && k.algorithm == algorithm
            })
            .map(|e| (e.key().policy_id.clone(), *e.value()))
            .collect())
    }

    async fn increment_stats(
        &self,
        key: &ArmKey,
        reward: bool,
        request_id: &str,
    ) -> RecsysResult<bool> {
        self.check(FailPoint::Bandit)?;
        if !request_id.is_empty()
            && self
                .rewarded
                .insert((key.clone(), request_id.to_string()), ())
                .is_some()
        {
            return Ok(false);
        }
        let mut stats = self.stats.entry(key.clone()).or_default();
        stats.trials += 1;
        if reward {
            stats.successes += 1;
        }
        Ok(true)
    }

    async fn log_decision(&self, row: BanditDecisionLog) -> RecsysResult<()> {
        self.decision_log.lock().push(row);
        Ok(())
    }

    async fn log_reward(&self, row: BanditRewardLog) -> RecsysResult<()> {
        self.reward_log.lock().push(row);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(t: Uuid) -> ArmKey {
        ArmKey {
            tenant_id: t,
            namespace: "default".into(),
            surface: "home".into(),
            bucket_key: "ctx:empty".into(),
            algorithm: Algorithm::Thompson,
            policy_id: "p1".into(),
        }
    }

    #[tokio::test]
    async fn test_increment_dedups_by_request_id() {
        let store = MemoryStore::new();
        let t = Uuid::new_v4();
        let k = key(t);
        assert!(store.increment_stats(&k, true, "r1").await.unwrap());
        assert!(!store.increment_stats(&k, true, "r1").await.unwrap());
        assert!(store.increment_stats(&k, false, "").await.unwrap());
        assert!(store.increment_stats(&k, false, "").await.unwrap());

        let stats = store
            .get_stats(t, "default", "home", "ctx:empty", Algorithm::Thompson)
            .await
            .unwrap();
        assert_eq!(stats["p1"], BanditStats { trials: 3, successes: 1 });

        let ucb = store
            .get_stats(t, "default", "home", "ctx:empty", Algorithm::Ucb1)
            .await
            .unwrap();
        assert!(ucb.is_empty());
    }

    #[tokio::test]
    async fn test_upsert_replaces_by_id() {
        let store = MemoryStore::new();
        let t = Uuid::new_v4();
        let p = |id: &str, active| PolicyConfig {
            policy_id: id.into(),
            name: id.into(),
            active,
            knobs: Default::default(),
            notes: String::new(),
        };
        store.upsert_policies(t, "default", &[p("a", true), p("b", true)]).await.unwrap();
        store.upsert_policies(t, "default", &[p("b", false)]).await.unwrap();
        assert_eq!(store.list_all_policies(t, "default").await.unwrap().len(), 2);
        let active = store.list_active_policies(t, "default").await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].policy_id, "a");
    }
}
