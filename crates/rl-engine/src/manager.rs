//! Stateless bandit manager: reads arm stats from the store, picks a
//! policy, and writes decision and reward rows back.

use crate::bandits::{selector_for, Arm, ArmSelector};
use crate::holdout::{ExperimentHoldout, HoldoutGroup};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use recsys_core::config::HoldoutExperimentConfig;
use recsys_core::store::BanditStore;
use recsys_core::types::{
    Algorithm, ArmKey, BanditDecisionLog, BanditRewardLog, PolicyConfig,
};
use recsys_core::{Clock, RecsysError, RecsysResult, RequestCtx, SystemClock};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
pub struct DecideInput<'a> {
    pub surface: &'a str,
    pub bucket_key: &'a str,
    /// Restricts the eligible set. Empty means every active policy.
    pub candidate_policy_ids: &'a [String],
    /// Holdout settings for this call. Falls back to the manager's own.
    pub experiment: Option<&'a HoldoutExperimentConfig>,
    /// Seeds the draw so identical inputs pick identically.
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Decision {
    pub policy_id: String,
    pub algorithm: Algorithm,
    pub surface: String,
    pub bucket_key: String,
    pub explore: bool,
    pub explain: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experiment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    /// The chosen policy with its knobs.
    #[serde(skip)]
    pub policy: Option<PolicyConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RewardInput {
    #[serde(default)]
    pub policy_id: String,
    #[serde(default)]
    pub surface: String,
    #[serde(default)]
    pub bucket_key: String,
    #[serde(default)]
    pub reward: bool,
    #[serde(default)]
    pub algorithm: Option<Algorithm>,
}

pub struct BanditManager {
    store: Arc<dyn BanditStore>,
    selector: Box<dyn ArmSelector>,
    holdout: ExperimentHoldout,
    rng: Mutex<StdRng>,
    clock: Arc<dyn Clock>,
}

impl BanditManager {
    pub fn new(store: Arc<dyn BanditStore>, algorithm: Algorithm) -> Self {
        Self {
            store,
            selector: selector_for(algorithm),
            holdout: ExperimentHoldout::default(),
            rng: Mutex::new(StdRng::from_entropy()),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_experiment(mut self, config: HoldoutExperimentConfig) -> Self {
        self.holdout = ExperimentHoldout::new(config);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn algorithm(&self) -> Algorithm {
        self.selector.algorithm()
    }

    /// Choose a policy for (surface, bucket) and log the decision.
    pub async fn decide(
        &self,
        ctx: &RequestCtx,
        tenant: Uuid,
        ns: &str,
        input: &DecideInput<'_>,
    ) -> RecsysResult<Decision> {
        let surface = input.surface.trim().to_lowercase();
        if surface.is_empty() {
            return Err(RecsysError::invalid("surface is required"));
        }
        let bucket_key = input.bucket_key.trim();
        if bucket_key.is_empty() {
            return Err(RecsysError::invalid("bucket_key is required"));
        }

        let policies = if input.candidate_policy_ids.is_empty() {
            let all = ctx.run(self.store.list_active_policies(tenant, ns)).await?;
            all.into_iter().filter(|p| p.active).collect::<Vec<_>>()
        } else {
            ctx.run(
                self.store
                    .list_policies_by_ids(tenant, ns, input.candidate_policy_ids),
            )
            .await?
        };
        if policies.is_empty() {
            return Err(RecsysError::invalid("no eligible policies"));
        }

        let algorithm = self.selector.algorithm();
        let stats = ctx
            .run(
                self.store
                    .get_stats(tenant, ns, &surface, bucket_key, algorithm),
            )
            .await?;

        let holdout = match input.experiment {
            Some(cfg) => ExperimentHoldout::new(cfg.clone()),
            None => self.holdout.clone(),
        };
        let experiment_applies = holdout.applies(&surface);
        let group = experiment_applies.then(|| holdout.assign(bucket_key));

        let arms: Vec<Arm<'_>> = policies
            .iter()
            .map(|p| Arm {
                policy_id: p.policy_id.as_str(),
                stats: stats.get(&p.policy_id).copied().unwrap_or_default(),
            })
            .collect();
        let held_out = group == Some(HoldoutGroup::Holdout);
        let (index, explore, mut explain) = match input.seed {
            Some(seed) => {
                let mut rng = StdRng::seed_from_u64(seed ^ bucket_seed(bucket_key));
                self.choose(&arms, held_out, &mut rng)?
            }
            None => self.choose(&arms, held_out, &mut *self.rng.lock())?,
        };

        explain.insert("surface".to_string(), surface.clone());
        explain.insert("bucket".to_string(), bucket_key.to_string());

        let chosen = policies[index].clone();
        let (experiment, variant) = match group {
            Some(g) => {
                explain.insert(
                    "holdout_percent".to_string(),
                    holdout.holdout_percent().to_string(),
                );
                (Some(holdout.label().to_string()), Some(g.as_str().to_string()))
            }
            None => (None, None),
        };

        let decision = Decision {
            policy_id: chosen.policy_id.clone(),
            algorithm,
            surface: surface.clone(),
            bucket_key: bucket_key.to_string(),
            explore,
            explain,
            experiment,
            variant,
            policy: Some(chosen),
        };

        ctx.run(self.store.log_decision(BanditDecisionLog {
            tenant_id: tenant,
            namespace: ns.to_string(),
            surface,
            bucket_key: decision.bucket_key.clone(),
            algorithm,
            policy_id: decision.policy_id.clone(),
            explore: decision.explore,
            request_id: ctx.request_id.clone(),
            explain: decision.explain.clone(),
            experiment: decision.experiment.clone(),
            variant: decision.variant.clone(),
            ts: self.clock.now(),
        }))
        .await?;

        metrics::counter!(
            "recsys.bandit.decisions",
            "algorithm" => algorithm.as_str(),
            "explore" => if decision.explore { "true" } else { "false" }
        )
        .increment(1);
        debug!(
            tenant = %tenant,
            surface = %decision.surface,
            bucket = %decision.bucket_key,
            policy = %decision.policy_id,
            explore = decision.explore,
            "Bandit decision"
        );
        Ok(decision)
    }

    /// Holdout buckets get a uniformly random policy, flagged as exploration.
    fn choose(
        &self,
        arms: &[Arm<'_>],
        held_out: bool,
        rng: &mut dyn RngCore,
    ) -> RecsysResult<(usize, bool, HashMap<String, String>)> {
        if held_out {
            let index = rng.gen_range(0..arms.len());
            let explain = HashMap::from([("holdout".to_string(), "true".to_string())]);
            return Ok((index, true, explain));
        }
        let selection = self
            .selector
            .select(arms, rng)
            .ok_or_else(|| RecsysError::invalid("no eligible policies"))?;
        Ok((selection.index, selection.explore, selection.explain))
    }

    /// Add one trial (and a success when rewarded) to the arm. Returns
    /// false when the store already counted this request id.
    pub async fn reward(
        &self,
        ctx: &RequestCtx,
        tenant: Uuid,
        ns: &str,
        input: &RewardInput,
    ) -> RecsysResult<bool> {
        let surface = input.surface.trim().to_lowercase();
        let bucket_key = input.bucket_key.trim();
        let policy_id = input.policy_id.trim();
        if policy_id.is_empty() || surface.is_empty() || bucket_key.is_empty() {
            return Err(RecsysError::invalid("missing reward fields"));
        }
        let algorithm = input.algorithm.unwrap_or_else(|| self.selector.algorithm());

        let key = ArmKey {
            tenant_id: tenant,
            namespace: ns.to_string(),
            surface: surface.clone(),
            bucket_key: bucket_key.to_string(),
            algorithm,
            policy_id: policy_id.to_string(),
        };
        let applied = ctx
            .run(self.store.increment_stats(&key, input.reward, &ctx.request_id))
            .await?;
        if !applied {
            info!(tenant = %tenant, policy = %policy_id, "Duplicate reward ignored");
            return Ok(false);
        }

        ctx.run(self.store.log_reward(BanditRewardLog {
            tenant_id: tenant,
            namespace: ns.to_string(),
            surface,
            bucket_key: key.bucket_key.clone(),
            algorithm,
            policy_id: key.policy_id.clone(),
            reward: input.reward,
            request_id: ctx.request_id.clone(),
            ts: self.clock.now(),
        }))
        .await?;

        metrics::counter!(
            "recsys.bandit.rewards",
            "algorithm" => algorithm.as_str(),
            "reward" => if input.reward { "true" } else { "false" }
        )
        .increment(1);
        Ok(true)
    }
}

fn bucket_seed(bucket_key: &str) -> u64 {
    let digest = Sha256::digest(bucket_key.as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(head)
}

#[cfg(test)]
mod tests {
    use super::*;
    use recsys_core::recommendation::TuningOverrides;
    use recsys_store::{FailPoint, MemoryStore};

    fn policy(id: &str, active: bool) -> PolicyConfig {
        PolicyConfig {
            policy_id: id.into(),
            name: id.into(),
            active,
            knobs: TuningOverrides {
                mmr_lambda: Some(0.5),
                ..Default::default()
            },
            notes: String::new(),
        }
    }

    async fn setup(algorithm: Algorithm) -> (Arc<MemoryStore>, BanditManager, Uuid) {
        let store = Arc::new(MemoryStore::new());
        let tenant = Uuid::new_v4();
        store
            .upsert_policies(
                tenant,
                "default",
                &[policy("p1", true), policy("p2", true), policy("off", false)],
            )
            .await
            .unwrap();
        let mgr = BanditManager::new(store.clone(), algorithm);
        (store, mgr, tenant)
    }

    fn input<'a>(ids: &'a [String]) -> DecideInput<'a> {
        DecideInput {
            surface: "Home",
            bucket_key: "ctx:device=mobile",
            candidate_policy_ids: ids,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_decide_logs_and_skips_inactive() {
        let (store, mgr, tenant) = setup(Algorithm::Thompson).await;
        let ctx = RequestCtx::new("req-1", tenant);
        for _ in 0..20 {
            let d = mgr.decide(&ctx, tenant, "default", &input(&[])).await.unwrap();
            assert_ne!(d.policy_id, "off");
            assert_eq!(d.surface, "home");
            assert!(d.policy.is_some());
            assert!(d.experiment.is_none());
        }
        let log = store.decision_log();
        assert_eq!(log.len(), 20);
        assert_eq!(log[0].request_id, "req-1");
        assert_eq!(log[0].bucket_key, "ctx:device=mobile");
    }

    #[tokio::test]
    async fn test_no_eligible_policies() {
        let (_, mgr, tenant) = setup(Algorithm::Ucb1).await;
        let ctx = RequestCtx::background(tenant);
        let err = mgr
            .decide(&ctx, tenant, "other-ns", &input(&[]))
            .await
            .unwrap_err();
        assert_eq!(err.status(), 400);

        let ids = vec!["missing".to_string()];
        assert!(mgr.decide(&ctx, tenant, "default", &input(&ids)).await.is_err());
    }

    #[tokio::test]
    async fn test_ucb1_reads_its_own_rewards() {
        let (_, mgr, tenant) = setup(Algorithm::Ucb1).await;
        let ids = vec!["p1".to_string(), "p2".to_string()];

        let first = mgr
            .decide(&RequestCtx::new("r1", tenant), tenant, "default", &input(&ids))
            .await
            .unwrap();
        assert_eq!(first.policy_id, "p1");
        assert!(first.explore);

        let reward = RewardInput {
            policy_id: "p1".into(),
            surface: "home".into(),
            bucket_key: "ctx:device=mobile".into(),
            reward: true,
            algorithm: None,
        };
        assert!(mgr
            .reward(&RequestCtx::new("r1", tenant), tenant, "default", &reward)
            .await
            .unwrap());

        // p1 now has a trial, so the untried p2 goes next.
        let second = mgr
            .decide(&RequestCtx::new("r2", tenant), tenant, "default", &input(&ids))
            .await
            .unwrap();
        assert_eq!(second.policy_id, "p2");
    }

    #[tokio::test]
    async fn test_reward_counts_and_dedup() {
        let (store, mgr, tenant) = setup(Algorithm::Thompson).await;
        let reward = RewardInput {
            policy_id: "p1".into(),
            surface: "home".into(),
            bucket_key: "ctx:empty".into(),
            reward: true,
            algorithm: Some(Algorithm::Thompson),
        };
        for i in 0..5 {
            let ctx = RequestCtx::new(format!("req-{i}"), tenant);
            assert!(mgr.reward(&ctx, tenant, "default", &reward).await.unwrap());
        }
        let dup = RequestCtx::new("req-0", tenant);
        assert!(!mgr.reward(&dup, tenant, "default", &reward).await.unwrap());

        let stats = store
            .get_stats(tenant, "default", "home", "ctx:empty", Algorithm::Thompson)
            .await
            .unwrap();
        assert_eq!(stats["p1"].successes, 5);
        assert_eq!(stats["p1"].trials, 5);
        assert_eq!(store.reward_log().len(), 5);

        let ucb = store
            .get_stats(tenant, "default", "home", "ctx:empty", Algorithm::Ucb1)
            .await
            .unwrap();
        assert!(ucb.is_empty());
    }

    #[tokio::test]
    async fn test_reward_requires_fields() {
        let (_, mgr, tenant) = setup(Algorithm::Thompson).await;
        let err = mgr
            .reward(
                &RequestCtx::background(tenant),
                tenant,
                "default",
                &RewardInput {
                    policy_id: "p1".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("missing reward fields"));
    }

    #[tokio::test]
    async fn test_holdout_picks_random_and_marks_variant() {
        let (_, mgr, tenant) = setup(Algorithm::Thompson).await;
        let mgr = mgr.with_experiment(HoldoutExperimentConfig {
            enabled: true,
            label: "exp".into(),
            holdout_percent: 1.0,
            surfaces: vec![],
        });
        let d = mgr
            .decide(&RequestCtx::background(tenant), tenant, "default", &input(&[]))
            .await
            .unwrap();
        assert!(d.explore);
        assert_eq!(d.variant.as_deref(), Some("holdout"));
        assert_eq!(d.experiment.as_deref(), Some("exp"));
        assert_eq!(d.explain.get("holdout").map(String::as_str), Some("true"));

        let treatment = HoldoutExperimentConfig {
            enabled: true,
            label: "exp".into(),
            holdout_percent: 0.0,
            surfaces: vec!["home".into()],
        };
        let mut inp = input(&[]);
        inp.experiment = Some(&treatment);
        let d = mgr
            .decide(&RequestCtx::background(tenant), tenant, "default", &inp)
            .await
            .unwrap();
        assert_eq!(d.variant.as_deref(), Some("treatment"));
    }

    #[tokio::test]
    async fn test_seeded_decisions_repeat() {
        let (_, mgr, tenant) = setup(Algorithm::Thompson).await;
        let mut inp = input(&[]);
        inp.seed = Some(42);
        let ctx = RequestCtx::background(tenant);
        let first = mgr.decide(&ctx, tenant, "default", &inp).await.unwrap();
        for _ in 0..5 {
            let again = mgr.decide(&ctx, tenant, "default", &inp).await.unwrap();
            assert_eq!(again.policy_id, first.policy_id);
        }
    }

    #[tokio::test]
    async fn test_store_errors_surface() {
        let (store, mgr, tenant) = setup(Algorithm::Thompson).await;
        store.set_fail(FailPoint::Bandit, true);
        assert!(mgr
            .decide(&RequestCtx::background(tenant), tenant, "default", &input(&[]))
            .await
            .is_err());
    }
}
