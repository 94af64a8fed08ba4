//! Shared handler state and its wiring from [`AppConfig`].

use crate::extract::parse_tenant;
use recsys_analytics::{DecisionRecorder, JsonlExposureLogger, RecorderOptions, StoreSink, TraceSampler};
use recsys_cache::{ArtifactCache, ConfigCache, RulesCache};
use recsys_core::config::AppConfig;
use recsys_core::types::Algorithm;
use recsys_core::{ConfigCell, Store};
use recsys_management::{AdminService, ManualOverrideService, RuleAdminService};
use recsys_personalization::{CoverageTracker, RecommendationEngine, RecommendationService, ServiceParts};
use recsys_rl_engine::{BanditManager, DeterministicAssigner};
use recsys_rules::{RulesManager, RulesManagerOptions};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub recommend: Arc<RecommendationService>,
    pub bandit: Arc<BanditManager>,
    pub admin: Arc<AdminService>,
    pub rules: Arc<RuleAdminService>,
    pub overrides: Arc<ManualOverrideService>,
    pub store: Arc<dyn Store>,
    pub config: Arc<ConfigCell>,
    pub namespace: String,
    pub default_tenant: Uuid,
    pub request_timeout: Duration,
    pub recorder: Option<Arc<DecisionRecorder>>,
    pub exposure: Option<Arc<JsonlExposureLogger>>,
    pub start_time: Instant,
}

impl AppState {
    /// Wire every service over `store`. Must run inside a Tokio runtime
    /// when audit or exposure logging is enabled.
    pub async fn build<S: Store + 'static>(cfg: &AppConfig, store: Arc<S>) -> anyhow::Result<Self> {
        cfg.recommendation.validate()?;
        let namespace = cfg.default_namespace.clone();
        let dyn_store: Arc<dyn Store> = store.clone();
        let config = Arc::new(ConfigCell::new(cfg.recommendation.clone(), "startup"));

        let rules = Arc::new(RulesManager::new(
            store.clone(),
            RulesManagerOptions {
                enabled: cfg.rules.enabled,
                refresh_interval: Duration::from_millis(cfg.rules.refresh_interval_ms),
                max_pin_slots: cfg.rules.max_pin_slots,
            },
        ));
        let config_cache = Arc::new(ConfigCache::new(
            "tenant_config",
            Duration::from_secs(cfg.cache.config_ttl_secs),
        ));
        let rules_cache = Arc::new(RulesCache::new(
            "tenant_rules",
            Duration::from_secs(cfg.cache.rules_ttl_secs),
        ));
        let popularity_cache = Arc::new(ArtifactCache::new(
            "popularity",
            Duration::from_secs(cfg.cache.popularity_ttl_secs),
        ));

        let mut engine = RecommendationEngine::new(dyn_store.clone(), rules.clone());
        if cfg.cache.popularity_ttl_secs > 0 {
            engine = engine.with_popularity_cache(popularity_cache.clone());
        }

        let algorithm: Algorithm = cfg.bandit.algorithm.parse()?;
        let bandit = Arc::new(
            BanditManager::new(store.clone(), algorithm).with_experiment(cfg.bandit.experiment.clone()),
        );
        let coverage = Arc::new(CoverageTracker::new(
            dyn_store.clone(),
            Duration::from_secs(cfg.recommendation.coverage_cache_ttl_secs),
            cfg.recommendation.coverage_long_tail_hint_threshold,
        ));

        let mut service = RecommendationService::new(ServiceParts {
            store: dyn_store.clone(),
            config: config.clone(),
            engine: Arc::new(engine),
            bandit: bandit.clone(),
            coverage,
            config_cache: config_cache.clone(),
            rules_cache: rules_cache.clone(),
            namespace: namespace.clone(),
        });
        if cfg.experiment.enabled {
            service = service.with_assigner(Arc::new(DeterministicAssigner::new(
                cfg.experiment.default_variants.clone(),
                cfg.experiment.salt.clone(),
            )));
        }
        let recorder = if cfg.audit.enabled {
            let recorder = DecisionRecorder::start(
                Arc::new(StoreSink::new(store.clone())),
                RecorderOptions::from(&cfg.audit),
            );
            service = service.with_recorder(
                recorder.clone(),
                TraceSampler::from_config(&cfg.audit),
                cfg.audit.salt.clone(),
            );
            Some(recorder)
        } else {
            None
        };
        let exposure = if cfg.exposure.enabled {
            let logger = Arc::new(JsonlExposureLogger::open(&cfg.exposure.path).await?);
            info!(path = %cfg.exposure.path, "Exposure logging enabled");
            service = service.with_exposure(logger.clone(), cfg.exposure.hash_salt.clone());
            Some(logger)
        } else {
            None
        };

        let admin = AdminService::new(
            dyn_store.clone(),
            config_cache,
            rules_cache,
            popularity_cache,
            rules.clone(),
            namespace.clone(),
        );
        let rule_admin = RuleAdminService::new(dyn_store.clone(), rules.clone(), config.clone(), namespace.clone());
        let overrides = ManualOverrideService::new(dyn_store.clone(), rules, namespace.clone());

        Ok(Self {
            recommend: Arc::new(service),
            bandit,
            admin: Arc::new(admin),
            rules: Arc::new(rule_admin),
            overrides: Arc::new(overrides),
            store: dyn_store,
            config,
            namespace,
            default_tenant: parse_tenant(&cfg.default_tenant),
            request_timeout: Duration::from_millis(cfg.api.request_timeout_ms.max(1)),
            recorder,
            exposure,
            start_time: Instant::now(),
        })
    }
}
