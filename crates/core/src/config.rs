use crate::recommendation::RecommendationConfig;
use serde::Deserialize;
use std::collections::HashMap;

/// Root application configuration. Loaded from environment variables
/// with the prefix `RECSYS__`, e.g. `RECSYS__API__HTTP_PORT=8080`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_namespace")]
    pub default_namespace: String,
    /// Tenant used when a request carries no `x-tenant-id` header.
    #[serde(default = "default_tenant")]
    pub default_tenant: String,
    #[serde(default)]
    pub seed_demo: bool,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub bandit: BanditConfig,
    #[serde(default)]
    pub rules: RulesConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub experiment: ExperimentConfig,
    #[serde(default)]
    pub exposure: ExposureConfig,
    #[serde(default)]
    pub recommendation: RecommendationConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default functions
fn default_namespace() -> String {
    "default".to_string()
}
fn default_tenant() -> String {
    "demo".to_string()
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_http_port() -> u16 {
    8080
}
fn default_request_timeout_ms() -> u64 {
    2000
}
fn default_max_body_bytes() -> usize {
    1 << 20
}
fn default_metrics_port() -> u16 {
    9091
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            http_port: default_http_port(),
            request_timeout_ms: default_request_timeout_ms(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            port: default_metrics_port(),
        }
    }
}

// ─── Audit Config ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct AuditConfig {
    #[serde(default = "default_audit_enabled")]
    pub enabled: bool,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
    #[serde(default = "default_audit_salt")]
    pub salt: String,
    #[serde(default = "default_sample_rate")]
    pub sample_default_rate: f64,
    /// Per-namespace sampling overrides, e.g. `{"default": 0.1}`.
    #[serde(default)]
    pub namespace_rates: HashMap<String, f64>,
}

fn default_audit_enabled() -> bool { true }
fn default_queue_capacity() -> usize { 1024 }
fn default_drain_timeout_ms() -> u64 { 2000 }
fn default_audit_salt() -> String { "recsys-audit".to_string() }
fn default_sample_rate() -> f64 { 1.0 }

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: default_audit_enabled(),
            queue_capacity: default_queue_capacity(),
            drain_timeout_ms: default_drain_timeout_ms(),
            salt: default_audit_salt(),
            sample_default_rate: default_sample_rate(),
            namespace_rates: HashMap::new(),
        }
    }
}

// ─── Bandit Config ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct BanditConfig {
    #[serde(default = "default_algorithm")]
    pub algorithm: String,
    #[serde(default)]
    pub experiment: HoldoutExperimentConfig,
}

#[derive(Debug, Clone, Default, Deserialize, serde::Serialize, PartialEq)]
pub struct HoldoutExperimentConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub label: String,
    /// Fraction in [0, 1] of buckets diverted to the holdout arm.
    #[serde(default)]
    pub holdout_percent: f64,
    /// Surfaces the holdout applies to. Empty means all surfaces.
    #[serde(default)]
    pub surfaces: Vec<String>,
}

fn default_algorithm() -> String { "thompson".to_string() }

impl Default for BanditConfig {
    fn default() -> Self {
        Self {
            algorithm: default_algorithm(),
            experiment: HoldoutExperimentConfig::default(),
        }
    }
}

// ─── Rules / Cache Config ───────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct RulesConfig {
    #[serde(default = "default_rules_enabled")]
    pub enabled: bool,
    #[serde(default = "default_refresh_interval_ms")]
    pub refresh_interval_ms: u64,
    #[serde(default = "default_max_pin_slots")]
    pub max_pin_slots: usize,
}

fn default_rules_enabled() -> bool { true }
fn default_refresh_interval_ms() -> u64 { 2000 }
fn default_max_pin_slots() -> usize { 3 }

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            enabled: default_rules_enabled(),
            refresh_interval_ms: default_refresh_interval_ms(),
            max_pin_slots: default_max_pin_slots(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_config_ttl_secs")]
    pub config_ttl_secs: u64,
    #[serde(default = "default_rules_ttl_secs")]
    pub rules_ttl_secs: u64,
    /// Zero disables popularity list sharing.
    #[serde(default = "default_popularity_ttl_secs")]
    pub popularity_ttl_secs: u64,
}

fn default_config_ttl_secs() -> u64 { 30 }
fn default_rules_ttl_secs() -> u64 { 30 }
fn default_popularity_ttl_secs() -> u64 { 15 }

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            config_ttl_secs: default_config_ttl_secs(),
            rules_ttl_secs: default_rules_ttl_secs(),
            popularity_ttl_secs: default_popularity_ttl_secs(),
        }
    }
}

// ─── Experiment / Exposure Config ───────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct ExperimentConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_experiment_salt")]
    pub salt: String,
    #[serde(default)]
    pub default_variants: Vec<String>,
}

fn default_experiment_salt() -> String { "recsys-experiment".to_string() }

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            salt: default_experiment_salt(),
            default_variants: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExposureConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_exposure_path")]
    pub path: String,
    #[serde(default = "default_exposure_salt")]
    pub hash_salt: String,
}

fn default_exposure_path() -> String { "/tmp/recsys/exposure.jsonl".to_string() }
fn default_exposure_salt() -> String { "recsys-exposure".to_string() }

impl Default for ExposureConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: default_exposure_path(),
            hash_salt: default_exposure_salt(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            default_namespace: default_namespace(),
            default_tenant: default_tenant(),
            seed_demo: false,
            api: ApiConfig::default(),
            metrics: MetricsConfig::default(),
            audit: AuditConfig::default(),
            bandit: BanditConfig::default(),
            rules: RulesConfig::default(),
            cache: CacheConfig::default(),
            experiment: ExperimentConfig::default(),
            exposure: ExposureConfig::default(),
            recommendation: RecommendationConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder().add_source(
            config::Environment::with_prefix("RECSYS")
                .separator("__")
                .try_parsing(true)
                .list_separator(","),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.api.http_port, 8080);
        assert_eq!(cfg.audit.queue_capacity, 1024);
        assert_eq!(cfg.rules.max_pin_slots, 3);
        assert_eq!(cfg.default_namespace, "default");
        assert_eq!(cfg.recommendation.max_k, 200);
    }

    #[test]
    fn test_partial_deserialize_fills_defaults() {
        let cfg: AppConfig =
            serde_json::from_str(r#"{"api": {"http_port": 9000}, "seed_demo": true}"#).unwrap();
        assert_eq!(cfg.api.http_port, 9000);
        assert_eq!(cfg.api.host, "0.0.0.0");
        assert!(cfg.seed_demo);
        assert_eq!(cfg.bandit.algorithm, "thompson");
    }
}
