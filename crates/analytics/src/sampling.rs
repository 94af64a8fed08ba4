use recsys_core::config::AuditConfig;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

const SAMPLE_RESOLUTION: u64 = 1_000_000;

/// Decides which decisions get a trace. Rates are per namespace with a
/// default; the draw hashes the request id so retries agree.
#[derive(Debug, Clone)]
pub struct TraceSampler {
    enabled: bool,
    default_rate: f64,
    namespace_rates: HashMap<String, f64>,
}

impl TraceSampler {
    pub fn new(default_rate: f64, namespace_rates: HashMap<String, f64>) -> Self {
        Self {
            enabled: true,
            default_rate: default_rate.clamp(0.0, 1.0),
            namespace_rates: namespace_rates
                .into_iter()
                .map(|(ns, rate)| (ns, rate.clamp(0.0, 1.0)))
                .collect(),
        }
    }

    pub fn from_config(cfg: &AuditConfig) -> Self {
        let mut sampler = Self::new(cfg.sample_default_rate, cfg.namespace_rates.clone());
        sampler.enabled = cfg.enabled;
        sampler
    }

    pub fn rate(&self, namespace: &str) -> f64 {
        if !self.enabled {
            return 0.0;
        }
        self.namespace_rates
            .get(namespace)
            .copied()
            .unwrap_or(self.default_rate)
    }

    pub fn should_sample(&self, namespace: &str, request_id: &str) -> bool {
        let rate = self.rate(namespace);
        if rate >= 1.0 {
            return true;
        }
        if rate <= 0.0 {
            return false;
        }
        let digest = Sha256::digest(request_id.as_bytes());
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        let draw = (u64::from_be_bytes(head) % SAMPLE_RESOLUTION) as f64 / SAMPLE_RESOLUTION as f64;
        draw < rate
    }
}

impl Default for TraceSampler {
    fn default() -> Self {
        Self::new(1.0, HashMap::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_override_and_clamp() {
        let mut rates = HashMap::new();
        rates.insert("beta".to_string(), 2.0);
        let s = TraceSampler::new(0.5, rates);
        assert_eq!(s.rate("default"), 0.5);
        assert_eq!(s.rate("beta"), 1.0);
    }

    #[test]
    fn test_extremes_and_stability() {
        let all = TraceSampler::default();
        assert!(all.should_sample("default", "r1"));
        let none = TraceSampler::new(0.0, HashMap::new());
        assert!(!none.should_sample("default", "r1"));

        let half = TraceSampler::new(0.5, HashMap::new());
        let picked = (0..2000)
            .filter(|i| half.should_sample("default", &format!("req-{i}")))
            .count();
        assert!((800..1200).contains(&picked), "sampled {picked}");
        assert_eq!(half.should_sample("default", "x"), half.should_sample("default", "x"));
    }

    #[test]
    fn test_disabled_audit_samples_nothing() {
        let cfg = AuditConfig {
            enabled: false,
            ..Default::default()
        };
        assert!(!TraceSampler::from_config(&cfg).should_sample("default", "r"));
    }
}
