//! Experiment holdout: a deterministic slice of buckets skips the bandit.

use recsys_core::config::HoldoutExperimentConfig;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const HOLDOUT_RESOLUTION: u64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HoldoutGroup {
    Treatment,
    Holdout,
}

impl HoldoutGroup {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Treatment => "treatment",
            Self::Holdout => "holdout",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExperimentHoldout {
    config: HoldoutExperimentConfig,
}

impl ExperimentHoldout {
    pub fn new(mut config: HoldoutExperimentConfig) -> Self {
        config.label = config.label.trim().to_string();
        if config.label.is_empty() {
            config.label = "bandit_holdout".to_string();
        }
        config.holdout_percent = config.holdout_percent.clamp(0.0, 1.0);
        config.surfaces = config
            .surfaces
            .iter()
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect();
        Self { config }
    }

    pub fn label(&self) -> &str {
        &self.config.label
    }

    pub fn holdout_percent(&self) -> f64 {
        self.config.holdout_percent
    }

    /// Enabled and either unscoped or listing `surface`.
    pub fn applies(&self, surface: &str) -> bool {
        if !self.config.enabled {
            return false;
        }
        let surface = surface.trim().to_lowercase();
        self.config.surfaces.is_empty() || self.config.surfaces.contains(&surface)
    }

    /// Group for `bucket_key`. Stable across calls and processes.
    pub fn assign(&self, bucket_key: &str) -> HoldoutGroup {
        let fraction = hash_fraction(&self.config.label, bucket_key);
        if fraction < self.config.holdout_percent {
            HoldoutGroup::Holdout
        } else {
            HoldoutGroup::Treatment
        }
    }
}

fn hash_fraction(label: &str, bucket_key: &str) -> f64 {
    let digest = Sha256::new()
        .chain_update(label.as_bytes())
        .chain_update(bucket_key.as_bytes())
        .finalize();
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(head) % HOLDOUT_RESOLUTION) as f64 / HOLDOUT_RESOLUTION as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn holdout(pct: f64, surfaces: &[&str]) -> ExperimentHoldout {
        ExperimentHoldout::new(HoldoutExperimentConfig {
            enabled: true,
            label: "exp1".into(),
            holdout_percent: pct,
            surfaces: surfaces.iter().map(|s| s.to_string()).collect(),
        })
    }

    #[test]
    fn test_surface_scoping() {
        assert!(holdout(0.1, &[]).applies("anything"));
        let h = holdout(0.1, &["Home"]);
        assert!(h.applies("home"));
        assert!(!h.applies("pdp"));
        assert!(!ExperimentHoldout::default().applies("home"));
    }

    #[test]
    fn test_assignment_is_stable_and_proportional() {
        let h = holdout(0.2, &[]);
        let mut held = 0;
        for i in 0..5000 {
            let key = format!("ctx:user={i}");
            let group = h.assign(&key);
            assert_eq!(group, h.assign(&key));
            if group == HoldoutGroup::Holdout {
                held += 1;
            }
        }
        let share = held as f64 / 5000.0;
        assert!((0.16..0.24).contains(&share), "holdout share {share}");
    }

    #[test]
    fn test_extremes() {
        assert_eq!(holdout(0.0, &[]).assign("ctx:empty"), HoldoutGroup::Treatment);
        assert_eq!(holdout(1.0, &[]).assign("ctx:empty"), HoldoutGroup::Holdout);
        assert_eq!(holdout(5.0, &[]).holdout_percent(), 1.0);
    }
}
