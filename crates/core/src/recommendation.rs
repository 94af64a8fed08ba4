//! Live-tunable ranking configuration.
//!
//! [`RecommendationConfig`] is the base set of knobs. Segment profiles and
//! bandit policies carry a sparse [`TuningOverrides`] that is layered on top
//! per request. The process-wide value lives in a [`ConfigCell`] so readers
//! never observe a half-applied update.

use crate::config::HoldoutExperimentConfig;
use crate::error::{RecsysError, RecsysResult};
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Longest accepted lookback or decay horizon, in days.
pub const MAX_WINDOW_DAYS: f64 = 3650.0;
pub const MAX_POPULARITY_FANOUT: usize = 10_000;

fn window_in_range(days: f64) -> bool {
    days > 0.0 && days <= MAX_WINDOW_DAYS
}

fn fanout_in_range(fanout: usize) -> bool {
    (1..=MAX_POPULARITY_FANOUT).contains(&fanout)
}

fn check_window(name: &str, days: f64) -> RecsysResult<()> {
    if window_in_range(days) {
        Ok(())
    } else {
        Err(RecsysError::invalid(format!(
            "{name} must be positive and at most {MAX_WINDOW_DAYS} days"
        )))
    }
}

fn check_fanout(fanout: usize) -> RecsysResult<()> {
    if fanout_in_range(fanout) {
        Ok(())
    } else {
        Err(RecsysError::invalid(format!(
            "popularity_fanout must be between 1 and {MAX_POPULARITY_FANOUT}"
        )))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BlendWeights {
    pub alpha: f64,
    pub beta: f64,
    pub gamma: f64,
}

impl BlendWeights {
    pub fn new(alpha: f64, beta: f64, gamma: f64) -> Self {
        Self { alpha, beta, gamma }
    }

    pub fn is_zero(&self) -> bool {
        self.alpha == 0.0 && self.beta == 0.0 && self.gamma == 0.0
    }

    /// Negative weights clamp to zero; an all-zero triplet falls back to
    /// pure popularity.
    pub fn sanitized(self) -> Self {
        let w = Self {
            alpha: self.alpha.max(0.0),
            beta: self.beta.max(0.0),
            gamma: self.gamma.max(0.0),
        };
        if w.is_zero() {
            Self::new(1.0, 0.0, 0.0)
        } else {
            w
        }
    }
}

impl Default for BlendWeights {
    fn default() -> Self {
        Self::new(1.0, 0.1, 0.1)
    }
}

/// Base ranking knobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RecommendationConfig {
    pub half_life_days: f64,
    pub co_vis_window_days: f64,
    pub popularity_fanout: usize,
    pub max_k: usize,
    pub mmr_lambda: f64,
    /// Per-surface MMR lambda presets, consulted when no segment or policy
    /// overrides lambda.
    pub mmr_presets: HashMap<String, f64>,
    /// 0 disables the cap.
    pub brand_cap: usize,
    pub category_cap: usize,
    pub brand_tag_prefixes: Vec<String>,
    pub category_tag_prefixes: Vec<String>,
    pub rule_exclude_events: bool,
    pub exclude_event_types: Vec<String>,
    pub purchased_window_days: f64,
    pub profile_window_days: f64,
    pub profile_boost: f64,
    pub profile_top_n: usize,
    pub profile_min_events_for_boost: usize,
    pub profile_cold_start_multiplier: f64,
    pub profile_starter_blend_weight: f64,
    /// Tag weights blended into sparse user profiles.
    pub starter_profile: HashMap<String, f64>,
    pub blend: BlendWeights,
    /// Per-surface blend overrides.
    pub blend_overrides: HashMap<String, BlendWeights>,
    pub starter_blend: BlendWeights,
    pub bandit_experiment: HoldoutExperimentConfig,
    pub segment_profiles: HashMap<String, TuningOverrides>,
    pub rules_enabled: bool,
    pub coverage_cache_ttl_secs: u64,
    pub coverage_long_tail_hint_threshold: f64,
    pub max_anchors_injected: usize,
}

impl Default for RecommendationConfig {
    fn default() -> Self {
        Self {
            half_life_days: 14.0,
            co_vis_window_days: 30.0,
            popularity_fanout: 500,
            max_k: 200,
            mmr_lambda: 0.7,
            mmr_presets: HashMap::new(),
            brand_cap: 0,
            category_cap: 0,
            brand_tag_prefixes: vec!["brand".to_string()],
            category_tag_prefixes: vec!["category".to_string(), "cat".to_string()],
            rule_exclude_events: false,
            exclude_event_types: vec!["purchase".to_string()],
            purchased_window_days: 30.0,
            profile_window_days: 30.0,
            profile_boost: 0.7,
            profile_top_n: 10,
            profile_min_events_for_boost: 3,
            profile_cold_start_multiplier: 0.5,
            profile_starter_blend_weight: 0.6,
            starter_profile: HashMap::new(),
            blend: BlendWeights::default(),
            blend_overrides: HashMap::new(),
            starter_blend: BlendWeights::new(1.0, 0.0, 0.2),
            bandit_experiment: HoldoutExperimentConfig::default(),
            segment_profiles: HashMap::new(),
            rules_enabled: true,
            coverage_cache_ttl_secs: 600,
            coverage_long_tail_hint_threshold: 0.01,
            max_anchors_injected: 50,
        }
    }
}

impl RecommendationConfig {
    /// Reject configurations the engine cannot serve with.
    pub fn validate(&self) -> RecsysResult<()> {
        for (name, v) in [
            ("half_life_days", self.half_life_days),
            ("co_vis_window_days", self.co_vis_window_days),
            ("profile_window_days", self.profile_window_days),
            ("purchased_window_days", self.purchased_window_days),
        ] {
            check_window(name, v)?;
        }
        if !(0.0..=1.0).contains(&self.mmr_lambda) {
            return Err(RecsysError::invalid("mmr_lambda must be between 0 and 1"));
        }
        check_fanout(self.popularity_fanout)?;
        if self.max_k == 0 {
            return Err(RecsysError::invalid("max_k must be positive"));
        }
        for (name, v) in [
            ("profile_cold_start_multiplier", self.profile_cold_start_multiplier),
            ("profile_starter_blend_weight", self.profile_starter_blend_weight),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return Err(RecsysError::invalid(format!("{name} must be between 0 and 1")));
            }
        }
        if self.profile_boost < 0.0 {
            return Err(RecsysError::invalid("profile_boost must be non-negative"));
        }
        let weights = [self.blend, self.starter_blend];
        if weights
            .iter()
            .chain(self.blend_overrides.values())
            .any(|w| w.alpha < 0.0 || w.beta < 0.0 || w.gamma < 0.0)
        {
            return Err(RecsysError::invalid("blend weights must be non-negative"));
        }
        if !(0.0..=1.0).contains(&self.bandit_experiment.holdout_percent) {
            return Err(RecsysError::invalid("holdout_percent must be between 0 and 1"));
        }
        for (segment, overrides) in &self.segment_profiles {
            overrides.validate().map_err(|e| {
                RecsysError::invalid(format!("segment_profiles.{segment}: {}", e.public_detail()))
            })?;
        }
        Ok(())
    }

    /// Copy of `self` with every set field of `overrides` applied. Window
    /// and fanout values outside the accepted range are ignored.
    pub fn with_overrides(&self, overrides: &TuningOverrides) -> Self {
        let mut cfg = self.clone();
        if let Some(v) = overrides.blend_alpha {
            cfg.blend.alpha = v;
        }
        if let Some(v) = overrides.blend_beta {
            cfg.blend.beta = v;
        }
        if let Some(v) = overrides.blend_gamma {
            cfg.blend.gamma = v;
        }
        if let Some(v) = overrides.mmr_lambda {
            cfg.mmr_lambda = v.clamp(0.0, 1.0);
            cfg.mmr_presets.clear();
        }
        if let Some(v) = overrides.brand_cap {
            cfg.brand_cap = v;
        }
        if let Some(v) = overrides.category_cap {
            cfg.category_cap = v;
        }
        if let Some(v) = overrides.profile_boost {
            cfg.profile_boost = v.max(0.0);
        }
        if let Some(v) = overrides.profile_window_days.filter(|v| window_in_range(*v)) {
            cfg.profile_window_days = v;
        }
        if let Some(v) = overrides.profile_top_n {
            cfg.profile_top_n = v;
        }
        if let Some(v) = overrides.profile_min_events_for_boost {
            cfg.profile_min_events_for_boost = v;
        }
        if let Some(v) = overrides.profile_cold_start_multiplier {
            cfg.profile_cold_start_multiplier = v.clamp(0.0, 1.0);
        }
        if let Some(v) = overrides.profile_starter_blend_weight {
            cfg.profile_starter_blend_weight = v.clamp(0.0, 1.0);
        }
        if let Some(v) = overrides.half_life_days.filter(|v| window_in_range(*v)) {
            cfg.half_life_days = v;
        }
        if let Some(v) = overrides.co_vis_window_days.filter(|v| window_in_range(*v)) {
            cfg.co_vis_window_days = v;
        }
        if let Some(v) = overrides.purchased_window_days.filter(|v| window_in_range(*v)) {
            cfg.purchased_window_days = v;
        }
        if let Some(v) = overrides.popularity_fanout.filter(|v| fanout_in_range(*v)) {
            cfg.popularity_fanout = v;
        }
        if let Some(v) = overrides.rule_exclude_events {
            cfg.rule_exclude_events = v;
        }
        if let Some(v) = &overrides.starter_profile {
            cfg.starter_profile = v.clone();
        }
        cfg
    }

    /// Blend weights for `surface` from the per-surface table, else base.
    pub fn blend_for_surface(&self, surface: &str) -> BlendWeights {
        self.blend_overrides
            .get(&surface.trim().to_ascii_lowercase())
            .copied()
            .unwrap_or(self.blend)
    }

    pub fn mmr_lambda_for_surface(&self, surface: &str) -> f64 {
        self.mmr_presets
            .get(&surface.trim().to_ascii_lowercase())
            .copied()
            .unwrap_or(self.mmr_lambda)
    }
}

/// Sparse knob overrides carried by segment profiles and bandit policies.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TuningOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blend_alpha: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blend_beta: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blend_gamma: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mmr_lambda: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brand_cap: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category_cap: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_boost: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_window_days: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_top_n: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_min_events_for_boost: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_cold_start_multiplier: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_starter_blend_weight: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub half_life_days: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub co_vis_window_days: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purchased_window_days: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub popularity_fanout: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_exclude_events: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub starter_profile: Option<HashMap<String, f64>>,
}

impl TuningOverrides {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Reject window and fanout knobs the engine would not apply.
    pub fn validate(&self) -> RecsysResult<()> {
        for (name, v) in [
            ("half_life_days", self.half_life_days),
            ("co_vis_window_days", self.co_vis_window_days),
            ("profile_window_days", self.profile_window_days),
            ("purchased_window_days", self.purchased_window_days),
        ] {
            if let Some(days) = v {
                check_window(name, days)?;
            }
        }
        if let Some(fanout) = self.popularity_fanout {
            check_fanout(fanout)?;
        }
        Ok(())
    }
}

// ─── Atomic cell ────────────────────────────────────────────────────────────

/// An immutable published configuration with provenance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConfigSnapshot {
    pub version: u64,
    pub config: RecommendationConfig,
    pub updated_at: DateTime<Utc>,
    pub updated_by: String,
    pub source: String,
    #[serde(default)]
    pub notes: String,
}

/// Process-wide holder for the current [`ConfigSnapshot`].
///
/// Reads are lock-free. Writers publish a whole new snapshot with a
/// compare-and-swap against the version they read.
pub struct ConfigCell {
    current: ArcSwap<ConfigSnapshot>,
}

impl ConfigCell {
    pub fn new(config: RecommendationConfig, source: impl Into<String>) -> Self {
        let snapshot = ConfigSnapshot {
            version: 1,
            config,
            updated_at: Utc::now(),
            updated_by: "system".to_string(),
            source: source.into(),
            notes: String::new(),
        };
        Self {
            current: ArcSwap::from_pointee(snapshot),
        }
    }

    pub fn load(&self) -> Arc<ConfigSnapshot> {
        self.current.load_full()
    }

    /// Publish `config` if the current version still equals
    /// `expected_version`. Returns the new snapshot.
    pub fn publish(
        &self,
        expected_version: u64,
        config: RecommendationConfig,
        updated_by: impl Into<String>,
        source: impl Into<String>,
        notes: impl Into<String>,
    ) -> RecsysResult<Arc<ConfigSnapshot>> {
        config.validate()?;
        let current = self.current.load_full();
        if current.version != expected_version {
            return Err(RecsysError::VersionMismatch {
                expected: expected_version.to_string(),
                current: current.version.to_string(),
            });
        }
        let next = Arc::new(ConfigSnapshot {
            version: current.version + 1,
            config,
            updated_at: Utc::now(),
            updated_by: updated_by.into(),
            source: source.into(),
            notes: notes.into(),
        });
        let prev = self.current.compare_and_swap(&current, Arc::clone(&next));
        if !Arc::ptr_eq(&prev, &current) {
            return Err(RecsysError::VersionMismatch {
                expected: expected_version.to_string(),
                current: prev.version.to_string(),
            });
        }
        tracing::info!(
            version = next.version,
            updated_by = %next.updated_by,
            source = %next.source,
            "Published recommendation config"
        );
        Ok(next)
    }
}

impl Default for ConfigCell {
    fn default() -> Self {
        Self::new(RecommendationConfig::default(), "default")
    }
}
