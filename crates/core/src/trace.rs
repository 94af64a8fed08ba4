//! Decision audit trace records.

use crate::types::ItemScore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

pub const DEFAULT_TRACE_LIMIT: usize = 50;
pub const MAX_TRACE_LIMIT: usize = 200;

/// Salted user hash for audit records: lowercase hex SHA-256 of
/// `"{namespace}:{user_id}:{salt}"`, or empty when any part is empty.
pub fn user_hash(namespace: &str, user_id: &str, salt: &str) -> String {
    if namespace.is_empty() || user_id.is_empty() || salt.is_empty() {
        return String::new();
    }
    let mut hasher = Sha256::new();
    hasher.update(namespace.as_bytes());
    hasher.update(b":");
    hasher.update(user_id.as_bytes());
    hasher.update(b":");
    hasher.update(salt.as_bytes());
    hex::encode(hasher.finalize())
}

/// One ranking decision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DecisionTrace {
    pub decision_id: Uuid,
    pub org_id: Uuid,
    pub ts: DateTime<Utc>,
    pub namespace: String,
    pub surface: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user_hash: String,
    pub k: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraints: Option<TraceConstraints>,
    pub effective_config: TraceConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bandit: Option<TraceBandit>,
    pub candidates_pre: Vec<ItemScore>,
    pub final_items: Vec<TraceFinalItem>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mmr_info: Vec<TraceMmr>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub caps: BTreeMap<String, CapsExplain>,
    pub extras: TraceExtras,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TraceConstraints {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include_tags_any: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude_item_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TraceConfig {
    pub alpha: f64,
    pub beta: f64,
    pub gamma: f64,
    pub profile_boost: f64,
    pub profile_window_days: f64,
    pub profile_top_n: usize,
    pub mmr_lambda: f64,
    pub brand_cap: usize,
    pub category_cap: usize,
    pub half_life_days: f64,
    pub co_vis_window_days: f64,
    pub purchased_window_days: f64,
    pub rule_exclude_events: bool,
    pub popularity_fanout: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TraceBandit {
    pub chosen_policy_id: String,
    pub algorithm: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub bucket_key: String,
    pub explore: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub request_id: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub explain: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TraceFinalItem {
    pub item_id: String,
    pub score: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TraceMmr {
    pub pick_index: usize,
    pub item_id: String,
    pub max_sim: f64,
    pub relevance: f64,
    pub penalty: f64,
    #[serde(default)]
    pub brand_cap_hit: bool,
    #[serde(default)]
    pub category_cap_hit: bool,
}

/// Usage of one cap dimension for one item.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct CapUsage {
    pub applied: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct CapsExplain {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brand: Option<CapUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<CapUsage>,
}

impl CapsExplain {
    pub fn any_applied(&self) -> bool {
        self.brand.as_ref().is_some_and(|c| c.applied)
            || self.category.as_ref().is_some_and(|c| c.applied)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TraceExtras {
    pub model_version: String,
    pub duration_ms: u64,
    pub include_reasons: bool,
    pub explain_level: String,
    /// `"starter"` when the cold-start blend was used, else `"base"`.
    pub starter_profile: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub anchors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segment_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub personalized_items: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub request_context_keys: Vec<String>,
    #[serde(default)]
    pub mmr_applied: bool,
    #[serde(default)]
    pub caps_applied: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_summary: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_stats: Option<serde_json::Value>,
}

/// Filters for decision trace retrieval.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TraceQuery {
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub surface: Option<String>,
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
    #[serde(default)]
    pub until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl TraceQuery {
    pub fn effective_limit(&self) -> usize {
        match self.limit {
            None | Some(0) => DEFAULT_TRACE_LIMIT,
            Some(n) => n.min(MAX_TRACE_LIMIT),
        }
    }

    pub fn matches(&self, trace: &DecisionTrace) -> bool {
        if let Some(ns) = self.namespace.as_deref().filter(|s| !s.is_empty()) {
            if trace.namespace != ns {
                return false;
            }
        }
        if let Some(surface) = self.surface.as_deref().filter(|s| !s.is_empty()) {
            if trace.surface != surface {
                return false;
            }
        }
        if let Some(rid) = self.request_id.as_deref().filter(|s| !s.is_empty()) {
            if trace.request_id.as_deref() != Some(rid) {
                return false;
            }
        }
        if self.since.is_some_and(|since| trace.ts < since) {
            return false;
        }
        if self.until.is_some_and(|until| trace.ts > until) {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_hash_known_value() {
        let h = user_hash("default", "u_1", "salt");
        let mut hasher = Sha256::new();
        hasher.update(b"default:u_1:salt");
        assert_eq!(h, hex::encode(hasher.finalize()));
        assert_eq!(h.len(), 64);
        assert_eq!(h, h.to_lowercase());
    }

    #[test]
    fn test_user_hash_empty_parts() {
        assert!(user_hash("", "u", "s").is_empty());
        assert!(user_hash("ns", "", "s").is_empty());
        assert!(user_hash("ns", "u", "").is_empty());
    }

    #[test]
    fn test_query_limits() {
        let q = TraceQuery::default();
        assert_eq!(q.effective_limit(), 50);
        let q = TraceQuery {
            limit: Some(1000),
            ..Default::default()
        };
        assert_eq!(q.effective_limit(), 200);
    }
}
