use crate::error::{RecsysError, RecsysResult};
use crate::recommendation::TuningOverrides;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Map a tenant identifier to its UUID. Valid UUIDs pass through, any
/// other non-empty string maps to a stable UUIDv5 in the OID namespace.
pub fn tenant_uuid(raw: &str) -> Option<Uuid> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    Some(Uuid::parse_str(raw).unwrap_or_else(|_| Uuid::new_v5(&Uuid::NAMESPACE_OID, raw.as_bytes())))
}

// ─── Catalog ────────────────────────────────────────────────────────────────

/// A catalog item with its tag set and free-form properties.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Item {
    pub item_id: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub props: serde_json::Value,
    #[serde(default = "default_true")]
    pub available: bool,
}

fn default_true() -> bool {
    true
}

impl Item {
    pub fn new(item_id: impl Into<String>, tags: &[&str]) -> Self {
        Self {
            item_id: item_id.into(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            props: serde_json::Value::Null,
            available: true,
        }
    }

    /// `props.popularity_hint`, when present and numeric.
    pub fn popularity_hint(&self) -> Option<f64> {
        self.props.get("popularity_hint").and_then(|v| v.as_f64())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ItemScore {
    pub item_id: String,
    pub score: f64,
}

impl ItemScore {
    pub fn new(item_id: impl Into<String>, score: f64) -> Self {
        Self {
            item_id: item_id.into(),
            score,
        }
    }
}

/// Weighted tag from a user's recent interaction profile.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProfileTag {
    pub tag: String,
    pub weight: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct User {
    pub user_id: String,
    #[serde(default)]
    pub traits: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// A user interaction row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub user_id: String,
    pub item_id: String,
    pub event_type: String,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct EventTypeWeight {
    pub weight: f64,
    pub half_life_days: f64,
    pub active: bool,
}

/// Default event weights overlaid by tenant rows.
pub fn default_event_types() -> HashMap<String, EventTypeWeight> {
    [
        ("view", 1.0, 14.0),
        ("click", 2.0, 14.0),
        ("add_to_cart", 3.0, 21.0),
        ("purchase", 5.0, 30.0),
    ]
    .into_iter()
    .map(|(code, weight, half_life_days)| {
        (
            code.to_string(),
            EventTypeWeight {
                weight,
                half_life_days,
                active: true,
            },
        )
    })
    .collect()
}

// ─── Segments ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SegmentRule {
    pub rule_id: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub expr: serde_json::Value,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Segment {
    pub segment_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub profile_id: String,
    #[serde(default)]
    pub rules: Vec<SegmentRule>,
}

/// Named tunable bundle selected by a segment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SegmentProfile {
    pub profile_id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub overrides: TuningOverrides,
}

// ─── Merchandising rules ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum RuleAction {
    Block,
    Pin,
    Boost,
}

impl fmt::Display for RuleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Block => "BLOCK",
            Self::Pin => "PIN",
            Self::Boost => "BOOST",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum RuleTarget {
    Item,
    Tag,
    Brand,
    Category,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Rule {
    pub rule_id: Uuid,
    pub tenant_id: Uuid,
    pub namespace: String,
    pub surface: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub action: RuleAction,
    pub target_type: RuleTarget,
    #[serde(default)]
    pub target_key: Option<String>,
    #[serde(default)]
    pub item_ids: Vec<String>,
    #[serde(default)]
    pub boost_value: Option<f64>,
    #[serde(default)]
    pub max_pins: Option<usize>,
    #[serde(default)]
    pub segment_id: Option<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub valid_from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub valid_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Rule {
    /// Check the structural invariants a stored rule must satisfy.
    pub fn validate(&self) -> RecsysResult<()> {
        if self.surface.trim().is_empty() {
            return Err(RecsysError::unprocessable("surface is required"));
        }
        match self.action {
            RuleAction::Boost => match self.boost_value {
                Some(v) if v != 0.0 && v.is_finite() => {}
                _ => return Err(RecsysError::unprocessable("BOOST requires non-zero boost_value")),
            },
            RuleAction::Pin => {
                if self.item_ids.iter().all(|id| id.trim().is_empty()) {
                    return Err(RecsysError::unprocessable("PIN requires at least one item_id"));
                }
                if self.max_pins == Some(0) {
                    return Err(RecsysError::unprocessable("max_pins must be positive"));
                }
            }
            RuleAction::Block => {}
        }
        match self.target_type {
            RuleTarget::Item => {
                if self.action != RuleAction::Pin && self.item_ids.is_empty() {
                    return Err(RecsysError::unprocessable("ITEM target requires item_ids"));
                }
            }
            RuleTarget::Tag | RuleTarget::Brand | RuleTarget::Category => {
                let key = self.target_key.as_deref().map(str::trim).unwrap_or("");
                if key.is_empty() && self.action != RuleAction::Pin {
                    return Err(RecsysError::unprocessable(format!(
                        "{:?} target requires target_key",
                        self.target_type
                    )));
                }
            }
        }
        if let (Some(from), Some(until)) = (self.valid_from, self.valid_until) {
            if until <= from {
                return Err(RecsysError::unprocessable("valid_until must be after valid_from"));
            }
        }
        Ok(())
    }

    /// Enabled and `now` inside the validity window.
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        if !self.enabled {
            return false;
        }
        if self.valid_from.is_some_and(|from| now < from) {
            return false;
        }
        if self.valid_until.is_some_and(|until| now > until) {
            return false;
        }
        true
    }

    /// Active and scoped to `segment` (unscoped rules apply everywhere).
    pub fn applies_to(&self, now: DateTime<Utc>, segment: &str) -> bool {
        if !self.is_active_at(now) {
            return false;
        }
        match self.segment_id.as_deref().map(str::trim) {
            None | Some("") => true,
            Some(seg) => seg.eq_ignore_ascii_case(segment.trim()),
        }
    }
}

// ─── Manual overrides ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OverrideAction {
    Boost,
    Suppress,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OverrideStatus {
    Active,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ManualOverride {
    pub override_id: Uuid,
    pub tenant_id: Uuid,
    pub namespace: String,
    pub surface: String,
    pub item_id: String,
    pub action: OverrideAction,
    #[serde(default)]
    pub boost_value: Option<f64>,
    pub priority: i32,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    pub status: OverrideStatus,
    /// Backing merchandising rule.
    #[serde(default)]
    pub rule_id: Option<Uuid>,
    #[serde(default)]
    pub cancelled_at: Option<DateTime<Utc>>,
}

// ─── Bandit ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    #[default]
    Thompson,
    Ucb1,
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Thompson => "thompson",
            Self::Ucb1 => "ucb1",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = RecsysError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "thompson" | "ts" => Ok(Self::Thompson),
            "ucb1" | "ucb" => Ok(Self::Ucb1),
            other => Err(RecsysError::invalid(format!("unknown bandit algorithm: {other}"))),
        }
    }
}

/// A named tunable bundle competing on a bandit arm.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyConfig {
    pub policy_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(flatten)]
    pub knobs: TuningOverrides,
    #[serde(default)]
    pub notes: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct BanditStats {
    pub trials: u64,
    pub successes: u64,
}

/// Identifies one counter family row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArmKey {
    pub tenant_id: Uuid,
    pub namespace: String,
    pub surface: String,
    pub bucket_key: String,
    pub algorithm: Algorithm,
    pub policy_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BanditDecisionLog {
    pub tenant_id: Uuid,
    pub namespace: String,
    pub surface: String,
    pub bucket_key: String,
    pub algorithm: Algorithm,
    pub policy_id: String,
    pub explore: bool,
    pub request_id: String,
    pub explain: HashMap<String, String>,
    #[serde(default)]
    pub experiment: Option<String>,
    #[serde(default)]
    pub variant: Option<String>,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BanditRewardLog {
    pub tenant_id: Uuid,
    pub namespace: String,
    pub surface: String,
    pub bucket_key: String,
    pub algorithm: Algorithm,
    pub policy_id: String,
    pub reward: bool,
    pub request_id: String,
    pub ts: DateTime<Utc>,
}

// ─── Admin ──────────────────────────────────────────────────────────────────

/// Versioned per-tenant JSON document (config or rules).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TenantDocument {
    pub tenant_id: Uuid,
    pub version: String,
    pub document: serde_json::Value,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_by: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Actor {
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub actor_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdminAuditEvent {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub actor: Actor,
    pub action: String,
    pub entity_type: String,
    pub entity_id: String,
    #[serde(default)]
    pub before: Option<serde_json::Value>,
    #[serde(default)]
    pub after: Option<serde_json::Value>,
    #[serde(default)]
    pub request_id: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AuditQuery {
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub entity_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheInvalidationEvent {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub targets: Vec<String>,
    #[serde(default)]
    pub surface: Option<String>,
    pub status: String,
    pub request_id: String,
    pub actor: Actor,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn rule(action: RuleAction) -> Rule {
        let now = Utc::now();
        Rule {
            rule_id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            namespace: "default".into(),
            surface: "home".into(),
            name: "r".into(),
            description: String::new(),
            action,
            target_type: RuleTarget::Item,
            target_key: None,
            item_ids: vec!["x".into()],
            boost_value: None,
            max_pins: None,
            segment_id: None,
            priority: 0,
            enabled: true,
            valid_from: None,
            valid_until: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_tenant_uuid_stable() {
        let a = tenant_uuid("acme").unwrap();
        assert_eq!(a, tenant_uuid(" acme ").unwrap());
        let id = Uuid::new_v4();
        assert_eq!(tenant_uuid(&id.to_string()), Some(id));
        assert!(tenant_uuid("  ").is_none());
    }

    #[test]
    fn test_boost_requires_value() {
        let mut r = rule(RuleAction::Boost);
        assert!(r.validate().is_err());
        r.boost_value = Some(0.5);
        assert!(r.validate().is_ok());
    }

    #[test]
    fn test_validity_window() {
        let mut r = rule(RuleAction::Block);
        let now = Utc::now();
        r.valid_from = Some(now - Duration::hours(1));
        r.valid_until = Some(now + Duration::hours(1));
        assert!(r.is_active_at(now));
        assert!(!r.is_active_at(now + Duration::hours(2)));
        r.valid_until = Some(now - Duration::hours(2));
        assert!(r.validate().is_err());
    }

    #[test]
    fn test_segment_scoping() {
        let mut r = rule(RuleAction::Block);
        r.segment_id = Some("vip".into());
        let now = Utc::now();
        assert!(r.applies_to(now, "VIP"));
        assert!(!r.applies_to(now, "default"));
    }

    #[test]
    fn test_rule_action_wire_format() {
        let json = serde_json::to_string(&RuleAction::Pin).unwrap();
        assert_eq!(json, "\"PIN\"");
        let t: RuleTarget = serde_json::from_str("\"CATEGORY\"").unwrap();
        assert_eq!(t, RuleTarget::Category);
    }

    #[test]
    fn test_algorithm_parse() {
        assert_eq!("UCB1".parse::<Algorithm>().unwrap(), Algorithm::Ucb1);
        assert_eq!("".parse::<Algorithm>().unwrap(), Algorithm::Thompson);
        assert!("epsilon".parse::<Algorithm>().is_err());
    }
}
