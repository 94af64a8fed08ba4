use chrono::Utc;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use recsys_core::trace::DecisionTrace;
use recsys_core::types::{
    AdminAuditEvent, ArmKey, BanditDecisionLog, BanditRewardLog, BanditStats,
    CacheInvalidationEvent, Event, EventTypeWeight, Item, ManualOverride, PolicyConfig, Rule,
    Segment, SegmentProfile, TenantDocument, User,
};
use recsys_core::{RecsysError, RecsysResult};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;
use uuid::Uuid;

/// Store calls that can be forced to fail for degradation tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    Popularity,
    CoVis,
    Similar,
    Profile,
    Tags,
    Segments,
    Rules,
    Bandit,
    Audit,
}

pub(crate) type NsKey = (Uuid, String);

/// Items, users and events of one (tenant, namespace).
#[derive(Default)]
pub(crate) struct Catalog {
    pub items: BTreeMap<String, Item>,
    pub users: HashMap<String, User>,
    pub events: Vec<Event>,
}

pub(crate) struct TenantRecord {
    pub config: TenantDocument,
    pub config_seq: u64,
    pub rules: TenantDocument,
    pub rules_seq: u64,
}

/// Thread-safe in-memory store for catalog, segments, rules, bandit state,
/// admin documents and decision traces.
pub struct MemoryStore {
    pub(crate) catalogs: DashMap<NsKey, RwLock<Catalog>>,
    pub(crate) segments: DashMap<NsKey, Vec<Segment>>,
    pub(crate) profiles: DashMap<NsKey, HashMap<String, SegmentProfile>>,
    pub(crate) rules: DashMap<Uuid, Rule>,
    pub(crate) overrides: DashMap<Uuid, ManualOverride>,
    pub(crate) policies: DashMap<NsKey, Vec<PolicyConfig>>,
    pub(crate) stats: DashMap<ArmKey, BanditStats>,
    pub(crate) rewarded: DashMap<(ArmKey, String), ()>,
    pub(crate) decision_log: Mutex<Vec<BanditDecisionLog>>,
    pub(crate) reward_log: Mutex<Vec<BanditRewardLog>>,
    pub(crate) tenants: DashMap<Uuid, TenantRecord>,
    pub(crate) invalidations: Mutex<Vec<CacheInvalidationEvent>>,
    pub(crate) audit_log: Mutex<Vec<AdminAuditEvent>>,
    pub(crate) traces: DashMap<Uuid, DecisionTrace>,
    pub(crate) event_types: DashMap<Uuid, HashMap<String, EventTypeWeight>>,
    fail_points: DashMap<FailPoint, AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        info!("Memory store initialized");
        Self {
            catalogs: DashMap::new(),
            segments: DashMap::new(),
            profiles: DashMap::new(),
            rules: DashMap::new(),
            overrides: DashMap::new(),
            policies: DashMap::new(),
            stats: DashMap::new(),
            rewarded: DashMap::new(),
            decision_log: Mutex::new(Vec::new()),
            reward_log: Mutex::new(Vec::new()),
            tenants: DashMap::new(),
            invalidations: Mutex::new(Vec::new()),
            audit_log: Mutex::new(Vec::new()),
            traces: DashMap::new(),
            event_types: DashMap::new(),
            fail_points: DashMap::new(),
        }
    }

    // ─── Fail switches ─────────────────────────────────────────────────────

    pub fn set_fail(&self, point: FailPoint, fail: bool) {
        self.fail_points
            .entry(point)
            .or_insert_with(|| AtomicBool::new(false))
            .store(fail, Ordering::SeqCst);
    }

    pub(crate) fn check(&self, point: FailPoint) -> RecsysResult<()> {
        let failing = self
            .fail_points
            .get(&point)
            .map(|f| f.load(Ordering::SeqCst))
            .unwrap_or(false);
        if failing {
            return Err(RecsysError::Store(format!("{point:?} unavailable")));
        }
        Ok(())
    }

    // ─── Write helpers ─────────────────────────────────────────────────────

    /// Register a tenant with empty config and rules documents at `v1`.
    pub fn add_tenant(&self, tenant_id: Uuid) {
        self.tenants.entry(tenant_id).or_insert_with(|| {
            let now = Utc::now();
            let doc = |document| TenantDocument {
                tenant_id,
                version: "v1".to_string(),
                document,
                updated_at: now,
                updated_by: None,
            };
            TenantRecord {
                config: doc(serde_json::json!({})),
                config_seq: 1,
                rules: doc(serde_json::json!({})),
                rules_seq: 1,
            }
        });
    }

    pub fn upsert_items(&self, tenant_id: Uuid, ns: &str, items: Vec<Item>) {
        let entry = self.catalogs.entry((tenant_id, ns.to_string())).or_default();
        let mut catalog = entry.write();
        for item in items {
            catalog.items.insert(item.item_id.clone(), item);
        }
    }

    pub fn upsert_user(&self, tenant_id: Uuid, ns: &str, user: User) {
        let entry = self.catalogs.entry((tenant_id, ns.to_string())).or_default();
        entry.write().users.insert(user.user_id.clone(), user);
    }

    pub fn record_events(&self, tenant_id: Uuid, ns: &str, events: Vec<Event>) {
        let entry = self.catalogs.entry((tenant_id, ns.to_string())).or_default();
        entry.write().events.extend(events);
    }

    pub fn put_segments(&self, tenant_id: Uuid, ns: &str, segments: Vec<Segment>) {
        self.segments.insert((tenant_id, ns.to_string()), segments);
    }

    pub fn put_segment_profile(&self, tenant_id: Uuid, ns: &str, profile: SegmentProfile) {
        self.profiles
            .entry((tenant_id, ns.to_string()))
            .or_default()
            .insert(profile.profile_id.clone(), profile);
    }

    pub fn set_event_type(&self, tenant_id: Uuid, code: &str, weight: EventTypeWeight) {
        self.event_types
            .entry(tenant_id)
            .or_default()
            .insert(code.to_string(), weight);
    }

    // ─── Inspection helpers ────────────────────────────────────────────────

    pub fn decision_log(&self) -> Vec<BanditDecisionLog> {
        self.decision_log.lock().clone()
    }

    pub fn reward_log(&self) -> Vec<BanditRewardLog> {
        self.reward_log.lock().clone()
    }

    pub fn cache_invalidations(&self) -> Vec<CacheInvalidationEvent> {
        self.invalidations.lock().clone()
    }

    pub fn trace_count(&self) -> usize {
        self.traces.len()
    }

    pub(crate) fn item_tag_sets(&self, tenant_id: Uuid, ns: &str) -> HashMap<String, HashSet<String>> {
        self.catalogs
            .get(&(tenant_id, ns.to_string()))
            .map(|c| {
                c.read()
                    .items
                    .values()
                    .map(|i| (i.item_id.clone(), i.tags.iter().map(|t| t.to_lowercase()).collect()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}
