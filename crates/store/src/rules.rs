use crate::memory::{FailPoint, MemoryStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use recsys_core::store::{OverrideStore, RuleFilter, RuleStore};
use recsys_core::types::{ManualOverride, OverrideStatus, Rule};
use recsys_core::{RecsysError, RecsysResult};
use uuid::Uuid;

fn sort_rules(rules: &mut [Rule]) {
    rules.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.rule_id.to_string().cmp(&b.rule_id.to_string()))
    });
}

#[async_trait]
impl RuleStore for MemoryStore {
    async fn create_rule(&self, rule: Rule) -> RecsysResult<Rule> {
        if self.rules.contains_key(&rule.rule_id) {
            return Err(RecsysError::Conflict(format!("rule {} already exists", rule.rule_id)));
        }
        self.rules.insert(rule.rule_id, rule.clone());
        Ok(rule)
    }

    async fn update_rule(&self, rule: Rule) -> RecsysResult<Rule> {
        match self.rules.get_mut(&rule.rule_id) {
            Some(mut existing) if existing.tenant_id == rule.tenant_id => {
                *existing = rule.clone();
                Ok(rule)
            }
            _ => Err(RecsysError::not_found(format!("rule {} not found", rule.rule_id))),
        }
    }

    async fn get_rule(&self, tenant: Uuid, rule_id: Uuid) -> RecsysResult<Option<Rule>> {
        Ok(self
            .rules
            .get(&rule_id)
            .filter(|r| r.tenant_id == tenant)
            .map(|r| r.value().clone()))
    }

    async fn list_rules(&self, tenant: Uuid, filter: &RuleFilter) -> RecsysResult<Vec<Rule>> {
        let mut rules: Vec<Rule> = self
            .rules
            .iter()
            .map(|r| r.value().clone())
            .filter(|r| r.tenant_id == tenant)
            .filter(|r| filter.namespace.as_ref().map_or(true, |ns| &r.namespace == ns))
            .filter(|r| filter.surface.as_ref().map_or(true, |s| &r.surface == s))
            .filter(|r| filter.action.map_or(true, |a| r.action == a))
            .filter(|r| filter.enabled.map_or(true, |e| r.enabled == e))
            .collect();
        sort_rules(&mut rules);
        Ok(rules)
    }

    async fn list_enabled_rules_for_scope(
        &self,
        tenant: Uuid,
        ns: &str,
        surface: &str,
    ) -> RecsysResult<Vec<Rule>> {
        self.check(FailPoint::Rules)?;
        let mut rules: Vec<Rule> = self
            .rules
            .iter()
            .filter(|r| {
                r.tenant_id == tenant
                    && r.namespace == ns
                    && r.surface.eq_ignore_ascii_case(surface)
                    && r.enabled
            })
            .map(|r| r.value().clone())
            .collect();
        sort_rules(&mut rules);
        Ok(rules)
    }

    async fn list_active_rules_for_scope(
        &self,
        tenant: Uuid,
        ns: &str,
        surface: &str,
        now: DateTime<Utc>,
    ) -> RecsysResult<Vec<Rule>> {
        let mut rules = self.list_enabled_rules_for_scope(tenant, ns, surface).await?;
        rules.retain(|r| r.is_active_at(now));
        Ok(rules)
    }
}

#[async_trait]
impl OverrideStore for MemoryStore {
    async fn create_override(&self, ov: ManualOverride) -> RecsysResult<ManualOverride> {
        self.overrides.insert(ov.override_id, ov.clone());
        Ok(ov)
    }

    async fn get_override(
        &self,
        tenant: Uuid,
        override_id: Uuid,
    ) -> RecsysResult<Option<ManualOverride>> {
        Ok(self
            .overrides
            .get(&override_id)
            .filter(|o| o.tenant_id == tenant)
            .map(|o| o.value().clone()))
    }

    async fn list_overrides(
        &self,
        tenant: Uuid,
        ns: &str,
        status: Option<OverrideStatus>,
    ) -> RecsysResult<Vec<ManualOverride>> {
        let mut out: Vec<ManualOverride> = self
            .overrides
            .iter()
            .filter(|o| o.tenant_id == tenant && o.namespace == ns)
            .filter(|o| status.map_or(true, |s| o.status == s))
            .map(|o| o.value().clone())
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(out)
    }

    async fn cancel_override(
        &self,
        tenant: Uuid,
        override_id: Uuid,
        at: DateTime<Utc>,
    ) -> RecsysResult<ManualOverride> {
        match self.overrides.get_mut(&override_id) {
            Some(mut ov) if ov.tenant_id == tenant => {
                if ov.status == OverrideStatus::Active {
                    ov.status = OverrideStatus::Cancelled;
                    ov.cancelled_at = Some(at);
                }
                Ok(ov.clone())
            }
            _ => Err(RecsysError::not_found(format!("override {override_id} not found"))),
        }
    }
}
