use crate::memory::{FailPoint, MemoryStore};
use async_trait::async_trait;
use chrono::Utc;
use recsys_core::store::{AdminStore, TraceStore};
use recsys_core::trace::{DecisionTrace, TraceQuery};
use recsys_core::types::{AdminAuditEvent, AuditQuery, CacheInvalidationEvent, TenantDocument};
use recsys_core::{RecsysError, RecsysResult};
use uuid::Uuid;

#[derive(Clone, Copy)]
enum DocKind {
    Config,
    Rules,
}

impl MemoryStore {
    fn get_document(&self, tenant: Uuid, kind: DocKind) -> RecsysResult<TenantDocument> {
        let record = self
            .tenants
            .get(&tenant)
            .ok_or_else(|| RecsysError::TenantNotFound(tenant.to_string()))?;
        Ok(match kind {
            DocKind::Config => record.config.clone(),
            DocKind::Rules => record.rules.clone(),
        })
    }

    /// Compare-and-set under the tenant's shard lock so writes linearize.
    fn update_document(
        &self,
        tenant: Uuid,
        kind: DocKind,
        document: serde_json::Value,
        if_match: &str,
        updated_by: Option<String>,
    ) -> RecsysResult<TenantDocument> {
        let mut record = self
            .tenants
            .get_mut(&tenant)
            .ok_or_else(|| RecsysError::TenantNotFound(tenant.to_string()))?;
        let record = &mut *record;
        let (doc, seq) = match kind {
            DocKind::Config => (&mut record.config, &mut record.config_seq),
            DocKind::Rules => (&mut record.rules, &mut record.rules_seq),
        };
        let expected = if_match.trim().trim_matches('"');
        if expected != doc.version {
            return Err(RecsysError::VersionMismatch {
                expected: expected.to_string(),
                current: doc.version.clone(),
            });
        }
        *seq += 1;
        *doc = TenantDocument {
            tenant_id: tenant,
            version: format!("v{seq}"),
            document,
            updated_at: Utc::now(),
            updated_by,
        };
        Ok(doc.clone())
    }
}

#[async_trait]
impl AdminStore for MemoryStore {
    async fn resolve_tenant(&self, tenant: Uuid) -> RecsysResult<()> {
        if self.tenants.contains_key(&tenant) {
            Ok(())
        } else {
            Err(RecsysError::TenantNotFound(tenant.to_string()))
        }
    }

    async fn get_tenant_config(&self, tenant: Uuid) -> RecsysResult<TenantDocument> {
        self.get_document(tenant, DocKind::Config)
    }

    async fn get_tenant_rules(&self, tenant: Uuid) -> RecsysResult<TenantDocument> {
        self.get_document(tenant, DocKind::Rules)
    }

    async fn update_tenant_config(
        &self,
        tenant: Uuid,
        document: serde_json::Value,
        if_match: &str,
        updated_by: Option<String>,
    ) -> RecsysResult<TenantDocument> {
        self.update_document(tenant, DocKind::Config, document, if_match, updated_by)
    }

    async fn update_tenant_rules(
        &self,
        tenant: Uuid,
        document: serde_json::Value,
        if_match: &str,
        updated_by: Option<String>,
    ) -> RecsysResult<TenantDocument> {
        self.update_document(tenant, DocKind::Rules, document, if_match, updated_by)
    }

    async fn insert_cache_invalidation(&self, event: CacheInvalidationEvent) -> RecsysResult<()> {
        self.invalidations.lock().push(event);
        Ok(())
    }

    async fn insert_audit_event(&self, event: AdminAuditEvent) -> RecsysResult<()> {
        self.check(FailPoint::Audit)?;
        self.audit_log.lock().push(event);
        Ok(())
    }

    async fn list_audit_log(
        &self,
        tenant: Uuid,
        query: &AuditQuery,
    ) -> RecsysResult<Vec<AdminAuditEvent>> {
        let log = self.audit_log.lock();
        let mut events: Vec<AdminAuditEvent> = log
            .iter()
            .filter(|e| e.tenant_id == tenant)
            .filter(|e| query.action.as_ref().map_or(true, |a| &e.action == a))
            .filter(|e| query.entity_type.as_ref().map_or(true, |t| &e.entity_type == t))
            .cloned()
            .collect();
        drop(log);
        events.sort_by(|a, b| b.occurred_at.cmp(&a.occurred_at));
        Ok(events
            .into_iter()
            .skip(query.offset.unwrap_or(0))
            .take(query.limit.unwrap_or(usize::MAX))
            .collect())
    }
}

#[async_trait]
impl TraceStore for MemoryStore {
    async fn insert_decision_traces(&self, traces: &[DecisionTrace]) -> RecsysResult<()> {
        for t in traces {
            self.traces.insert(t.decision_id, t.clone());
        }
        Ok(())
    }

    async fn get_decision_trace(
        &self,
        tenant: Uuid,
        decision_id: Uuid,
    ) -> RecsysResult<Option<DecisionTrace>> {
        Ok(self
            .traces
            .get(&decision_id)
            .filter(|t| t.org_id == tenant)
            .map(|t| t.value().clone()))
    }

    async fn list_decision_traces(
        &self,
        tenant: Uuid,
        query: &TraceQuery,
    ) -> RecsysResult<Vec<DecisionTrace>> {
        let mut traces: Vec<DecisionTrace> = self
            .traces
            .iter()
            .filter(|t| t.org_id == tenant && query.matches(t.value()))
            .map(|t| t.value().clone())
            .collect();
        traces.sort_by(|a, b| b.ts.cmp(&a.ts).then_with(|| a.decision_id.cmp(&b.decision_id)));
        traces.truncate(query.effective_limit());
        Ok(traces)
    }
}
