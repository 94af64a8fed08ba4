//! Destinations for decision traces.

use async_trait::async_trait;
use parking_lot::Mutex;
use recsys_core::store::TraceStore;
use recsys_core::trace::DecisionTrace;
use recsys_core::RecsysResult;
use std::sync::Arc;
use tracing::info;

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn write(&self, trace: &DecisionTrace) -> RecsysResult<()>;
}

/// Persists traces through the store so they can be queried back.
pub struct StoreSink {
    store: Arc<dyn TraceStore>,
}

impl StoreSink {
    pub fn new(store: Arc<dyn TraceStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl AuditSink for StoreSink {
    async fn write(&self, trace: &DecisionTrace) -> RecsysResult<()> {
        self.store
            .insert_decision_traces(std::slice::from_ref(trace))
            .await
    }
}

/// Emits each trace as one structured log line.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl AuditSink for LogSink {
    async fn write(&self, trace: &DecisionTrace) -> RecsysResult<()> {
        let body = serde_json::to_string(trace)?;
        info!(
            target: "recsys_audit",
            decision_id = %trace.decision_id,
            org_id = %trace.org_id,
            namespace = %trace.namespace,
            surface = %trace.surface,
            trace = %body,
            "Decision trace"
        );
        Ok(())
    }
}

/// Keeps traces in memory. Used by tests and local runs.
#[derive(Default)]
pub struct MemorySink {
    traces: Mutex<Vec<DecisionTrace>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn traces(&self) -> Vec<DecisionTrace> {
        self.traces.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.traces.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.traces.lock().is_empty()
    }
}

#[async_trait]
impl AuditSink for MemorySink {
    async fn write(&self, trace: &DecisionTrace) -> RecsysResult<()> {
        self.traces.lock().push(trace.clone());
        Ok(())
    }
}
