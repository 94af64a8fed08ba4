//! Asynchronous decision trace recorder.
//!
//! `record` never blocks: traces go onto a bounded FIFO and a single
//! background task drains it into the configured sink. When the queue is
//! full the oldest pending trace is dropped.

use crate::sink::AuditSink;
use parking_lot::Mutex;
use recsys_core::config::AuditConfig;
use recsys_core::trace::DecisionTrace;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy)]
pub struct RecorderOptions {
    pub capacity: usize,
    pub drain_timeout: Duration,
}

impl Default for RecorderOptions {
    fn default() -> Self {
        Self {
            capacity: 1024,
            drain_timeout: Duration::from_secs(2),
        }
    }
}

impl From<&AuditConfig> for RecorderOptions {
    fn from(cfg: &AuditConfig) -> Self {
        Self {
            capacity: cfg.queue_capacity.max(1),
            drain_timeout: Duration::from_millis(cfg.drain_timeout_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct RecorderStats {
    pub queued: usize,
    pub enqueued: u64,
    pub dropped: u64,
    pub written: u64,
    pub sink_errors: u64,
}

struct Shared {
    queue: Mutex<VecDeque<DecisionTrace>>,
    capacity: usize,
    notify: Notify,
    closed: AtomicBool,
    enqueued: AtomicU64,
    dropped: AtomicU64,
    written: AtomicU64,
    sink_errors: AtomicU64,
}

pub struct DecisionRecorder {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    drain_timeout: Duration,
}

impl DecisionRecorder {
    /// Create the recorder and spawn its consumer. Must be called from
    /// within a Tokio runtime.
    pub fn start(sink: Arc<dyn AuditSink>, opts: RecorderOptions) -> Arc<Self> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::with_capacity(opts.capacity.min(4096))),
            capacity: opts.capacity.max(1),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            enqueued: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            written: AtomicU64::new(0),
            sink_errors: AtomicU64::new(0),
        });

        let worker = tokio::spawn(run(Arc::clone(&shared), sink));
        info!(capacity = shared.capacity, "Decision recorder started");

        Arc::new(Self {
            shared,
            worker: Mutex::new(Some(worker)),
            drain_timeout: opts.drain_timeout,
        })
    }

    /// Enqueue a trace (non-blocking).
    pub fn record(&self, trace: DecisionTrace) {
        if self.shared.closed.load(Ordering::Acquire) {
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("recsys.audit.dropped", "reason" => "closed").increment(1);
            return;
        }
        {
            let mut queue = self.shared.queue.lock();
            if queue.len() >= self.shared.capacity {
                queue.pop_front();
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("recsys.audit.dropped", "reason" => "overflow").increment(1);
            }
            queue.push_back(trace);
        }
        self.shared.enqueued.fetch_add(1, Ordering::Relaxed);
        self.shared.notify.notify_one();
    }

    pub fn stats(&self) -> RecorderStats {
        RecorderStats {
            queued: self.shared.queue.lock().len(),
            enqueued: self.shared.enqueued.load(Ordering::Relaxed),
            dropped: self.shared.dropped.load(Ordering::Relaxed),
            written: self.shared.written.load(Ordering::Relaxed),
            sink_errors: self.shared.sink_errors.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting traces and drain what is queued. The consumer is
    /// aborted if the drain outlasts the deadline.
    pub async fn shutdown(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.notify.notify_one();

        let Some(mut worker) = self.worker.lock().take() else {
            return;
        };
        match tokio::time::timeout(self.drain_timeout, &mut worker).await {
            Ok(_) => info!(stats = ?self.stats(), "Decision recorder drained"),
            Err(_) => {
                worker.abort();
                let pending = self.shared.queue.lock().len();
                warn!(pending, "Decision recorder drain timed out");
            }
        }
    }
}

async fn run(shared: Arc<Shared>, sink: Arc<dyn AuditSink>) {
    loop {
        let next = shared.queue.lock().pop_front();
        match next {
            Some(trace) => match sink.write(&trace).await {
                Ok(()) => {
                    shared.written.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("recsys.audit.written").increment(1);
                }
                Err(e) => {
                    shared.sink_errors.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("recsys.audit.sink_errors").increment(1);
                    warn!(decision_id = %trace.decision_id, error = %e, "Audit sink write failed");
                }
            },
            None => {
                if shared.closed.load(Ordering::Acquire) {
                    debug!("Decision recorder queue closed");
                    return;
                }
                shared.notify.notified().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{MemorySink, StoreSink};
    use async_trait::async_trait;
    use chrono::Utc;
    use recsys_core::trace::{TraceConfig, TraceExtras};
    use recsys_core::{RecsysError, RecsysResult};
    use recsys_store::MemoryStore;
    use uuid::Uuid;

    fn trace(n: usize) -> DecisionTrace {
        DecisionTrace {
            decision_id: Uuid::new_v4(),
            org_id: Uuid::nil(),
            ts: Utc::now(),
            namespace: "default".into(),
            surface: "home".into(),
            request_id: Some(format!("req-{n}")),
            user_hash: String::new(),
            k: 10,
            constraints: None,
            effective_config: TraceConfig::default(),
            bandit: None,
            candidates_pre: Vec::new(),
            final_items: Vec::new(),
            mmr_info: Vec::new(),
            caps: Default::default(),
            extras: TraceExtras::default(),
        }
    }

    /// Blocks every write until released, so the queue can fill up.
    struct GatedSink {
        gate: tokio::sync::Semaphore,
        inner: MemorySink,
    }

    #[async_trait]
    impl AuditSink for GatedSink {
        async fn write(&self, trace: &DecisionTrace) -> RecsysResult<()> {
            let permit = self
                .gate
                .acquire()
                .await
                .map_err(|e| RecsysError::internal(e.to_string()))?;
            permit.forget();
            self.inner.write(trace).await
        }
    }

    struct FailingSink;

    #[async_trait]
    impl AuditSink for FailingSink {
        async fn write(&self, _: &DecisionTrace) -> RecsysResult<()> {
            Err(RecsysError::Store("disk full".into()))
        }
    }

    #[tokio::test]
    async fn test_records_and_drains() {
        let sink = Arc::new(MemorySink::new());
        let recorder = DecisionRecorder::start(sink.clone(), RecorderOptions::default());
        for i in 0..5 {
            recorder.record(trace(i));
        }
        recorder.shutdown().await;
        assert_eq!(sink.len(), 5);
        let stats = recorder.stats();
        assert_eq!(stats.written, 5);
        assert_eq!(stats.dropped, 0);
    }

    #[tokio::test]
    async fn test_overflow_drops_oldest() {
        let sink = Arc::new(GatedSink {
            gate: tokio::sync::Semaphore::new(0),
            inner: MemorySink::new(),
        });
        let recorder = DecisionRecorder::start(
            sink.clone(),
            RecorderOptions {
                capacity: 3,
                drain_timeout: Duration::from_secs(5),
            },
        );
        // The consumer may already hold the first trace while it waits on
        // the gate, so only the queued tail is bounded.
        for i in 0..10 {
            recorder.record(trace(i));
        }
        assert!(recorder.stats().queued <= 3);
        assert!(recorder.stats().dropped >= 6);

        sink.gate.add_permits(100);
        recorder.shutdown().await;

        let written: Vec<String> = sink
            .inner
            .traces()
            .into_iter()
            .filter_map(|t| t.request_id)
            .collect();
        assert!(written.ends_with(&["req-7".to_string(), "req-8".to_string(), "req-9".to_string()]));
    }

    #[tokio::test]
    async fn test_sink_errors_are_counted() {
        let recorder = DecisionRecorder::start(Arc::new(FailingSink), RecorderOptions::default());
        recorder.record(trace(1));
        recorder.record(trace(2));
        recorder.shutdown().await;
        let stats = recorder.stats();
        assert_eq!(stats.sink_errors, 2);
        assert_eq!(stats.written, 0);
    }

    #[tokio::test]
    async fn test_record_after_shutdown_is_dropped() {
        let sink = Arc::new(MemorySink::new());
        let recorder = DecisionRecorder::start(sink.clone(), RecorderOptions::default());
        recorder.shutdown().await;
        recorder.record(trace(1));
        assert_eq!(recorder.stats().dropped, 1);
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_drain_deadline_aborts() {
        let sink = Arc::new(GatedSink {
            gate: tokio::sync::Semaphore::new(0),
            inner: MemorySink::new(),
        });
        let recorder = DecisionRecorder::start(
            sink.clone(),
            RecorderOptions {
                capacity: 8,
                drain_timeout: Duration::from_millis(50),
            },
        );
        recorder.record(trace(1));
        recorder.shutdown().await;
        assert!(sink.inner.is_empty());
    }

    #[tokio::test]
    async fn test_store_sink_persists() {
        let store = Arc::new(MemoryStore::new());
        let recorder =
            DecisionRecorder::start(Arc::new(StoreSink::new(store.clone())), RecorderOptions::default());
        recorder.record(trace(1));
        recorder.shutdown().await;
        assert_eq!(store.trace_count(), 1);
    }
}
