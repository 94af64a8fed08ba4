//! Exposure logging: which ranked list was shown to which (hashed)
//! subject, written as JSON lines for offline joins with outcomes.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use recsys_core::request::ExperimentRef;
use recsys_core::{RecsysError, RecsysResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const EXPOSURE_SCHEMA_VERSION: &str = "v1";

const CHANNEL_CAPACITY: usize = 10_000;
const FLUSH_INTERVAL: Duration = Duration::from_secs(1);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExposedItem {
    pub item_id: String,
    pub rank: usize,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExposureEvent {
    pub schema_version: String,
    pub ts: DateTime<Utc>,
    pub request_id: String,
    pub tenant_id: Uuid,
    pub namespace: String,
    pub surface: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub segment_id: String,
    /// Salted hash of the subject; raw ids are never written.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub subject_hash: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub session_hash: String,
    pub items: Vec<ExposedItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experiment: Option<ExperimentRef>,
    pub model_version: String,
    pub algo_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rules_version: Option<String>,
}

/// Hex SHA-256 of `"{salt}:{id}"`; empty for an empty id.
pub fn hash_subject(salt: &str, id: &str) -> String {
    if id.is_empty() {
        return String::new();
    }
    let digest = Sha256::new()
        .chain_update(salt.as_bytes())
        .chain_update(b":")
        .chain_update(id.as_bytes())
        .finalize();
    hex::encode(digest)
}

pub trait ExposureLogger: Send + Sync {
    /// Hand off one event. Never blocks the caller.
    fn log(&self, event: ExposureEvent);
}

// ─── JSON lines file ────────────────────────────────────────────────────────

/// Appends events to a file through a background writer task.
pub struct JsonlExposureLogger {
    sender: Mutex<Option<mpsc::Sender<ExposureEvent>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    path: PathBuf,
}

impl JsonlExposureLogger {
    /// Open (or create) `path` for appending and spawn the writer.
    pub async fn open(path: impl AsRef<Path>) -> RecsysResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| RecsysError::internal(format!("exposure dir: {e}")))?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| RecsysError::internal(format!("exposure file: {e}")))?;

        let (sender, receiver) = mpsc::channel(CHANNEL_CAPACITY);
        let writer = tokio::spawn(write_loop(BufWriter::new(file), receiver));
        info!(path = %path.display(), "Exposure logger initialized");
        Ok(Self {
            sender: Mutex::new(Some(sender)),
            writer: Mutex::new(Some(writer)),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Close the channel and wait for the writer to drain and flush.
    /// Events logged afterwards are dropped.
    pub async fn shutdown(&self) {
        drop(self.sender.lock().take());
        let Some(mut writer) = self.writer.lock().take() else {
            return;
        };
        match tokio::time::timeout(DRAIN_TIMEOUT, &mut writer).await {
            Ok(Ok(())) => info!(path = %self.path.display(), "Exposure log flushed"),
            Ok(Err(e)) => error!(error = %e, "Exposure writer task failed"),
            Err(_) => {
                writer.abort();
                warn!(path = %self.path.display(), "Exposure drain timed out");
            }
        }
    }
}

impl ExposureLogger for JsonlExposureLogger {
    fn log(&self, event: ExposureEvent) {
        let guard = self.sender.lock();
        let Some(sender) = guard.as_ref() else {
            metrics::counter!("recsys.exposure.dropped").increment(1);
            return;
        };
        if let Err(e) = sender.try_send(event) {
            metrics::counter!("recsys.exposure.dropped").increment(1);
            warn!("Exposure event dropped: {}", e);
        }
    }
}

async fn write_loop(mut out: BufWriter<tokio::fs::File>, mut receiver: mpsc::Receiver<ExposureEvent>) {
    let mut interval = tokio::time::interval(FLUSH_INTERVAL);
    let mut pending = 0usize;
    loop {
        tokio::select! {
            event = receiver.recv() => {
                let Some(event) = event else {
                    break;
                };
                match serde_json::to_vec(&event) {
                    Ok(mut line) => {
                        line.push(b'\n');
                        if let Err(e) = out.write_all(&line).await {
                            error!(error = %e, "Exposure write failed");
                            continue;
                        }
                        pending += 1;
                        metrics::counter!("recsys.exposure.written").increment(1);
                    }
                    Err(e) => error!(error = %e, "Exposure event not serializable"),
                }
            }
            _ = interval.tick() => {
                if pending > 0 {
                    if let Err(e) = out.flush().await {
                        error!(error = %e, "Exposure flush failed");
                    }
                    debug!(count = pending, "Flushed exposure events");
                    pending = 0;
                }
            }
        }
    }
    if let Err(e) = out.flush().await {
        error!(error = %e, "Exposure flush failed");
    }
}

// ─── In memory ──────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryExposureLogger {
    events: Mutex<Vec<ExposureEvent>>,
}

impl MemoryExposureLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ExposureEvent> {
        self.events.lock().clone()
    }
}

impl ExposureLogger for MemoryExposureLogger {
    fn log(&self, event: ExposureEvent) {
        self.events.lock().push(event);
    }
}
