//! Request-scoped identity, deadline and cancellation.

use crate::error::{RecsysError, RecsysResult};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use uuid::Uuid;

/// Cloneable cancellation signal shared by every task of one request.
#[derive(Clone, Debug)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Debug)]
pub struct RequestCtx {
    pub request_id: String,
    pub tenant_id: Uuid,
    pub deadline: Option<Instant>,
    pub cancel: CancelToken,
}

impl RequestCtx {
    pub fn new(request_id: impl Into<String>, tenant_id: Uuid) -> Self {
        Self {
            request_id: request_id.into(),
            tenant_id,
            deadline: None,
            cancel: CancelToken::new(),
        }
    }

    /// Context for work not tied to an inbound request.
    pub fn background(tenant_id: Uuid) -> Self {
        Self::new(Uuid::new_v4().to_string(), tenant_id)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn is_done(&self) -> bool {
        self.cancel.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Run `fut` unless the request is cancelled or its deadline passes
    /// first, in which case the future is dropped and `Cancelled` returned.
    pub async fn run<F, T>(&self, fut: F) -> RecsysResult<T>
    where
        F: Future<Output = RecsysResult<T>>,
    {
        if self.is_done() {
            return Err(RecsysError::Cancelled);
        }
        let deadline = async {
            match self.deadline {
                Some(d) => tokio::time::sleep_until(d).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(RecsysError::Cancelled),
            _ = deadline => Err(RecsysError::Cancelled),
            res = fut => res,
        }
    }
}
