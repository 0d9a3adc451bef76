//! One live backend shared by many runs.
//!
//! A live simulation cannot take concurrent commands, even from different
//! runs. `SharedBackend` hands out leases on a backend-scoped async mutex;
//! callers hold one across each call, so calls from different runs never
//! overlap. It is separate from per-run sequencing: each engine still runs
//! its own steps in order, and the lock only interleaves whole calls. The
//! calls themselves do not lock, so time spent queued for the lease is not
//! charged to a call's timeout.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::trace;

use super::{AdvanceOutcome, BackendLease, BackendResult, Environment, ExecOutcome, Observation};
use crate::domain::ValidatedAction;

/// Cloneable handle; every clone shares the same backend and lock.
#[derive(Clone)]
pub struct SharedBackend {
    inner: Arc<dyn Environment>,
    lock: Arc<Mutex<()>>,
}

impl SharedBackend {
    pub fn new(inner: Arc<dyn Environment>) -> Self {
        Self {
            inner,
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// The wrapped backend.
    pub fn inner(&self) -> &Arc<dyn Environment> {
        &self.inner
    }
}

impl std::fmt::Debug for SharedBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedBackend")
            .field("kind", &self.inner.kind())
            .finish()
    }
}

#[async_trait]
impl Environment for SharedBackend {
    fn kind(&self) -> &str {
        self.inner.kind()
    }

    async fn lease(&self) -> BackendLease {
        BackendLease::exclusive(Arc::clone(&self.lock).lock_owned().await)
    }

    async fn pause(&self) -> BackendResult<()> {
        trace!(op = "pause", "shared backend call");
        self.inner.pause().await
    }

    async fn observe(&self) -> BackendResult<Observation> {
        trace!(op = "observe", "shared backend call");
        self.inner.observe().await
    }

    async fn execute(&self, action: &ValidatedAction) -> BackendResult<ExecOutcome> {
        trace!(op = "execute", "shared backend call");
        self.inner.execute(action).await
    }

    async fn advance(&self, ticks: u32) -> BackendResult<AdvanceOutcome> {
        trace!(op = "advance", "shared backend call");
        self.inner.advance(ticks).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::MockEnvironment;
    use std::time::Duration;

    #[tokio::test]
    async fn calls_through_clones_never_overlap() {
        let mock = Arc::new(MockEnvironment::default().with_latency(Duration::from_millis(5)));
        let shared = SharedBackend::new(mock.clone());

        let mut handles = Vec::new();
        for _ in 0..4 {
            let backend = shared.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..3 {
                    let lease = backend.lease().await;
                    assert!(lease.is_exclusive());
                    backend.observe().await.unwrap();
                    drop(lease);

                    let _lease = backend.lease().await;
                    backend.advance(10).await.unwrap();
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(mock.peak_in_flight(), 1);
        assert_eq!(shared.kind(), "mock");
    }

    #[tokio::test]
    async fn unshared_backend_does_overlap() {
        let mock = Arc::new(MockEnvironment::default().with_latency(Duration::from_millis(20)));
        let a = mock.clone();
        let b = mock.clone();
        assert!(!a.lease().await.is_exclusive());
        let (ra, rb) = tokio::join!(a.observe(), b.observe());
        ra.unwrap();
        rb.unwrap();
        assert_eq!(mock.peak_in_flight(), 2);
    }
}
