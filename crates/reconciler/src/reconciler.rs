//! The user-supplied reconciliation logic.

use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{ReconcileResult, Request};

/// Drives the object named by a [`Request`] towards its desired state.
///
/// Implementations must be idempotent: the same request may be delivered
/// many times, and a request only says *which* object changed, never *how*.
#[async_trait]
pub trait Reconciler: Send + Sync {
    /// Reconcile one request.
    ///
    /// # Errors
    ///
    /// An error requeues the request with backoff and pauses the worker that
    /// ran it.
    async fn reconcile(&self, request: Request) -> Result<ReconcileResult>;
}

/// Adapts an async closure into a [`Reconciler`].
pub struct ReconcilerFn<F, Fut> {
    f: F,
    _fut: PhantomData<fn() -> Fut>,
}

impl<F, Fut> ReconcilerFn<F, Fut>
where
    F: Fn(Request) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ReconcileResult>> + Send,
{
    /// Wrap `f`.
    pub fn new(f: F) -> Self {
        Self {
            f,
            _fut: PhantomData,
        }
    }
}

#[async_trait]
impl<F, Fut> Reconciler for ReconcilerFn<F, Fut>
where
    F: Fn(Request) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ReconcileResult>> + Send,
{
    async fn reconcile(&self, request: Request) -> Result<ReconcileResult> {
        (self.f)(request).await
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use fleet_cluster::{ClusterOptions, InMemoryCluster};

    use super::*;
    use crate::error::Error;

    #[tokio::test]
    async fn test_reconciler_fn_forwards_request_and_result() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let reconciler = ReconcilerFn::new(move |req: Request| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if req.name() == "broken" {
                    Err(Error::reconcile_failed("broken"))
                } else {
                    Ok(ReconcileResult::requeue_after(Duration::from_secs(5)))
                }
            }
        });

        let cluster = Arc::new(InMemoryCluster::new("c1", ClusterOptions::default()));
        let ok = reconciler
            .reconcile(Request::new(cluster.clone(), "default", "pod-a"))
            .await
            .unwrap();
        assert_eq!(ok.requeue_after, Duration::from_secs(5));

        let err = reconciler
            .reconcile(Request::new(cluster, "default", "broken"))
            .await;
        assert!(err.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
