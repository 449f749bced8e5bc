//! Starts caches and controllers in the right order.
//!
//! A controller must not process requests before every cache it watches has
//! delivered its initial list. The manager starts each distinct cache once,
//! waits for all of them to sync, then runs every controller until shutdown.

use std::sync::Arc;

use fleet_cluster::Cluster;
use futures::future::try_join_all;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::controller::Controller;
use crate::error::{Error, Result};

/// Owns a set of controllers and the caches they watch.
#[derive(Debug, Default)]
pub struct Manager {
    controllers: Vec<Arc<Controller>>,
}

impl Manager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a controller whose watches are already registered.
    pub fn add(&mut self, controller: Controller) -> Arc<Controller> {
        let controller = Arc::new(controller);
        self.controllers.push(Arc::clone(&controller));
        controller
    }

    pub fn controllers(&self) -> &[Arc<Controller>] {
        &self.controllers
    }

    /// Every distinct cache watched by any controller, in first-seen order.
    pub fn caches(&self) -> Vec<Arc<dyn Cluster>> {
        let mut caches: Vec<Arc<dyn Cluster>> = Vec::new();
        for cache in self.controllers.iter().flat_map(|c| c.caches()) {
            if !caches.iter().any(|seen| Arc::ptr_eq(seen, cache)) {
                caches.push(Arc::clone(cache));
            }
        }
        caches
    }

    /// Start every cache, wait for them to sync, then run every controller
    /// until `token` is cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CacheFailed`] if a cache stops before syncing and
    /// [`Error::CacheSyncFailed`] if a cache never syncs. Cancelling `token`
    /// before the caches sync is a clean shutdown and returns `Ok(())`.
    pub async fn start(&self, token: CancellationToken) -> Result<()> {
        let caches = self.caches();
        info!(
            caches = caches.len(),
            controllers = self.controllers.len(),
            "Starting manager"
        );

        let mut running = JoinSet::new();
        for cache in &caches {
            let cache = Arc::clone(cache);
            let cache_token = token.clone();
            running.spawn(async move {
                let stopped = cache.start(cache_token).await;
                (cache.name().to_string(), stopped)
            });
        }

        let synced = tokio::select! {
            synced = wait_for_sync(&caches, &token) => synced,
            Some(exited) = running.join_next() => match exited {
                Ok((name, Err(e))) => Err(Error::cache_failed(name, e.to_string())),
                _ if token.is_cancelled() => Ok(false),
                Ok((name, Ok(()))) => Err(Error::cache_failed(name, "stopped before syncing")),
                Err(e) => Err(Error::cache_failed("unknown", e.to_string())),
            },
        };
        match synced {
            Ok(true) => {}
            Ok(false) => {
                info!("Shutdown requested before caches synced");
                return Ok(());
            }
            Err(e) => {
                token.cancel();
                return Err(e);
            }
        }

        info!("Caches synced, starting controllers");
        try_join_all(self.controllers.iter().map(|c| c.start(token.clone()))).await?;

        while let Some(exited) = running.join_next().await {
            match exited {
                Ok((_, Ok(()))) => {}
                Ok((name, Err(e))) => warn!(cluster = %name, error = %e, "Cache stopped with error"),
                Err(e) => warn!(error = %e, "Cache task failed"),
            }
        }
        info!("Manager stopped");
        Ok(())
    }
}

/// `Ok(true)` once every cache has synced, `Ok(false)` if `token` is cancelled
/// first.
async fn wait_for_sync(caches: &[Arc<dyn Cluster>], token: &CancellationToken) -> Result<bool> {
    for cache in caches {
        if !cache.wait_for_cache_sync(token).await {
            if token.is_cancelled() {
                return Ok(false);
            }
            return Err(Error::cache_sync_failed(cache.name()));
        }
        debug!(cluster = %cache.name(), "Cache synced");
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::time::Duration;

    use async_trait::async_trait;
    use fleet_cluster::{Cache, ClusterOptions, InMemoryCluster, ResourceEventHandler};
    use fleet_core::{DynamicObject, ResourceKind};

    use super::*;
    use crate::controller::ControllerOptions;
    use crate::reconciler::ReconcilerFn;
    use crate::types::ReconcileResult;
    use crate::watch::WatchOptions;

    fn pod_kind() -> ResourceKind {
        ResourceKind::new("", "v1", "Pod")
    }

    fn noop_controller() -> Controller {
        let reconciler =
            ReconcilerFn::new(|_req| async { Ok::<_, Error>(ReconcileResult::done()) });
        Controller::new("test", Arc::new(reconciler), ControllerOptions::default()).unwrap()
    }

    /// A cache that fails to start.
    struct Broken;

    #[async_trait]
    impl Cache for Broken {
        async fn start(&self, _token: CancellationToken) -> fleet_core::Result<()> {
            Err(fleet_core::Error::cache_unavailable("broken", "no such cluster"))
        }

        async fn wait_for_cache_sync(&self, token: &CancellationToken) -> bool {
            token.cancelled().await;
            false
        }
    }

    #[async_trait]
    impl Cluster for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        async fn add_event_handler(
            &self,
            _token: &CancellationToken,
            _kind: &ResourceKind,
            _handler: Arc<dyn ResourceEventHandler>,
        ) -> fleet_core::Result<()> {
            Ok(())
        }

        fn client(&self) -> fleet_core::Result<Arc<dyn fleet_cluster::Client>> {
            Err(fleet_core::Error::client_unavailable("broken", "no such cluster"))
        }
    }

    /// A cache that never syncs and runs until cancelled.
    struct Stalled;

    #[async_trait]
    impl Cache for Stalled {
        async fn start(&self, token: CancellationToken) -> fleet_core::Result<()> {
            token.cancelled().await;
            Ok(())
        }

        async fn wait_for_cache_sync(&self, token: &CancellationToken) -> bool {
            token.cancelled().await;
            false
        }
    }

    #[async_trait]
    impl Cluster for Stalled {
        fn name(&self) -> &str {
            "stalled"
        }

        async fn add_event_handler(
            &self,
            _token: &CancellationToken,
            _kind: &ResourceKind,
            _handler: Arc<dyn ResourceEventHandler>,
        ) -> fleet_core::Result<()> {
            Ok(())
        }

        fn client(&self) -> fleet_core::Result<Arc<dyn fleet_cluster::Client>> {
            Err(fleet_core::Error::client_unavailable("stalled", "not synced"))
        }
    }

    #[tokio::test]
    async fn test_caches_are_deduplicated_across_controllers() {
        let token = CancellationToken::new();
        let c1: Arc<dyn Cluster> = Arc::new(InMemoryCluster::new("c1", ClusterOptions::default()));
        let c2: Arc<dyn Cluster> = Arc::new(InMemoryCluster::new("c2", ClusterOptions::default()));

        let mut a = noop_controller();
        a.watch_resource_reconcile_object(&token, Arc::clone(&c1), &pod_kind(), WatchOptions::new())
            .await
            .unwrap();
        a.watch_resource_reconcile_object(&token, Arc::clone(&c1), &pod_kind(), WatchOptions::new())
            .await
            .unwrap();
        let mut b = noop_controller();
        b.watch_resource_reconcile_object(&token, Arc::clone(&c2), &pod_kind(), WatchOptions::new())
            .await
            .unwrap();
        b.watch_resource_reconcile_object(&token, Arc::clone(&c1), &pod_kind(), WatchOptions::new())
            .await
            .unwrap();

        let mut manager = Manager::new();
        manager.add(a);
        manager.add(b);

        let names: Vec<_> = manager.caches().iter().map(|c| c.name().to_string()).collect();
        assert_eq!(names, vec!["c1", "c2"]);
    }

    #[tokio::test]
    async fn test_start_fails_when_a_cache_fails() {
        let token = CancellationToken::new();
        let mut controller = noop_controller();
        controller
            .watch_resource_reconcile_object(&token, Arc::new(Broken), &pod_kind(), WatchOptions::new())
            .await
            .unwrap();
        let mut manager = Manager::new();
        manager.add(controller);

        let err = manager.start(token.clone()).await.unwrap_err();
        assert!(matches!(err, Error::CacheFailed { ref cluster, .. } if cluster == "broken"));
        assert!(token.is_cancelled());
    }

    /// Given a cache that has not synced
    /// When the token is cancelled
    /// Then start returns Ok without starting any controller
    #[tokio::test]
    async fn test_cancel_before_sync_is_clean_shutdown() {
        let token = CancellationToken::new();
        let mut controller = noop_controller();
        controller
            .watch_resource_reconcile_object(&token, Arc::new(Stalled), &pod_kind(), WatchOptions::new())
            .await
            .unwrap();
        let mut manager = Manager::new();
        let controller = manager.add(controller);

        let run_token = token.clone();
        let handle = tokio::spawn(async move { manager.start(run_token).await });
        tokio::task::yield_now().await;
        token.cancel();

        let stopped = tokio::time::timeout(Duration::from_secs(5), handle).await;
        assert!(stopped.unwrap().unwrap().is_ok());
        assert!(!controller.queue().is_shutting_down(), "controller never started");
    }

    /// Given a controller watching pods in a cluster with existing pods
    /// When the manager starts
    /// Then every pod is reconciled and start returns after cancellation
    #[tokio::test]
    async fn test_start_syncs_caches_then_runs_controllers() {
        let token = CancellationToken::new();
        let memory = Arc::new(InMemoryCluster::new("c1", ClusterOptions::default()));
        let client = memory.client().unwrap();
        client.create(DynamicObject::new(pod_kind(), "default", "pod-a")).await.unwrap();
        client.create(DynamicObject::new(pod_kind(), "default", "pod-b")).await.unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let reconciler = ReconcilerFn::new(move |req: crate::Request| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(req.to_string());
                Ok(ReconcileResult::done())
            }
        });
        let mut controller =
            Controller::new("pods", Arc::new(reconciler), ControllerOptions::default()).unwrap();
        controller
            .watch_resource_reconcile_object(&token, memory.clone(), &pod_kind(), WatchOptions::new())
            .await
            .unwrap();

        let mut manager = Manager::new();
        manager.add(controller);
        let run_token = token.clone();
        let handle = tokio::spawn(async move { manager.start(run_token).await });

        let mut seen = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()];
        seen.sort();
        assert_eq!(seen, vec!["c1/default/pod-a", "c1/default/pod-b"]);

        token.cancel();
        let stopped = tokio::time::timeout(Duration::from_secs(5), handle).await;
        assert!(stopped.unwrap().unwrap().is_ok());
    }
}
