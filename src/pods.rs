//! The demo reconciler: look the pod up and log where it lives.

use async_trait::async_trait;
use fleet_core::ResourceKind;
use fleet_reconciler::{Error, ReconcileResult, Reconciler, Request};
use tracing::info;

pub fn pod_kind() -> ResourceKind {
    ResourceKind::new("", "v1", "Pod")
}

/// Reads each requested pod through the request's cluster client.
pub struct PodReconciler;

#[async_trait]
impl Reconciler for PodReconciler {
    async fn reconcile(&self, request: Request) -> fleet_reconciler::Result<ReconcileResult> {
        let client = request.client().ok_or_else(|| {
            Error::reconcile_failed(format!("no client for cluster '{}'", request.cluster_name()))
        })?;

        match client.get(&pod_kind(), request.namespace(), request.name()).await {
            Ok(pod) => {
                info!(
                    cluster = %request.cluster_name(),
                    name = %request.name(),
                    namespace = %request.namespace(),
                    uid = pod.metadata.uid.as_deref().unwrap_or_default(),
                    generation = pod.metadata.generation,
                    "Reconciled pod"
                );
                Ok(ReconcileResult::done())
            }
            Err(e) if e.is_not_found() => {
                info!(request = %request, "Pod is gone");
                Ok(ReconcileResult::done())
            }
            Err(e) => Err(e.into()),
        }
    }
}
