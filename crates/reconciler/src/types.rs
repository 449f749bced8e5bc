//! Core types for the reconciler.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use fleet_cluster::{Client, Cluster};
use fleet_core::{NamespacedName, ResultExt};

/// What to reconcile, and where.
///
/// Two requests are equal when they name the same cluster, namespace and
/// name; the queue relies on this to collapse duplicate events.
#[derive(Clone)]
pub struct Request {
    cluster: Arc<dyn Cluster>,
    key: NamespacedName,
}

impl Request {
    /// Create a request for `namespace/name` in `cluster`.
    ///
    /// `namespace` is empty for cluster-scoped resources.
    pub fn new(
        cluster: Arc<dyn Cluster>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            cluster,
            key: NamespacedName::new(namespace, name),
        }
    }

    /// Name of the cluster this request belongs to.
    pub fn cluster_name(&self) -> &str {
        self.cluster.name()
    }

    pub fn namespace(&self) -> &str {
        &self.key.namespace
    }

    pub fn name(&self) -> &str {
        &self.key.name
    }

    pub fn namespaced_name(&self) -> &NamespacedName {
        &self.key
    }

    /// The cluster collaborator this request resolves to.
    pub fn cluster(&self) -> &Arc<dyn Cluster> {
        &self.cluster
    }

    /// A client for the request's cluster.
    ///
    /// Failing to build the client is logged and yields `None`.
    pub fn client(&self) -> Option<Arc<dyn Client>> {
        self.cluster.client().into_option_logged()
    }

    /// A request without a name cannot be reconciled.
    pub fn is_valid(&self) -> bool {
        !self.key.name.is_empty()
    }
}

impl PartialEq for Request {
    fn eq(&self, other: &Self) -> bool {
        self.cluster_name() == other.cluster_name() && self.key == other.key
    }
}

impl Eq for Request {}

impl Hash for Request {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.cluster_name().hash(state);
        self.key.hash(state);
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("cluster", &self.cluster_name())
            .field("namespace", &self.key.namespace)
            .field("name", &self.key.name)
            .finish()
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.cluster_name(), self.key)
    }
}

/// Outcome of one successful reconciliation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileResult {
    /// Requeue through the rate limiter.
    pub requeue: bool,
    /// Requeue after this delay. Zero means unset; a non-zero value wins over
    /// `requeue`.
    pub requeue_after: Duration,
}

impl ReconcileResult {
    /// Converged: nothing left to do.
    pub fn done() -> Self {
        Self::default()
    }

    /// Try again, subject to the item's backoff.
    pub fn requeue() -> Self {
        Self {
            requeue: true,
            ..Self::default()
        }
    }

    /// Try again once `delay` has elapsed.
    pub fn requeue_after(delay: Duration) -> Self {
        Self {
            requeue_after: delay,
            ..Self::default()
        }
    }

    /// How the dispatch loop should treat the request.
    pub fn disposition(&self) -> Disposition {
        if !self.requeue_after.is_zero() {
            Disposition::RequeueAfter(self.requeue_after)
        } else if self.requeue {
            Disposition::RequeueRateLimited
        } else {
            Disposition::Forget
        }
    }
}

/// What happens to a request after a successful reconcile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Converged; reset the item's backoff.
    Forget,
    /// Re-add after a fixed delay.
    RequeueAfter(Duration),
    /// Re-add through the rate limiter.
    RequeueRateLimited,
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::collections::HashSet;

    use fleet_cluster::{ClusterOptions, InMemoryCluster};

    use super::*;

    fn cluster(name: &str) -> Arc<dyn Cluster> {
        Arc::new(InMemoryCluster::new(name, ClusterOptions::default()))
    }

    #[test]
    fn test_requests_compare_by_cluster_name_and_key() {
        let c1 = cluster("c1");
        let same_name = cluster("c1");
        let other = cluster("c2");

        let a = Request::new(Arc::clone(&c1), "default", "pod-a");
        let b = Request::new(same_name, "default", "pod-a");
        let c = Request::new(other, "default", "pod-a");
        let d = Request::new(c1, "kube-system", "pod-a");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);

        let set: HashSet<_> = [a.clone(), b, c, d, a].into_iter().collect();
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn test_request_display_and_validity() {
        let req = Request::new(cluster("c1"), "default", "pod-a");
        assert_eq!(req.to_string(), "c1/default/pod-a");
        assert!(req.is_valid());

        let cluster_scoped = Request::new(cluster("c1"), "", "node-1");
        assert_eq!(cluster_scoped.to_string(), "c1/node-1");
        assert!(cluster_scoped.is_valid());

        assert!(!Request::new(cluster("c1"), "default", "").is_valid());
    }

    #[test]
    fn test_request_client_is_stable() {
        let req = Request::new(cluster("c1"), "default", "pod-a");
        let first = req.client().unwrap();
        let second = req.client().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_requeue_after_takes_precedence() {
        let result = ReconcileResult {
            requeue: true,
            requeue_after: Duration::from_secs(2),
        };
        assert_eq!(
            result.disposition(),
            Disposition::RequeueAfter(Duration::from_secs(2))
        );
        assert_eq!(
            ReconcileResult::requeue().disposition(),
            Disposition::RequeueRateLimited
        );
        assert_eq!(ReconcileResult::done().disposition(), Disposition::Forget);
    }
}
