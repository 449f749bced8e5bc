//! The capability set the reconciliation core needs from a cluster backend.

use std::sync::Arc;

use async_trait::async_trait;
use fleet_core::{DynamicObject, ResourceKind, Result};
use tokio_util::sync::CancellationToken;

use crate::handler::ResourceEventHandler;

/// A startable, syncable object cache.
///
/// The manager starts every cache a controller watches and waits for it to
/// sync before any worker runs.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Run the cache until `token` is cancelled.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache cannot be constructed or started.
    async fn start(&self, token: CancellationToken) -> Result<()>;

    /// Wait until the initial list has been delivered to every handler.
    ///
    /// Returns `false` if `token` is cancelled first.
    async fn wait_for_cache_sync(&self, token: &CancellationToken) -> bool;
}

/// Read/write access to one cluster's objects.
#[async_trait]
pub trait Client: Send + Sync {
    /// Fetch one object.
    async fn get(&self, kind: &ResourceKind, namespace: &str, name: &str) -> Result<DynamicObject>;

    /// List objects of `kind`, optionally restricted to one namespace.
    async fn list(&self, kind: &ResourceKind, namespace: Option<&str>) -> Result<Vec<DynamicObject>>;

    /// Create a new object.
    async fn create(&self, obj: DynamicObject) -> Result<DynamicObject>;

    /// Replace an existing object.
    async fn update(&self, obj: DynamicObject) -> Result<DynamicObject>;

    /// Delete an object.
    async fn delete(&self, kind: &ResourceKind, namespace: &str, name: &str) -> Result<()>;
}

/// One independently-addressable cluster.
#[async_trait]
pub trait Cluster: Cache {
    /// Name identifying this cluster in requests and logs.
    fn name(&self) -> &str;

    /// Route add/update/delete events for `kind` through `handler`.
    ///
    /// # Errors
    ///
    /// Returns an error if the informer for `kind` cannot be established.
    async fn add_event_handler(
        &self,
        token: &CancellationToken,
        kind: &ResourceKind,
        handler: Arc<dyn ResourceEventHandler>,
    ) -> Result<()>;

    /// A client for reconciliation logic. Repeated calls return the same handle.
    ///
    /// # Errors
    ///
    /// Returns an error if the client cannot be constructed.
    fn client(&self) -> Result<Arc<dyn Client>>;
}

impl std::fmt::Debug for dyn Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster").field("name", &self.name()).finish()
    }
}
