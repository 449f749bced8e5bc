//! Translate cluster events into requests.

use std::sync::Arc;

use fleet_cluster::{Cluster, ResourceEventHandler};
use fleet_core::{DynamicObject, NamespacedName, ResourceKind, ResultExt};
use itertools::Itertools;
use tracing::{debug, trace};

use crate::queue::Queue;
use crate::types::Request;
use crate::watch::WatchOptions;

/// Which owner references resolve to a request in [`EnqueueMode::Owner`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerSpec {
    /// Owner group and kind. The version is ignored when matching.
    pub kind: ResourceKind,
    /// Only follow the reference marked `controller: true`.
    pub controller_only: bool,
    /// The owner is cluster-scoped, so requests carry an empty namespace.
    pub cluster_scoped: bool,
}

impl OwnerSpec {
    pub fn new(kind: ResourceKind) -> Self {
        Self {
            kind,
            controller_only: false,
            cluster_scoped: false,
        }
    }

    #[must_use]
    pub fn controller_only(mut self) -> Self {
        self.controller_only = true;
        self
    }

    #[must_use]
    pub fn cluster_scoped(mut self) -> Self {
        self.cluster_scoped = true;
        self
    }

    fn owners_of(&self, obj: &DynamicObject) -> Vec<NamespacedName> {
        let namespace = if self.cluster_scoped {
            ""
        } else {
            obj.metadata.namespace_or_empty()
        };
        obj.metadata
            .owner_references
            .iter()
            .filter(|owner| owner.resource_kind().same_group_kind(&self.kind))
            .filter(|owner| !self.controller_only || owner.is_controller())
            .filter(|owner| !owner.name.is_empty())
            .map(|owner| NamespacedName::new(namespace, owner.name.clone()))
            .collect()
    }
}

/// How an event names the request it produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueMode {
    /// The observed object itself.
    Object,
    /// The observed object's owners.
    Owner(OwnerSpec),
}

/// Event handler that filters events and enqueues requests for one cluster.
///
/// Never blocks: queue insertion is immediate and duplicate requests collapse
/// in the queue.
pub struct EnqueueRequestHandler {
    cluster: Arc<dyn Cluster>,
    queue: Arc<dyn Queue<Request>>,
    mode: EnqueueMode,
    options: WatchOptions,
}

impl EnqueueRequestHandler {
    pub fn new(
        cluster: Arc<dyn Cluster>,
        queue: Arc<dyn Queue<Request>>,
        mode: EnqueueMode,
        options: WatchOptions,
    ) -> Self {
        Self {
            cluster,
            queue,
            mode,
            options,
        }
    }

    /// Enqueue the observed object.
    pub fn for_object(
        cluster: Arc<dyn Cluster>,
        queue: Arc<dyn Queue<Request>>,
        options: WatchOptions,
    ) -> Self {
        Self::new(cluster, queue, EnqueueMode::Object, options)
    }

    /// Enqueue the observed object's owners of kind `owner.kind`.
    pub fn for_owner(
        cluster: Arc<dyn Cluster>,
        queue: Arc<dyn Queue<Request>>,
        owner: OwnerSpec,
        options: WatchOptions,
    ) -> Self {
        Self::new(cluster, queue, EnqueueMode::Owner(owner), options)
    }

    pub fn mode(&self) -> &EnqueueMode {
        &self.mode
    }

    fn keys_for(&self, obj: &DynamicObject) -> Vec<NamespacedName> {
        match &self.mode {
            EnqueueMode::Object => obj
                .namespaced_name()
                .inspect_error(|e| {
                    debug!(cluster = %self.cluster.name(), error = %e, "Dropping event");
                })
                .ok()
                .into_iter()
                .collect(),
            EnqueueMode::Owner(spec) => spec.owners_of(obj),
        }
    }

    fn enqueue(&self, keys: impl IntoIterator<Item = NamespacedName>) {
        for key in keys {
            trace!(cluster = %self.cluster.name(), key = %key, "Enqueueing request");
            self.queue
                .add(Request::new(Arc::clone(&self.cluster), key.namespace, key.name));
        }
    }
}

impl ResourceEventHandler for EnqueueRequestHandler {
    fn on_add(&self, obj: &DynamicObject) {
        if self.options.accepts_create(obj) {
            self.enqueue(self.keys_for(obj));
        }
    }

    fn on_update(&self, old: &DynamicObject, new: &DynamicObject) {
        if !self.options.accepts_update(old, new) {
            return;
        }
        match &self.mode {
            EnqueueMode::Object => self.enqueue(self.keys_for(new)),
            EnqueueMode::Owner(spec) => {
                // An owner reference may have been added or dropped.
                let keys = spec.owners_of(old).into_iter().chain(spec.owners_of(new)).unique();
                self.enqueue(keys);
            }
        }
    }

    fn on_delete(&self, obj: &DynamicObject) {
        if self.options.accepts_delete(obj) {
            self.enqueue(self.keys_for(obj));
        }
    }
}
