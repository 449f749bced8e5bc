//! In-memory cluster backend.
//!
//! Plays the role of an API server plus informer cache for one cluster:
//! objects live in a shared store, writes through the [`Client`] fan out
//! add/update/delete events to every handler registered for that kind, and
//! `start` replays the initial list before reporting the cache as synced.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use fleet_core::{DynamicObject, Error, NamespacedName, ResourceKind, Result};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cluster::{Cache, Client, Cluster};
use crate::handler::ResourceEventHandler;

/// Configuration for the cluster's cache.
#[derive(Debug, Clone, Default)]
pub struct CacheOptions {
    /// Period between resyncs. A resync re-delivers every cached object to
    /// every handler as an update with `old == new`.
    pub resync: Option<Duration>,
    /// Restrict the cache to a single namespace. `None` watches all namespaces.
    pub namespace: Option<String>,
}

/// Options for [`InMemoryCluster::new`].
#[derive(Debug, Clone, Default)]
pub struct ClusterOptions {
    pub cache: CacheOptions,
}

type Handlers = Vec<Arc<dyn ResourceEventHandler>>;

#[derive(Default)]
struct Store {
    objects: BTreeMap<ResourceKind, BTreeMap<NamespacedName, DynamicObject>>,
    informers: HashMap<ResourceKind, Handlers>,
    resource_version: u64,
    uid: u64,
}

impl Store {
    fn next_resource_version(&mut self) -> String {
        self.resource_version = self.resource_version.saturating_add(1);
        self.resource_version.to_string()
    }

    fn next_uid(&mut self) -> String {
        self.uid = self.uid.saturating_add(1);
        format!("uid-{:08}", self.uid)
    }

    fn handlers(&self, kind: &ResourceKind) -> Handlers {
        self.informers.get(kind).cloned().unwrap_or_default()
    }
}

/// State shared between a cluster and its clones.
struct Shared {
    store: RwLock<Store>,
    options: ClusterOptions,
    started: AtomicBool,
    stopped: AtomicBool,
    synced: watch::Sender<bool>,
}

impl Shared {
    fn read(&self) -> RwLockReadGuard<'_, Store> {
        self.store.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Store> {
        self.store.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn in_scope(&self, namespace: &str) -> bool {
        self.options
            .cache
            .namespace
            .as_deref()
            .is_none_or(|scope| scope == namespace)
    }

    fn delivering(&self) -> bool {
        self.started.load(Ordering::Acquire) && !self.stopped.load(Ordering::Acquire)
    }

    /// Every in-scope object of `kind` together with its handlers.
    fn snapshot(&self, kind: &ResourceKind) -> (Vec<DynamicObject>, Handlers) {
        let store = self.read();
        let objects = store
            .objects
            .get(kind)
            .map(|by_key| {
                by_key
                    .iter()
                    .filter(|(key, _)| self.in_scope(&key.namespace))
                    .map(|(_, obj)| obj.clone())
                    .collect()
            })
            .unwrap_or_default();
        (objects, store.handlers(kind))
    }

    fn kinds(&self) -> Vec<ResourceKind> {
        self.read().informers.keys().cloned().collect()
    }

    fn replay(&self, as_update: bool) {
        for kind in self.kinds() {
            let (objects, handlers) = self.snapshot(&kind);
            for obj in &objects {
                for handler in &handlers {
                    if as_update {
                        handler.on_update(obj, obj);
                    } else {
                        handler.on_add(obj);
                    }
                }
            }
        }
    }
}

/// A cluster whose API server and cache live in process memory.
///
/// Cloning via [`InMemoryCluster::clone_with_name`] shares the store and the
/// informers under a different cluster name. Each handle keeps its own client.
pub struct InMemoryCluster {
    name: String,
    shared: Arc<Shared>,
    client: OnceLock<Arc<InMemoryClient>>,
}

impl InMemoryCluster {
    /// Create an empty cluster.
    pub fn new(name: impl Into<String>, options: ClusterOptions) -> Self {
        let (synced, _) = watch::channel(false);
        Self {
            name: name.into(),
            shared: Arc::new(Shared {
                store: RwLock::new(Store::default()),
                options,
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                synced,
            }),
            client: OnceLock::new(),
        }
    }

    /// Same store and cache, known under another name.
    ///
    /// Useful when one cluster is known to others by different names; the
    /// cache is not duplicated.
    #[must_use]
    pub fn clone_with_name(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            shared: Arc::clone(&self.shared),
            client: OnceLock::new(),
        }
    }

    /// Whether the initial list has been delivered.
    pub fn is_synced(&self) -> bool {
        *self.shared.synced.borrow()
    }

    /// Number of handlers registered for `kind`.
    pub fn handler_count(&self, kind: &ResourceKind) -> usize {
        self.shared.read().informers.get(kind).map_or(0, Vec::len)
    }

    fn in_memory_client(&self) -> Arc<InMemoryClient> {
        Arc::clone(self.client.get_or_init(|| {
            Arc::new(InMemoryClient {
                cluster: self.name.clone(),
                shared: Arc::clone(&self.shared),
            })
        }))
    }
}

#[async_trait]
impl Cache for InMemoryCluster {
    async fn start(&self, token: CancellationToken) -> Result<()> {
        if self.shared.stopped.load(Ordering::Acquire) {
            return Err(Error::cache_unavailable(&self.name, "cache already stopped"));
        }

        if self
            .shared
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            info!(cluster = %self.name, "Starting cache");
            self.shared.replay(false);
            self.shared.synced.send_replace(true);
            debug!(cluster = %self.name, "Cache synced");
        } else {
            // A clone already runs the shared cache; just track its lifetime.
            debug!(cluster = %self.name, "Cache already running");
            token.cancelled().await;
            return Ok(());
        }

        match self.shared.options.cache.resync {
            Some(period) if !period.is_zero() => loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    () = tokio::time::sleep(period) => {
                        debug!(cluster = %self.name, "Resyncing cache");
                        self.shared.replay(true);
                    }
                }
            },
            _ => token.cancelled().await,
        }

        self.shared.stopped.store(true, Ordering::Release);
        info!(cluster = %self.name, "Cache stopped");
        Ok(())
    }

    async fn wait_for_cache_sync(&self, token: &CancellationToken) -> bool {
        let mut rx = self.shared.synced.subscribe();
        let synced = async move { rx.wait_for(|synced| *synced).await.is_ok() };
        tokio::select! {
            synced = synced => synced,
            () = token.cancelled() => false,
        }
    }
}

#[async_trait]
impl Cluster for InMemoryCluster {
    fn name(&self) -> &str {
        &self.name
    }

    async fn add_event_handler(
        &self,
        token: &CancellationToken,
        kind: &ResourceKind,
        handler: Arc<dyn ResourceEventHandler>,
    ) -> Result<()> {
        if token.is_cancelled() || self.shared.stopped.load(Ordering::Acquire) {
            return Err(Error::cache_unavailable(
                &self.name,
                format!("cannot create informer for {kind}: cache stopped"),
            ));
        }

        self.shared
            .write()
            .informers
            .entry(kind.clone())
            .or_default()
            .push(Arc::clone(&handler));
        debug!(cluster = %self.name, kind = %kind, "Added event handler");

        // A running informer replays its current contents to late handlers.
        if self.shared.delivering() {
            let (objects, _) = self.shared.snapshot(kind);
            for obj in &objects {
                handler.on_add(obj);
            }
        }
        Ok(())
    }

    fn client(&self) -> Result<Arc<dyn Client>> {
        Ok(self.in_memory_client())
    }
}

/// Client writing straight to the store and reading through the cache scope.
pub struct InMemoryClient {
    cluster: String,
    shared: Arc<Shared>,
}

impl InMemoryClient {
    fn check_read_scope(&self, namespace: &str) -> Result<()> {
        if self.shared.in_scope(namespace) {
            Ok(())
        } else {
            Err(Error::OutOfScope {
                cluster: self.cluster.clone(),
                namespace: namespace.to_string(),
            })
        }
    }

    fn notify(&self, namespace: &str, handlers: &Handlers, event: impl Fn(&dyn ResourceEventHandler)) {
        if self.shared.delivering() && self.shared.in_scope(namespace) {
            for handler in handlers {
                event(handler.as_ref());
            }
        }
    }
}

#[async_trait]
impl Client for InMemoryClient {
    async fn get(&self, kind: &ResourceKind, namespace: &str, name: &str) -> Result<DynamicObject> {
        self.check_read_scope(namespace)?;
        let key = NamespacedName::new(namespace, name);
        self.shared
            .read()
            .objects
            .get(kind)
            .and_then(|by_key| by_key.get(&key))
            .cloned()
            .ok_or_else(|| Error::not_found(kind.kind.clone(), key.to_string()))
    }

    async fn list(&self, kind: &ResourceKind, namespace: Option<&str>) -> Result<Vec<DynamicObject>> {
        if let Some(ns) = namespace {
            self.check_read_scope(ns)?;
        }
        let store = self.shared.read();
        Ok(store
            .objects
            .get(kind)
            .map(|by_key| {
                by_key
                    .iter()
                    .filter(|(key, _)| namespace.is_none_or(|ns| ns == key.namespace))
                    .filter(|(key, _)| self.shared.in_scope(&key.namespace))
                    .map(|(_, obj)| obj.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn create(&self, mut obj: DynamicObject) -> Result<DynamicObject> {
        let key = obj.namespaced_name()?;
        let (created, handlers) = {
            let mut store = self.shared.write();
            let exists = store
                .objects
                .get(&obj.kind)
                .is_some_and(|by_key| by_key.contains_key(&key));
            if exists {
                return Err(Error::already_exists(obj.kind.kind.clone(), key.to_string()));
            }
            if obj.metadata.uid.is_none() {
                obj.metadata.uid = Some(store.next_uid());
            }
            obj.metadata.resource_version = Some(store.next_resource_version());
            obj.metadata.generation = 1;
            store
                .objects
                .entry(obj.kind.clone())
                .or_default()
                .insert(key.clone(), obj.clone());
            let handlers = store.handlers(&obj.kind);
            (obj, handlers)
        };

        debug!(cluster = %self.cluster, kind = %created.kind, key = %key, "Created object");
        self.notify(&key.namespace, &handlers, |h| h.on_add(&created));
        Ok(created)
    }

    async fn update(&self, mut obj: DynamicObject) -> Result<DynamicObject> {
        let key = obj.namespaced_name()?;
        let (old, updated, handlers) = {
            let mut store = self.shared.write();
            let old = store
                .objects
                .get(&obj.kind)
                .and_then(|by_key| by_key.get(&key))
                .cloned()
                .ok_or_else(|| Error::not_found(obj.kind.kind.clone(), key.to_string()))?;

            if let Some(expected) = obj.metadata.resource_version.as_deref() {
                let actual = old.metadata.resource_version.as_deref().unwrap_or_default();
                if expected != actual {
                    return Err(Error::Conflict {
                        kind: obj.kind.kind.clone(),
                        key: key.to_string(),
                        expected: expected.to_string(),
                        actual: actual.to_string(),
                    });
                }
            }

            obj.metadata.uid.clone_from(&old.metadata.uid);
            obj.metadata.generation = if obj.data == old.data {
                old.metadata.generation
            } else {
                old.metadata.generation.saturating_add(1)
            };
            obj.metadata.resource_version = Some(store.next_resource_version());
            store
                .objects
                .entry(obj.kind.clone())
                .or_default()
                .insert(key.clone(), obj.clone());
            let handlers = store.handlers(&obj.kind);
            (old, obj, handlers)
        };

        debug!(cluster = %self.cluster, kind = %updated.kind, key = %key, "Updated object");
        self.notify(&key.namespace, &handlers, |h| h.on_update(&old, &updated));
        Ok(updated)
    }

    async fn delete(&self, kind: &ResourceKind, namespace: &str, name: &str) -> Result<()> {
        let key = NamespacedName::new(namespace, name);
        let (removed, handlers) = {
            let mut store = self.shared.write();
            let removed = store
                .objects
                .get_mut(kind)
                .and_then(|by_key| by_key.remove(&key))
                .ok_or_else(|| Error::not_found(kind.kind.clone(), key.to_string()))?;
            (removed, store.handlers(kind))
        };

        debug!(cluster = %self.cluster, kind = %kind, key = %key, "Deleted object");
        self.notify(namespace, &handlers, |h| h.on_delete(&removed));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]

    use std::sync::Mutex;

    use super::*;
    use crate::handler::HandlerFuncs;

    fn pod_kind() -> ResourceKind {
        ResourceKind::new("", "v1", "Pod")
    }

    fn pod(namespace: &str, name: &str) -> DynamicObject {
        DynamicObject::new(pod_kind(), namespace, name)
    }

    /// Records every event as `"<verb> <namespace>/<name>"`.
    fn recorder() -> (Arc<Mutex<Vec<String>>>, Arc<dyn ResourceEventHandler>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (a, u, d) = (Arc::clone(&seen), Arc::clone(&seen), Arc::clone(&seen));
        let handler = HandlerFuncs::new()
            .on_add(move |o| a.lock().unwrap().push(format!("add {}", o.namespaced_name().unwrap())))
            .on_update(move |_, n| u.lock().unwrap().push(format!("update {}", n.namespaced_name().unwrap())))
            .on_delete(move |o| d.lock().unwrap().push(format!("delete {}", o.namespaced_name().unwrap())));
        (seen, Arc::new(handler))
    }

    /// Given objects created before the cache starts
    /// When the cache starts
    /// Then every handler receives the initial list and the cache reports synced
    #[tokio::test]
    async fn start_replays_initial_list_then_syncs() {
        let cluster = Arc::new(InMemoryCluster::new("c1", ClusterOptions::default()));
        let client = cluster.client().unwrap();
        client.create(pod("default", "pod-a")).await.unwrap();

        let token = CancellationToken::new();
        let (seen, handler) = recorder();
        cluster.add_event_handler(&token, &pod_kind(), handler).await.unwrap();
        assert!(seen.lock().unwrap().is_empty(), "nothing delivered before start");

        let runner = Arc::clone(&cluster);
        let run_token = token.clone();
        let handle = tokio::spawn(async move { runner.start(run_token).await });

        assert!(cluster.wait_for_cache_sync(&token).await);
        assert_eq!(*seen.lock().unwrap(), vec!["add default/pod-a".to_string()]);

        token.cancel();
        assert!(handle.await.unwrap().is_ok());
    }

    /// Given a running cache
    /// When objects are created, updated and deleted through the client
    /// Then handlers see add, update and delete in order
    #[tokio::test]
    async fn client_writes_fan_out_events() {
        let cluster = Arc::new(InMemoryCluster::new("c1", ClusterOptions::default()));
        let token = CancellationToken::new();
        let (seen, handler) = recorder();
        cluster.add_event_handler(&token, &pod_kind(), handler).await.unwrap();

        let runner = Arc::clone(&cluster);
        let run_token = token.clone();
        tokio::spawn(async move { runner.start(run_token).await });
        assert!(cluster.wait_for_cache_sync(&token).await);

        let client = cluster.client().unwrap();
        let created = client.create(pod("default", "pod-a")).await.unwrap();
        assert_eq!(created.metadata.generation, 1);

        let changed = created.with_data(serde_json::json!({"image": "nginx:2"}));
        let updated = client.update(changed).await.unwrap();
        assert_eq!(updated.metadata.generation, 2);

        client.delete(&pod_kind(), "default", "pod-a").await.unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                "add default/pod-a".to_string(),
                "update default/pod-a".to_string(),
                "delete default/pod-a".to_string(),
            ]
        );
        token.cancel();
    }

    #[tokio::test]
    async fn update_with_stale_resource_version_conflicts() {
        let cluster = InMemoryCluster::new("c1", ClusterOptions::default());
        let client = cluster.client().unwrap();
        let created = client.create(pod("default", "pod-a")).await.unwrap();
        client.update(created.clone()).await.unwrap();

        let err = client.update(created).await.unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
    }

    #[tokio::test]
    async fn create_twice_fails_and_missing_get_is_not_found() {
        let cluster = InMemoryCluster::new("c1", ClusterOptions::default());
        let client = cluster.client().unwrap();
        client.create(pod("default", "pod-a")).await.unwrap();

        assert!(matches!(
            client.create(pod("default", "pod-a")).await,
            Err(Error::AlreadyExists { .. })
        ));
        assert!(client.get(&pod_kind(), "default", "pod-b").await.unwrap_err().is_not_found());
    }

    /// Given a cache restricted to one namespace
    /// Then reads and events outside that namespace are excluded
    #[tokio::test]
    async fn namespace_scoped_cache_filters_reads_and_events() {
        let options = ClusterOptions {
            cache: CacheOptions {
                namespace: Some("team-a".into()),
                ..CacheOptions::default()
            },
        };
        let cluster = Arc::new(InMemoryCluster::new("c1", options));
        let token = CancellationToken::new();
        let (seen, handler) = recorder();
        cluster.add_event_handler(&token, &pod_kind(), handler).await.unwrap();
        let runner = Arc::clone(&cluster);
        let run_token = token.clone();
        tokio::spawn(async move { runner.start(run_token).await });
        assert!(cluster.wait_for_cache_sync(&token).await);

        let client = cluster.client().unwrap();
        client.create(pod("team-a", "in")).await.unwrap();
        client.create(pod("team-b", "out")).await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["add team-a/in".to_string()]);
        assert_eq!(client.list(&pod_kind(), None).await.unwrap().len(), 1);
        assert!(matches!(
            client.get(&pod_kind(), "team-b", "out").await,
            Err(Error::OutOfScope { .. })
        ));
        token.cancel();
    }

    /// Given a cache with a resync period
    /// When the period elapses
    /// Then every cached object is re-delivered as an update
    #[tokio::test(start_paused = true)]
    async fn resync_redelivers_objects_as_updates() {
        let options = ClusterOptions {
            cache: CacheOptions {
                resync: Some(Duration::from_secs(30)),
                ..CacheOptions::default()
            },
        };
        let cluster = Arc::new(InMemoryCluster::new("c1", options));
        cluster.client().unwrap().create(pod("default", "pod-a")).await.unwrap();

        let token = CancellationToken::new();
        let (seen, handler) = recorder();
        cluster.add_event_handler(&token, &pod_kind(), handler).await.unwrap();
        let runner = Arc::clone(&cluster);
        let run_token = token.clone();
        tokio::spawn(async move { runner.start(run_token).await });
        assert!(cluster.wait_for_cache_sync(&token).await);

        tokio::time::sleep(Duration::from_secs(31)).await;

        let events = seen.lock().unwrap().clone();
        assert_eq!(events.first().map(String::as_str), Some("add default/pod-a"));
        assert!(events.contains(&"update default/pod-a".to_string()));
        token.cancel();
    }

    #[tokio::test]
    async fn clone_with_name_shares_store_not_client() {
        let cluster = InMemoryCluster::new("c1", ClusterOptions::default());
        let alias = cluster.clone_with_name("c1-alias");
        assert_eq!(alias.name(), "c1-alias");

        cluster.client().unwrap().create(pod("default", "pod-a")).await.unwrap();
        assert!(alias.client().unwrap().get(&pod_kind(), "default", "pod-a").await.is_ok());
        assert!(!Arc::ptr_eq(&cluster.in_memory_client(), &alias.in_memory_client()));
        assert!(Arc::ptr_eq(&alias.in_memory_client(), &alias.in_memory_client()));
    }

    /// Given a namespace-scoped cluster and an alias of it
    /// When the original's client is used first and the alias then reads out of scope
    /// Then the error names the alias
    #[tokio::test]
    async fn alias_client_reports_its_own_name() {
        let options = ClusterOptions {
            cache: CacheOptions {
                namespace: Some("default".to_string()),
                ..CacheOptions::default()
            },
        };
        let cluster = InMemoryCluster::new("c1", options);
        let alias = cluster.clone_with_name("c1-alias");
        cluster.client().unwrap();

        let err = alias.client().unwrap().get(&pod_kind(), "kube-system", "dns").await.unwrap_err();
        assert!(matches!(err, Error::OutOfScope { ref cluster, .. } if cluster == "c1-alias"));
    }

    #[tokio::test]
    async fn client_is_created_once() {
        let cluster = InMemoryCluster::new("c1", ClusterOptions::default());
        assert!(Arc::ptr_eq(&cluster.in_memory_client(), &cluster.in_memory_client()));
    }

    #[tokio::test]
    async fn add_event_handler_fails_after_cancellation() {
        let cluster = InMemoryCluster::new("c1", ClusterOptions::default());
        let token = CancellationToken::new();
        token.cancel();
        let (_, handler) = recorder();

        let err = cluster.add_event_handler(&token, &pod_kind(), handler).await.unwrap_err();
        assert!(matches!(err, Error::CacheUnavailable { .. }));
        assert_eq!(cluster.handler_count(&pod_kind()), 0);
    }

    #[tokio::test]
    async fn wait_for_cache_sync_returns_false_when_cancelled() {
        let cluster = InMemoryCluster::new("c1", ClusterOptions::default());
        let token = CancellationToken::new();
        token.cancel();
        assert!(!cluster.wait_for_cache_sync(&token).await);
        assert!(!cluster.is_synced());
    }
}
