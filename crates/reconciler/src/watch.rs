//! Client-side event filtering.
//!
//! [`WatchOptions::filter`] is a pure predicate over one object. Event-aware
//! checks (did the spec change? did the labels change?) are [`Predicate`]s,
//! evaluated by the enqueue handler against the event that carried the object.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use fleet_core::{DynamicObject, LabelSelector};

/// Decides whether an event should produce a request.
///
/// Every hook defaults to accepting the event.
pub trait Predicate: Send + Sync {
    fn create(&self, _obj: &DynamicObject) -> bool {
        true
    }

    fn update(&self, _old: &DynamicObject, _new: &DynamicObject) -> bool {
        true
    }

    fn delete(&self, _obj: &DynamicObject) -> bool {
        true
    }
}

/// Accepts updates that change `metadata.generation`, i.e. spec changes.
/// Status-only updates and resyncs are dropped.
#[derive(Debug, Clone, Copy, Default)]
pub struct GenerationChangedPredicate;

impl Predicate for GenerationChangedPredicate {
    fn update(&self, old: &DynamicObject, new: &DynamicObject) -> bool {
        old.metadata.generation != new.metadata.generation
    }
}

/// Accepts updates that change `metadata.resourceVersion`. Drops resyncs.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceVersionChangedPredicate;

impl Predicate for ResourceVersionChangedPredicate {
    fn update(&self, old: &DynamicObject, new: &DynamicObject) -> bool {
        old.metadata.resource_version != new.metadata.resource_version
    }
}

/// Accepts updates that change the object's labels.
#[derive(Debug, Clone, Copy, Default)]
pub struct LabelsChangedPredicate;

impl Predicate for LabelsChangedPredicate {
    fn update(&self, old: &DynamicObject, new: &DynamicObject) -> bool {
        old.metadata.labels != new.metadata.labels
    }
}

type ObjectFn = Arc<dyn Fn(&DynamicObject) -> bool + Send + Sync>;

/// Applies one object check to every event; updates are judged on the new
/// object.
#[derive(Clone)]
pub struct PredicateFn {
    f: ObjectFn,
}

impl PredicateFn {
    pub fn new(f: impl Fn(&DynamicObject) -> bool + Send + Sync + 'static) -> Self {
        Self { f: Arc::new(f) }
    }
}

impl Predicate for PredicateFn {
    fn create(&self, obj: &DynamicObject) -> bool {
        (self.f)(obj)
    }

    fn update(&self, _old: &DynamicObject, new: &DynamicObject) -> bool {
        (self.f)(new)
    }

    fn delete(&self, obj: &DynamicObject) -> bool {
        (self.f)(obj)
    }
}

/// Client-side filter for a watch.
///
/// Every configured check must pass; the default options accept everything.
/// Server-side scoping belongs to the cluster's cache options.
#[derive(Clone, Default)]
pub struct WatchOptions {
    /// Only this namespace. Empty means any.
    pub namespace: String,
    /// Only these namespaces. Empty means any.
    pub namespaces: BTreeSet<String>,
    pub label_selector: Option<LabelSelector>,
    pub annotation_selector: Option<LabelSelector>,
    pub customize_filter: Option<ObjectFn>,
    /// Event predicates; all must accept.
    pub predicates: Vec<Arc<dyn Predicate>>,
}

impl WatchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    #[must_use]
    pub fn namespaces<I, S>(mut self, namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.namespaces = namespaces.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn label_selector(mut self, selector: LabelSelector) -> Self {
        self.label_selector = Some(selector);
        self
    }

    #[must_use]
    pub fn annotation_selector(mut self, selector: LabelSelector) -> Self {
        self.annotation_selector = Some(selector);
        self
    }

    #[must_use]
    pub fn customize_filter(
        mut self,
        f: impl Fn(&DynamicObject) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.customize_filter = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn predicate(mut self, predicate: impl Predicate + 'static) -> Self {
        self.predicates.push(Arc::new(predicate));
        self
    }

    /// Whether `obj` passes every object check.
    ///
    /// An object without a name has no usable metadata and never passes.
    pub fn filter(&self, obj: &DynamicObject) -> bool {
        let meta = &obj.metadata;
        if meta.require_name().is_err() {
            return false;
        }
        let namespace = meta.namespace_or_empty();

        if !self.namespace.is_empty() && self.namespace != namespace {
            return false;
        }
        if !self.namespaces.is_empty() && !self.namespaces.contains(namespace) {
            return false;
        }
        if let Some(selector) = &self.label_selector {
            if !selector.matches(&meta.labels) {
                return false;
            }
        }
        if let Some(selector) = &self.annotation_selector {
            if !selector.matches(&meta.annotations) {
                return false;
            }
        }
        self.customize_filter.as_ref().is_none_or(|f| f(obj))
    }

    pub(crate) fn accepts_create(&self, obj: &DynamicObject) -> bool {
        self.filter(obj) && self.predicates.iter().all(|p| p.create(obj))
    }

    pub(crate) fn accepts_update(&self, old: &DynamicObject, new: &DynamicObject) -> bool {
        self.filter(new) && self.predicates.iter().all(|p| p.update(old, new))
    }

    pub(crate) fn accepts_delete(&self, obj: &DynamicObject) -> bool {
        self.filter(obj) && self.predicates.iter().all(|p| p.delete(obj))
    }
}

impl fmt::Debug for WatchOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchOptions")
            .field("namespace", &self.namespace)
            .field("namespaces", &self.namespaces)
            .field("label_selector", &self.label_selector)
            .field("annotation_selector", &self.annotation_selector)
            .field("customize_filter", &self.customize_filter.is_some())
            .field("predicates", &self.predicates.len())
            .finish()
    }
}
