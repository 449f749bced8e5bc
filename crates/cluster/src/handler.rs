//! Resource event handlers.

use fleet_core::DynamicObject;

/// Receives add/update/delete notifications for one resource kind.
///
/// Called synchronously on the cache's notification path, so implementations
/// must not block.
pub trait ResourceEventHandler: Send + Sync {
    /// An object was observed for the first time (or replayed on start).
    fn on_add(&self, obj: &DynamicObject);

    /// An object changed. Periodic resyncs deliver `old == new`.
    fn on_update(&self, old: &DynamicObject, new: &DynamicObject);

    /// An object was removed. `obj` is its last known state.
    fn on_delete(&self, obj: &DynamicObject);
}

type ObjFn = Box<dyn Fn(&DynamicObject) + Send + Sync>;
type UpdateFn = Box<dyn Fn(&DynamicObject, &DynamicObject) + Send + Sync>;

/// Handler assembled from optional closures. Missing callbacks are no-ops.
#[derive(Default)]
pub struct HandlerFuncs {
    add: Option<ObjFn>,
    update: Option<UpdateFn>,
    delete: Option<ObjFn>,
}

impl HandlerFuncs {
    /// Create a handler that ignores every event.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the add callback.
    #[must_use]
    pub fn on_add(mut self, f: impl Fn(&DynamicObject) + Send + Sync + 'static) -> Self {
        self.add = Some(Box::new(f));
        self
    }

    /// Set the update callback.
    #[must_use]
    pub fn on_update(
        mut self,
        f: impl Fn(&DynamicObject, &DynamicObject) + Send + Sync + 'static,
    ) -> Self {
        self.update = Some(Box::new(f));
        self
    }

    /// Set the delete callback.
    #[must_use]
    pub fn on_delete(mut self, f: impl Fn(&DynamicObject) + Send + Sync + 'static) -> Self {
        self.delete = Some(Box::new(f));
        self
    }
}

impl ResourceEventHandler for HandlerFuncs {
    fn on_add(&self, obj: &DynamicObject) {
        if let Some(f) = &self.add {
            f(obj);
        }
    }

    fn on_update(&self, old: &DynamicObject, new: &DynamicObject) {
        if let Some(f) = &self.update {
            f(old, new);
        }
    }

    fn on_delete(&self, obj: &DynamicObject) {
        if let Some(f) = &self.delete {
            f(obj);
        }
    }
}
