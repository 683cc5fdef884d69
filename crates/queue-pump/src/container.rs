//! Minimal service container with per-message request scopes.
//!
//! The root [`ServiceContainer`] is filled once at configuration time and then
//! shared behind an `Arc`. Every processed message gets its own
//! [`RequestScope`], which can hold message-local instances (such as a send
//! queue) and falls back to the root for everything else. Dropping the scope
//! releases everything it owns.

use crate::error::{HandlerError, ResolutionError};
use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::trace;

/// Factory producing a service from the scope it is resolved in.
pub type ServiceFactory<T> =
    Arc<dyn Fn(&RequestScope) -> Result<Arc<T>, HandlerError> + Send + Sync>;

type Erased = Box<dyn Any + Send + Sync>;

#[derive(Default)]
struct Registrations {
    // TypeId of T -> Arc<T>
    instances: HashMap<TypeId, Erased>,
    // TypeId of T -> ServiceFactory<T>
    factories: HashMap<TypeId, Erased>,
    // TypeId of T -> Vec<Arc<T>>
    collections: HashMap<TypeId, Erased>,
}

impl Registrations {
    fn instance<T: ?Sized + Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.instances
            .get(&TypeId::of::<T>())
            .and_then(|entry| entry.downcast_ref::<Arc<T>>())
            .cloned()
    }

    fn factory<T: ?Sized + Send + Sync + 'static>(&self) -> Option<ServiceFactory<T>> {
        self.factories
            .get(&TypeId::of::<T>())
            .and_then(|entry| entry.downcast_ref::<ServiceFactory<T>>())
            .cloned()
    }

    fn collection<T: ?Sized + Send + Sync + 'static>(&self) -> &[Arc<T>] {
        self.collections
            .get(&TypeId::of::<T>())
            .and_then(|entry| entry.downcast_ref::<Vec<Arc<T>>>())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn insert_instance<T: ?Sized + Send + Sync + 'static>(&mut self, value: Arc<T>) {
        self.instances.insert(TypeId::of::<T>(), Box::new(value));
    }

    fn push_to_collection<T: ?Sized + Send + Sync + 'static>(&mut self, value: Arc<T>) {
        let entry = self
            .collections
            .entry(TypeId::of::<T>())
            .or_insert_with(|| Box::new(Vec::<Arc<T>>::new()));

        if let Some(items) = entry.downcast_mut::<Vec<Arc<T>>>() {
            items.push(value);
        }
    }

    fn len(&self) -> usize {
        self.instances.len() + self.factories.len() + self.collections.len()
    }
}

/// Root registration table shared by all request scopes.
#[derive(Default)]
pub struct ServiceContainer {
    registrations: Registrations,
}

impl ServiceContainer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a singleton instance, replacing any earlier one for `T`
    pub fn register_instance<T>(&mut self, value: Arc<T>) -> &mut Self
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.registrations.insert_instance(value);
        self
    }

    /// Register a factory that builds `T` inside the resolving scope
    pub fn register_factory<T, F>(&mut self, factory: F) -> &mut Self
    where
        T: ?Sized + Send + Sync + 'static,
        F: Fn(&RequestScope) -> Result<Arc<T>, HandlerError> + Send + Sync + 'static,
    {
        let factory: ServiceFactory<T> = Arc::new(factory);
        self.registrations
            .factories
            .insert(TypeId::of::<T>(), Box::new(factory));
        self
    }

    /// Add an instance to the multi-valued registration for `T`
    pub fn add_to_collection<T>(&mut self, value: Arc<T>) -> &mut Self
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.registrations.push_to_collection(value);
        self
    }

    /// Resolve a single service through a short-lived scope
    pub fn resolve<T>(self: &Arc<Self>) -> Result<Arc<T>, ResolutionError>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.nested_scope().resolve::<T>()
    }

    /// All instances registered for `T`; empty when there are none
    pub fn resolve_all<T>(&self) -> Vec<Arc<T>>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.registrations.collection::<T>().to_vec()
    }

    /// Create an isolated scope for a single unit of work
    pub fn nested_scope(self: &Arc<Self>) -> RequestScope {
        RequestScope {
            parent: Arc::clone(self),
            local: Registrations::default(),
        }
    }
}

impl std::fmt::Debug for ServiceContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceContainer")
            .field("registrations", &self.registrations.len())
            .finish()
    }
}

/// Per-message resolution scope.
///
/// Local registrations shadow the root container. The scope is released when
/// it is dropped.
pub struct RequestScope {
    parent: Arc<ServiceContainer>,
    local: Registrations,
}

impl RequestScope {
    pub fn register_instance<T>(&mut self, value: Arc<T>) -> &mut Self
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.local.insert_instance(value);
        self
    }

    pub fn add_to_collection<T>(&mut self, value: Arc<T>) -> &mut Self
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.local.push_to_collection(value);
        self
    }

    pub fn resolve<T>(&self) -> Result<Arc<T>, ResolutionError>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        if let Some(value) = self.local.instance::<T>() {
            return Ok(value);
        }

        if let Some(value) = self.parent.registrations.instance::<T>() {
            return Ok(value);
        }

        match self.parent.registrations.factory::<T>() {
            Some(factory) => factory(self).map_err(|source| ResolutionError::Factory {
                service: type_name::<T>(),
                source,
            }),
            None => Err(ResolutionError::NotRegistered {
                service: type_name::<T>(),
            }),
        }
    }

    /// Local collection entries followed by the root container's
    pub fn resolve_all<T>(&self) -> Vec<Arc<T>>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.local
            .collection::<T>()
            .iter()
            .chain(self.parent.registrations.collection::<T>())
            .cloned()
            .collect()
    }

    /// Release the scope and everything registered in it
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for RequestScope {
    fn drop(&mut self) {
        trace!(local_registrations = self.local.len(), "Request scope released");
    }
}

#[cfg(test)]
#[path = "container_tests.rs"]
mod tests;
