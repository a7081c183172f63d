//! Minimal service container used to resolve builder registrations.
//!
//! [`ServiceCollection`] records registrations keyed by type. Consuming it with
//! [`ServiceCollection::build_service_provider`] yields a [`ServiceProvider`]
//! that resolves those registrations on demand and disposes every instance it
//! created, once, when it is disposed or dropped.
//!
//! Two registration kinds exist:
//! - singletons, registered with the `try_add_singleton*` family, are
//!   deduplicated by type and created at most once per provider;
//! - transients, registered with [`ServiceCollection::add_transient`], are
//!   appended on every call and created on every resolution.

use crate::error::MeterProviderError;
use parking_lot::{Mutex, ReentrantMutex};
use std::any::{Any, TypeId};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, ThreadId};

/// A type that can be stored in, and disposed by, a [`ServiceProvider`].
pub trait Service: Any + Send + Sync {
    /// Releases resources held by the service.
    ///
    /// Called at most once by the container that created the instance.
    fn dispose(&self) {}
}

impl dyn Service {
    /// Returns `true` if the service is of type `T`.
    pub fn is<T: Service>(&self) -> bool {
        let any: &dyn Any = self;
        any.is::<T>()
    }

    /// Returns a reference to the concrete service if it is of type `T`.
    pub fn downcast_ref<T: Service>(&self) -> Option<&T> {
        let any: &dyn Any = self;
        any.downcast_ref::<T>()
    }
}

/// How often a registration's factory runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lifetime {
    /// One instance per provider; registration is deduplicated by type.
    Singleton,
    /// A new instance per resolution; every registration is kept.
    Transient,
}

#[derive(Clone)]
struct Instance {
    any: Arc<dyn Any + Send + Sync>,
    service: Arc<dyn Service>,
}

impl Instance {
    fn new<T: Service>(value: Arc<T>) -> Self {
        let any: Arc<dyn Any + Send + Sync> = value.clone();
        Self { any, service: value }
    }

    fn downcast<T: Service>(self) -> Option<Arc<T>> {
        self.any.downcast::<T>().ok()
    }
}

type Factory =
    Box<dyn Fn(&ServiceProvider) -> Result<Instance, MeterProviderError> + Send + Sync>;

struct ServiceDescriptor {
    type_id: TypeId,
    type_name: &'static str,
    lifetime: Lifetime,
    // false for caller-supplied instances, which the container must not dispose
    owned: bool,
    factory: Factory,
}

/// Registrations waiting to be turned into a [`ServiceProvider`].
#[derive(Default)]
pub struct ServiceCollection {
    descriptors: Vec<ServiceDescriptor>,
    configurations: Vec<Box<dyn Any + Send>>,
}

impl ServiceCollection {
    /// Creates an empty collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `T` as a singleton built with `T::default()`, unless `T` is
    /// already registered.
    pub fn try_add_singleton<T>(&mut self) -> &mut Self
    where
        T: Service + Default,
    {
        self.try_add_singleton_with(|_| Ok(T::default()))
    }

    /// Registers `T` as a singleton built by `factory`, unless `T` is already
    /// registered.
    pub fn try_add_singleton_with<T, F>(&mut self, factory: F) -> &mut Self
    where
        T: Service,
        F: Fn(&ServiceProvider) -> Result<T, MeterProviderError> + Send + Sync + 'static,
    {
        self.try_add(ServiceDescriptor {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            lifetime: Lifetime::Singleton,
            owned: true,
            factory: Box::new(move |services| {
                factory(services).map(|value| Instance::new(Arc::new(value)))
            }),
        })
    }

    /// Registers an existing instance as the singleton for `T`, unless `T` is
    /// already registered. The container never disposes this instance.
    pub fn try_add_singleton_instance<T: Service>(&mut self, instance: Arc<T>) -> &mut Self {
        self.try_add(ServiceDescriptor {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            lifetime: Lifetime::Singleton,
            owned: false,
            factory: Box::new(move |_| Ok(Instance::new(Arc::clone(&instance)))),
        })
    }

    /// Appends a transient registration for `T`. Every call adds a new
    /// registration.
    pub fn add_transient<T, F>(&mut self, factory: F) -> &mut Self
    where
        T: Service,
        F: Fn(&ServiceProvider) -> Result<T, MeterProviderError> + Send + Sync + 'static,
    {
        self.descriptors.push(ServiceDescriptor {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            lifetime: Lifetime::Transient,
            owned: true,
            factory: Box::new(move |services| {
                factory(services).map(|value| Instance::new(Arc::new(value)))
            }),
        });
        self
    }

    /// Returns `true` if at least one registration exists for `T`.
    pub fn contains<T: Service>(&self) -> bool {
        self.contains_type(TypeId::of::<T>())
    }

    /// Returns the number of registrations for `T`.
    pub fn count<T: Service>(&self) -> usize {
        let type_id = TypeId::of::<T>();
        self.descriptors
            .iter()
            .filter(|d| d.type_id == type_id)
            .count()
    }

    /// Returns the total number of registrations.
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    /// Returns `true` if nothing has been registered.
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Stores a configuration value to be taken, once, from the provider with
    /// [`ServiceProvider::take_configurations`].
    pub fn add_configuration<C: Any + Send>(&mut self, configuration: C) -> &mut Self {
        self.configurations.push(Box::new(configuration));
        self
    }

    /// Moves every registration from `other` into this collection, in order.
    ///
    /// Singleton registrations for types already present are skipped.
    pub fn extend(&mut self, other: ServiceCollection) -> &mut Self {
        for descriptor in other.descriptors {
            match descriptor.lifetime {
                Lifetime::Singleton => {
                    self.try_add(descriptor);
                }
                Lifetime::Transient => self.descriptors.push(descriptor),
            }
        }
        self.configurations.extend(other.configurations);
        self
    }

    /// Consumes the collection and creates a provider that resolves it.
    pub fn build_service_provider(self) -> ServiceProvider {
        tracing::debug!(
            target: "meter_provider_lifecycle",
            services = self.descriptors.len(),
            configurations = self.configurations.len(),
            "Building service provider"
        );
        ServiceProvider {
            creating: self
                .descriptors
                .iter()
                .map(|_| ReentrantMutex::new(()))
                .collect(),
            descriptors: self.descriptors,
            singletons: Mutex::new(HashMap::new()),
            resolving: Mutex::new(HashMap::new()),
            created: Mutex::new(Vec::new()),
            configurations: Mutex::new(self.configurations),
            consumed: Mutex::new(HashSet::new()),
            disposed: AtomicBool::new(false),
        }
    }

    fn contains_type(&self, type_id: TypeId) -> bool {
        self.descriptors.iter().any(|d| d.type_id == type_id)
    }

    fn try_add(&mut self, descriptor: ServiceDescriptor) -> &mut Self {
        if self.contains_type(descriptor.type_id) {
            tracing::trace!(
                target: "meter_provider_lifecycle",
                service = descriptor.type_name,
                "Singleton already registered"
            );
        } else {
            self.descriptors.push(descriptor);
        }
        self
    }
}

impl fmt::Debug for ServiceCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceCollection")
            .field("services", &type_names(&self.descriptors))
            .field("configurations", &self.configurations.len())
            .finish()
    }
}

/// Resolves registrations from a [`ServiceCollection`].
///
/// The provider can be shared between threads. Each singleton is created at
/// most once; concurrent resolutions of the same singleton wait for the first
/// one to finish. Dropping the provider disposes it.
pub struct ServiceProvider {
    descriptors: Vec<ServiceDescriptor>,
    // one per descriptor, held while a singleton factory runs
    creating: Vec<ReentrantMutex<()>>,
    singletons: Mutex<HashMap<usize, Instance>>,
    // singletons being created, per resolving thread
    resolving: Mutex<HashMap<ThreadId, Vec<usize>>>,
    created: Mutex<Vec<Arc<dyn Service>>>,
    configurations: Mutex<Vec<Box<dyn Any + Send>>>,
    consumed: Mutex<HashSet<TypeId>>,
    disposed: AtomicBool,
}

impl ServiceProvider {
    /// Resolves the last registration for `T`, or `None` if `T` is not
    /// registered.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider has been disposed, if resolution
    /// re-enters a singleton that is still being created, or if a factory fails.
    pub fn get_service<T: Service>(&self) -> Result<Option<Arc<T>>, MeterProviderError> {
        let type_id = TypeId::of::<T>();
        match self.descriptors.iter().rposition(|d| d.type_id == type_id) {
            Some(index) => Ok(self.resolve(index)?.downcast::<T>()),
            None => Ok(None),
        }
    }

    /// Resolves the last registration for `T`.
    ///
    /// # Errors
    ///
    /// Returns [`MeterProviderError::MissingService`] if `T` is not registered,
    /// plus every error [`get_service`](Self::get_service) can return.
    pub fn get_required_service<T: Service>(&self) -> Result<Arc<T>, MeterProviderError> {
        self.get_service::<T>()?.ok_or(MeterProviderError::MissingService {
            type_name: std::any::type_name::<T>(),
        })
    }

    /// Resolves every registration for `T`, in registration order.
    pub fn get_services<T: Service>(&self) -> Result<Vec<Arc<T>>, MeterProviderError> {
        let type_id = TypeId::of::<T>();
        let mut services = Vec::new();
        for (index, descriptor) in self.descriptors.iter().enumerate() {
            if descriptor.type_id == type_id
                && let Some(service) = self.resolve(index)?.downcast::<T>()
            {
                services.push(service);
            }
        }
        Ok(services)
    }

    /// Takes every configuration of type `C` stored with
    /// [`ServiceCollection::add_configuration`], in insertion order.
    ///
    /// Returns `None` if configurations of this type were already taken.
    pub fn take_configurations<C: Any + Send>(&self) -> Option<Vec<C>> {
        if !self.consumed.lock().insert(TypeId::of::<C>()) {
            return None;
        }

        let mut configurations = self.configurations.lock();
        let (matching, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut *configurations)
            .into_iter()
            .partition(|c| (**c).is::<C>());
        *configurations = rest;

        Some(
            matching
                .into_iter()
                .filter_map(|c| c.downcast::<C>().ok())
                .map(|c| *c)
                .collect(),
        )
    }

    /// Returns `true` once [`dispose`](Self::dispose) has run.
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Disposes every instance this provider created, newest first.
    ///
    /// Subsequent calls do nothing.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        let created = std::mem::take(&mut *self.created.lock());
        tracing::debug!(
            target: "meter_provider_lifecycle",
            services = created.len(),
            "Disposing service provider"
        );
        for service in created.iter().rev() {
            service.dispose();
        }

        let singletons = std::mem::take(&mut *self.singletons.lock());
        drop(singletons);
    }

    fn resolve(&self, index: usize) -> Result<Instance, MeterProviderError> {
        if self.is_disposed() {
            return Err(MeterProviderError::InvalidState(
                "service provider has been disposed",
            ));
        }

        let descriptor = &self.descriptors[index];
        match descriptor.lifetime {
            Lifetime::Transient => {
                let instance = (descriptor.factory)(self)?;
                self.track(descriptor, &instance)?;
                Ok(instance)
            }
            Lifetime::Singleton => {
                if let Some(instance) = self.singletons.lock().get(&index) {
                    return Ok(instance.clone());
                }

                // Re-entrant: a factory resolving its own type reaches the cycle check.
                let _creating = self.creating[index].lock();
                if let Some(instance) = self.singletons.lock().get(&index) {
                    return Ok(instance.clone());
                }

                let thread = thread::current().id();
                {
                    let mut resolving = self.resolving.lock();
                    let chain = resolving.entry(thread).or_default();
                    if chain.contains(&index) {
                        return Err(MeterProviderError::CircularDependency {
                            type_name: descriptor.type_name,
                        });
                    }
                    chain.push(index);
                }

                // The factory may resolve other services, so no map lock is held here.
                let result = (descriptor.factory)(self);
                {
                    let mut resolving = self.resolving.lock();
                    if let Some(chain) = resolving.get_mut(&thread) {
                        chain.retain(|i| *i != index);
                        if chain.is_empty() {
                            resolving.remove(&thread);
                        }
                    }
                }
                let instance = result?;

                self.track(descriptor, &instance)?;
                self.singletons.lock().insert(index, instance.clone());
                Ok(instance)
            }
        }
    }

    /// Records a freshly created instance for disposal. An instance created
    /// while the provider was being disposed is disposed right away.
    fn track(
        &self,
        descriptor: &ServiceDescriptor,
        instance: &Instance,
    ) -> Result<(), MeterProviderError> {
        let mut created = self.created.lock();
        if self.is_disposed() {
            drop(created);
            if descriptor.owned {
                tracing::debug!(
                    target: "meter_provider_lifecycle",
                    service = descriptor.type_name,
                    "Disposing service created during provider disposal"
                );
                instance.service.dispose();
            }
            return Err(MeterProviderError::InvalidState(
                "service provider has been disposed",
            ));
        }

        if descriptor.owned {
            created.push(Arc::clone(&instance.service));
        }
        Ok(())
    }
}

impl Drop for ServiceProvider {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for ServiceProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceProvider")
            .field("services", &type_names(&self.descriptors))
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

fn type_names(descriptors: &[ServiceDescriptor]) -> Vec<&'static str> {
    descriptors.iter().map(|d| d.type_name).collect()
}
