//! Builder front for composing a [`MeterProvider`].
//!
//! A builder runs in one of three modes:
//! - standalone, created with [`MeterProviderBuilder::new`]; [`build`] creates
//!   a [`ServiceProvider`] from the builder's own registrations and hands its
//!   ownership to the provider;
//! - embedded, handed out by
//!   [`MetricsServiceCollectionExt::configure_metrics`]; the provider is built
//!   by the external container when [`MeterProvider`] is resolved from it;
//! - resolved, handed to deferred callbacks once the container exists.
//!
//! Registrations are accumulated without side effects until the provider is
//! assembled.
//!
//! [`build`]: MeterProviderBuilder::build

use crate::assemble;
use crate::config::MetricsConfig;
use crate::error::MeterProviderError;
use crate::provider::MeterProvider;
use crate::reader::MetricReader;
use crate::resource::ResourceBuilder;
use crate::services::{Service, ServiceCollection, ServiceProvider};
use crate::state::{
    BuilderState, DeferredCallback, InstrumentationRegistration, InstrumentationSource,
    ReaderRegistration,
};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Standalone,
    Embedded,
    Resolved,
}

/// Accumulates meters, instrumentations, readers, resource configuration and
/// deferred callbacks for a single [`MeterProvider`].
///
/// # Example
///
/// ```no_run
/// use meter_provider_builder::{MeterProviderBuilder, MeterProviderError};
///
/// fn main() -> Result<(), MeterProviderError> {
///     let mut builder = MeterProviderBuilder::new();
///     builder
///         .add_meter("MyCompany.Orders")?
///         .configure_resource(|r| {
///             r.add_service("orders");
///         })?
///         .configure_builder(|_services, builder| {
///             builder.add_meter("MyCompany.Payments")?;
///             Ok(())
///         })?;
///
///     let provider = builder.build()?;
///     assert!(provider.is_meter_enabled("mycompany.payments"));
///     Ok(())
/// }
/// ```
#[must_use = "builders do nothing unless a provider is built from them"]
pub struct MeterProviderBuilder {
    mode: Mode,
    services: Option<ServiceCollection>,
    state: BuilderState,
    built: bool,
}

impl MeterProviderBuilder {
    /// Creates a standalone builder with an empty service collection.
    pub fn new() -> Self {
        Self {
            mode: Mode::Standalone,
            services: Some(ServiceCollection::new()),
            state: BuilderState::default(),
            built: false,
        }
    }

    pub(crate) fn embedded() -> Self {
        Self {
            mode: Mode::Embedded,
            ..Self::new()
        }
    }

    pub(crate) fn resolved(state: BuilderState) -> Self {
        Self {
            mode: Mode::Resolved,
            services: None,
            state,
            built: false,
        }
    }

    pub(crate) fn into_parts(mut self) -> (ServiceCollection, BuilderState) {
        let services = self.services.take().unwrap_or_default();
        (services, std::mem::take(&mut self.state))
    }

    pub(crate) fn pop_deferred(&mut self) -> Option<DeferredCallback> {
        self.state.deferred.pop_front()
    }

    pub(crate) fn into_state(self) -> BuilderState {
        self.state
    }

    /// Registrations accumulated so far.
    pub fn state(&self) -> &BuilderState {
        &self.state
    }

    /// Meter names added so far.
    pub fn meter_sources(&self) -> &[String] {
        self.state.meter_sources()
    }

    /// Returns `true` if the service container already exists, i.e. inside a
    /// deferred callback.
    pub fn is_resolved(&self) -> bool {
        self.mode == Mode::Resolved
    }

    /// Returns `true` if the provider will be built by an external container.
    pub fn is_embedded(&self) -> bool {
        self.mode == Mode::Embedded
    }

    /// Returns `true` once [`build`](Self::build) has been called.
    pub fn is_built(&self) -> bool {
        self.built
    }

    /// Adds a meter name. Adding a name twice has no effect.
    ///
    /// Names may contain `*` wildcards and match case-insensitively.
    ///
    /// # Errors
    ///
    /// Returns [`MeterProviderError::Configuration`] for an empty name and
    /// [`MeterProviderError::InvalidState`] once the provider has been built.
    pub fn add_meter(&mut self, name: impl Into<String>) -> Result<&mut Self, MeterProviderError> {
        self.ensure_open()?;

        let name = name.into();
        if name.trim().is_empty() {
            return Err(MeterProviderError::Configuration(
                "meter name must not be empty".to_string(),
            ));
        }

        self.state.add_meter(name);
        Ok(self)
    }

    /// Adds several meter names in order.
    pub fn add_meters<I, S>(&mut self, names: I) -> Result<&mut Self, MeterProviderError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for name in names {
            self.add_meter(name)?;
        }
        Ok(self)
    }

    /// Registers services with the container the provider will be resolved
    /// from.
    ///
    /// # Errors
    ///
    /// Returns [`MeterProviderError::Unsupported`] once the container exists,
    /// which is always the case inside deferred callbacks and after a build.
    /// Errors returned by `configure` are passed through.
    pub fn configure_services<F>(&mut self, configure: F) -> Result<&mut Self, MeterProviderError>
    where
        F: FnOnce(&mut ServiceCollection) -> Result<(), MeterProviderError>,
    {
        let Some(services) = self.services.as_mut() else {
            return Err(MeterProviderError::Unsupported(
                "services can't be configured at this stage",
            ));
        };

        configure(services)?;
        Ok(self)
    }

    /// Queues a callback to run once the service container exists.
    ///
    /// Callbacks run in the order they were queued. A callback may queue more
    /// callbacks; those run after everything already queued.
    pub fn configure_builder<F>(&mut self, callback: F) -> Result<&mut Self, MeterProviderError>
    where
        F: FnOnce(&ServiceProvider, &mut MeterProviderBuilder) -> Result<(), MeterProviderError>
            + Send
            + 'static,
    {
        self.ensure_open()?;
        self.state.deferred.push_back(Box::new(callback));
        Ok(self)
    }

    /// Registers a reader instance.
    pub fn add_reader<R>(&mut self, reader: R) -> Result<&mut Self, MeterProviderError>
    where
        R: MetricReader,
    {
        self.add_shared_reader(Arc::new(reader))
    }

    /// Registers a reader instance that is shared with the caller.
    pub fn add_shared_reader(
        &mut self,
        reader: Arc<dyn MetricReader>,
    ) -> Result<&mut Self, MeterProviderError> {
        self.ensure_open()?;
        self.state.readers.push(ReaderRegistration::Instance(reader));
        Ok(self)
    }

    /// Registers a reader resolved from the container as `R`.
    ///
    /// While the container is still being configured, `R` is also registered
    /// as a container singleton unless already present. Registering the same
    /// type twice adds the reader twice.
    pub fn add_reader_service<R>(&mut self) -> Result<&mut Self, MeterProviderError>
    where
        R: MetricReader + Default,
    {
        self.ensure_open()?;

        if let Some(services) = self.services.as_mut() {
            services.try_add_singleton::<R>();
        }

        self.state.readers.push(ReaderRegistration::Service {
            type_name: std::any::type_name::<R>(),
            resolve: Box::new(|services: &ServiceProvider| {
                let reader: Arc<dyn MetricReader> = services.get_required_service::<R>()?;
                Ok(reader)
            }),
        });
        Ok(self)
    }

    /// Registers an instrumentation created by `factory` when the provider is
    /// assembled. The provider disposes it.
    pub fn add_instrumentation<T, F>(&mut self, factory: F) -> Result<&mut Self, MeterProviderError>
    where
        T: Service,
        F: FnOnce() -> T + Send + 'static,
    {
        self.ensure_open()?;
        self.state.instrumentations.push(InstrumentationRegistration {
            type_name: std::any::type_name::<T>(),
            source: InstrumentationSource::Factory(Box::new(move || {
                let instance: Arc<dyn Service> = Arc::new(factory());
                instance
            })),
        });
        Ok(self)
    }

    /// Registers an instrumentation resolved from the container as `T`. The
    /// container disposes it.
    pub fn add_instrumentation_service<T>(&mut self) -> Result<&mut Self, MeterProviderError>
    where
        T: Service + Default,
    {
        self.ensure_open()?;

        if let Some(services) = self.services.as_mut() {
            services.try_add_singleton::<T>();
        }

        self.state.instrumentations.push(InstrumentationRegistration {
            type_name: std::any::type_name::<T>(),
            source: InstrumentationSource::Service(Box::new(|services: &ServiceProvider| {
                let instance: Arc<dyn Service> = services.get_required_service::<T>()?;
                Ok(instance)
            })),
        });
        Ok(self)
    }

    /// Replaces the resource accumulator with `builder`.
    ///
    /// Resource callbacks registered earlier apply to the replaced
    /// accumulator and are lost with it.
    pub fn set_resource_builder(
        &mut self,
        builder: ResourceBuilder,
    ) -> Result<&mut Self, MeterProviderError> {
        self.ensure_open()?;
        self.state.resource.replace(builder);
        Ok(self)
    }

    /// Queues a callback against the resource accumulator current at this
    /// point in the call sequence.
    pub fn configure_resource<F>(&mut self, configure: F) -> Result<&mut Self, MeterProviderError>
    where
        F: FnOnce(&mut ResourceBuilder) + Send + 'static,
    {
        self.ensure_open()?;
        self.state.resource.configure(Box::new(configure));
        Ok(self)
    }

    /// Adds the meters and resource attributes of `config`.
    pub fn apply_config(
        &mut self,
        config: &MetricsConfig,
    ) -> Result<&mut Self, MeterProviderError> {
        self.add_meters(config.meters.iter().cloned())?;

        let resource = config.resource.clone();
        self.configure_resource(move |builder| resource.apply(builder))
    }

    /// Builds the provider. The provider owns the service container it
    /// creates.
    ///
    /// # Errors
    ///
    /// Returns [`MeterProviderError::Unsupported`] for an embedded builder or
    /// on a second call, and [`MeterProviderError::InvalidState`] inside a
    /// deferred callback. Errors raised while resolving services or running
    /// deferred callbacks are passed through; no provider is returned then.
    pub fn build(&mut self) -> Result<MeterProvider, MeterProviderError> {
        match self.mode {
            Mode::Embedded => {
                return Err(MeterProviderError::Unsupported(
                    "an embedded builder is built by its service container",
                ));
            }
            Mode::Resolved => {
                return Err(MeterProviderError::InvalidState(
                    "the provider is already being built",
                ));
            }
            Mode::Standalone => {}
        }

        if self.built {
            return Err(MeterProviderError::Unsupported(
                "build can only be called once",
            ));
        }
        self.built = true;

        let services = self.services.take().unwrap_or_default();
        let state = std::mem::take(&mut self.state);

        tracing::debug!(
            target: "meter_provider_lifecycle",
            services = services.len(),
            meters = state.meter_sources().len(),
            deferred = state.pending_callbacks(),
            "Building standalone meter provider"
        );

        assemble::build_owned(services, state)
    }

    fn ensure_open(&self) -> Result<(), MeterProviderError> {
        if self.built {
            return Err(MeterProviderError::InvalidState(
                "the meter provider has already been built",
            ));
        }
        Ok(())
    }
}

impl Default for MeterProviderBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MeterProviderBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MeterProviderBuilder")
            .field("mode", &self.mode)
            .field("services", &self.services)
            .field("state", &self.state)
            .field("built", &self.built)
            .finish()
    }
}

/// Registers a meter provider with a [`ServiceCollection`].
pub trait MetricsServiceCollectionExt {
    /// Configures the meter provider built by this collection's container.
    ///
    /// `configure` receives an embedded builder. Every call against the same
    /// collection contributes to one provider, resolved as [`MeterProvider`]
    /// and disposed by the container.
    ///
    /// # Errors
    ///
    /// Errors returned by `configure` are passed through and nothing is
    /// registered.
    fn configure_metrics<F>(&mut self, configure: F) -> Result<&mut Self, MeterProviderError>
    where
        F: FnOnce(&mut MeterProviderBuilder) -> Result<(), MeterProviderError>;
}

impl MetricsServiceCollectionExt for ServiceCollection {
    fn configure_metrics<F>(&mut self, configure: F) -> Result<&mut Self, MeterProviderError>
    where
        F: FnOnce(&mut MeterProviderBuilder) -> Result<(), MeterProviderError>,
    {
        let mut builder = MeterProviderBuilder::embedded();
        configure(&mut builder)?;
        let (services, state) = builder.into_parts();

        tracing::debug!(
            target: "meter_provider_lifecycle",
            services = services.len(),
            meters = state.meter_sources().len(),
            deferred = state.pending_callbacks(),
            "Registering embedded meter provider"
        );

        self.try_add_singleton_with(assemble::build_from_services)
            .extend(services)
            .add_configuration(state);
        Ok(self)
    }
}
