//! Registrations accumulated by a builder before the provider is assembled.

use crate::builder::MeterProviderBuilder;
use crate::error::MeterProviderError;
use crate::reader::MetricReader;
use crate::resource::ResourceConfiguration;
use crate::services::{Service, ServiceProvider};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

/// Callback run once the service provider exists.
///
/// It receives the resolved provider and the builder, and may register more
/// callbacks; those run after every callback already queued.
pub type DeferredCallback = Box<
    dyn FnOnce(&ServiceProvider, &mut MeterProviderBuilder) -> Result<(), MeterProviderError>
        + Send,
>;

type ServiceResolver<T> =
    Box<dyn FnOnce(&ServiceProvider) -> Result<Arc<T>, MeterProviderError> + Send>;

pub(crate) enum InstrumentationSource {
    /// Created by the provider, which also disposes it.
    Factory(Box<dyn FnOnce() -> Arc<dyn Service> + Send>),
    /// Resolved from, and disposed by, the service provider.
    Service(ServiceResolver<dyn Service>),
}

pub(crate) struct InstrumentationRegistration {
    pub(crate) type_name: &'static str,
    pub(crate) source: InstrumentationSource,
}

/// A live instrumentation and whether the meter provider must dispose it.
pub(crate) struct ResolvedInstrumentation {
    pub(crate) instance: Arc<dyn Service>,
    pub(crate) owned: bool,
}

impl InstrumentationRegistration {
    pub(crate) fn resolve(
        self,
        services: &ServiceProvider,
    ) -> Result<ResolvedInstrumentation, MeterProviderError> {
        tracing::trace!(
            target: "meter_provider_lifecycle",
            instrumentation = self.type_name,
            "Creating instrumentation"
        );
        match self.source {
            InstrumentationSource::Factory(factory) => Ok(ResolvedInstrumentation {
                instance: factory(),
                owned: true,
            }),
            InstrumentationSource::Service(resolve) => Ok(ResolvedInstrumentation {
                instance: resolve(services)?,
                owned: false,
            }),
        }
    }
}

pub(crate) enum ReaderRegistration {
    Instance(Arc<dyn MetricReader>),
    Service {
        type_name: &'static str,
        resolve: ServiceResolver<dyn MetricReader>,
    },
}

impl ReaderRegistration {
    pub(crate) fn resolve(
        self,
        services: &ServiceProvider,
    ) -> Result<Arc<dyn MetricReader>, MeterProviderError> {
        match self {
            ReaderRegistration::Instance(reader) => Ok(reader),
            ReaderRegistration::Service { type_name, resolve } => {
                tracing::trace!(
                    target: "meter_provider_lifecycle",
                    reader = type_name,
                    "Resolving reader from services"
                );
                resolve(services)
            }
        }
    }
}

/// Everything registered on a builder so far.
///
/// Meter names are kept once each, in the order first added. Instrumentations
/// and readers keep every registration, duplicates included.
#[derive(Default)]
pub struct BuilderState {
    pub(crate) meter_sources: Vec<String>,
    pub(crate) instrumentations: Vec<InstrumentationRegistration>,
    pub(crate) readers: Vec<ReaderRegistration>,
    pub(crate) deferred: VecDeque<DeferredCallback>,
    pub(crate) resource: ResourceConfiguration,
}

impl BuilderState {
    /// Meter names added so far.
    pub fn meter_sources(&self) -> &[String] {
        &self.meter_sources
    }

    /// Returns `true` if `name` was added verbatim.
    pub fn contains_meter(&self, name: &str) -> bool {
        self.meter_sources.iter().any(|m| m == name)
    }

    /// Number of instrumentation registrations.
    pub fn instrumentation_count(&self) -> usize {
        self.instrumentations.len()
    }

    /// Number of reader registrations.
    pub fn reader_count(&self) -> usize {
        self.readers.len()
    }

    /// Number of deferred callbacks waiting to run.
    pub fn pending_callbacks(&self) -> usize {
        self.deferred.len()
    }

    pub(crate) fn add_meter(&mut self, name: String) {
        if !self.contains_meter(&name) {
            self.meter_sources.push(name);
        }
    }

    /// Appends `other` after everything already registered here.
    pub(crate) fn merge(&mut self, other: BuilderState) {
        for name in other.meter_sources {
            self.add_meter(name);
        }
        self.instrumentations.extend(other.instrumentations);
        self.readers.extend(other.readers);
        self.deferred.extend(other.deferred);
        self.resource.append(other.resource);
    }
}

impl fmt::Debug for BuilderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuilderState")
            .field("meter_sources", &self.meter_sources)
            .field("instrumentations", &self.instrumentations.len())
            .field("readers", &self.readers.len())
            .field("deferred", &self.deferred.len())
            .field("resource", &self.resource)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Probe;

    impl Service for Probe {}

    fn factory_registration() -> InstrumentationRegistration {
        InstrumentationRegistration {
            type_name: "Probe",
            source: InstrumentationSource::Factory(Box::new(|| Arc::new(Probe))),
        }
    }

    #[test]
    fn meter_names_are_kept_once() {
        let mut state = BuilderState::default();
        state.add_meter("a".to_string());
        state.add_meter("b".to_string());
        state.add_meter("a".to_string());

        assert_eq!(state.meter_sources(), ["a", "b"]);
        assert!(state.contains_meter("b"));
        assert!(!state.contains_meter("c"));
    }

    #[test]
    fn merge_appends_in_order() {
        let mut first = BuilderState::default();
        first.add_meter("shared".to_string());
        first.instrumentations.push(factory_registration());
        first.deferred.push_back(Box::new(|_, _| Ok(())));

        let mut second = BuilderState::default();
        second.add_meter("shared".to_string());
        second.add_meter("extra".to_string());
        second.instrumentations.push(factory_registration());
        second.deferred.push_back(Box::new(|_, _| Ok(())));

        first.merge(second);

        assert_eq!(first.meter_sources(), ["shared", "extra"]);
        assert_eq!(first.instrumentation_count(), 2);
        assert_eq!(first.pending_callbacks(), 2);
        assert_eq!(first.reader_count(), 0);
    }

    #[test]
    fn factory_instrumentations_are_provider_owned() {
        let services = crate::services::ServiceCollection::new().build_service_provider();
        let resolved = factory_registration().resolve(&services).unwrap();

        assert!(resolved.owned);
        assert!(resolved.instance.is::<Probe>());
    }

    #[test]
    fn missing_reader_service_fails_resolution() {
        let services = crate::services::ServiceCollection::new().build_service_provider();
        let registration = ReaderRegistration::Service {
            type_name: "Missing",
            resolve: Box::new(|_: &ServiceProvider| {
                Err(MeterProviderError::MissingService {
                    type_name: "Missing",
                })
            }),
        };

        assert!(matches!(
            registration.resolve(&services),
            Err(MeterProviderError::MissingService { .. })
        ));
    }
}
