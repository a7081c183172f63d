//! The assembled meter provider and its lifecycle.
//!
//! A [`MeterProvider`] owns its reader chain and the instrumentations it
//! created. A provider built standalone also owns the [`ServiceProvider`] it
//! was resolved from; a provider resolved from an external container does not,
//! and is disposed by that container instead.

use crate::error::MeterProviderError;
use crate::reader::MetricReader;
use crate::services::{Service, ServiceProvider};
use crate::state::ResolvedInstrumentation;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::error::{OTelSdkError, OTelSdkResult};
use regex::{Regex, RegexBuilder};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Meter names a provider listens to.
///
/// Names match case-insensitively; `*` matches any run of characters.
#[derive(Debug, Clone)]
pub struct MeterSources {
    names: Vec<String>,
    pattern: Option<Regex>,
}

impl MeterSources {
    pub(crate) fn new(names: Vec<String>) -> Result<Self, MeterProviderError> {
        if names.is_empty() {
            return Ok(Self {
                names,
                pattern: None,
            });
        }

        let alternatives = names
            .iter()
            .map(|name| regex::escape(name).replace(r"\*", ".*"))
            .collect::<Vec<_>>()
            .join("|");
        let pattern = RegexBuilder::new(&format!("^(?:{alternatives})$"))
            .case_insensitive(true)
            .build()
            .map_err(|e| MeterProviderError::Configuration(e.to_string()))?;

        Ok(Self {
            names,
            pattern: Some(pattern),
        })
    }

    /// The configured names, wildcards included.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Returns `true` if a meter called `name` is enabled.
    pub fn matches(&self, name: &str) -> bool {
        self.pattern.as_ref().is_some_and(|p| p.is_match(name))
    }
}

/// A fully assembled metrics pipeline.
///
/// Disposal runs at most once, either explicitly through
/// [`dispose`](Self::dispose), through the owning container, or on drop.
pub struct MeterProvider {
    resource: Resource,
    meter_sources: MeterSources,
    instrumentations: Vec<Arc<dyn Service>>,
    owned_instrumentations: Vec<Arc<dyn Service>>,
    reader: Option<Arc<dyn MetricReader>>,
    owned_services: Option<ServiceProvider>,
    shut_down: AtomicBool,
    disposed: AtomicBool,
}

impl MeterProvider {
    pub(crate) fn new(
        resource: Resource,
        meter_sources: MeterSources,
        instrumentations: Vec<ResolvedInstrumentation>,
        reader: Option<Arc<dyn MetricReader>>,
    ) -> Self {
        let owned_instrumentations = instrumentations
            .iter()
            .filter(|i| i.owned)
            .map(|i| Arc::clone(&i.instance))
            .collect();

        Self {
            resource,
            meter_sources,
            instrumentations: instrumentations.into_iter().map(|i| i.instance).collect(),
            owned_instrumentations,
            reader,
            owned_services: None,
            shut_down: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        }
    }

    pub(crate) fn with_owned_services(mut self, services: ServiceProvider) -> Self {
        self.owned_services = Some(services);
        self
    }

    /// The merged resource.
    pub fn resource(&self) -> &Resource {
        &self.resource
    }

    /// Meter names this provider listens to.
    pub fn meter_sources(&self) -> &MeterSources {
        &self.meter_sources
    }

    /// Returns `true` if a meter called `name` is enabled.
    pub fn is_meter_enabled(&self, name: &str) -> bool {
        self.meter_sources.matches(name)
    }

    /// Live instrumentations, in registration order.
    pub fn instrumentations(&self) -> &[Arc<dyn Service>] {
        &self.instrumentations
    }

    /// The reader: the sole registered reader, a
    /// [`CompositeMetricReader`](crate::CompositeMetricReader) when several
    /// were registered, or `None` when there were none.
    pub fn reader(&self) -> Option<&Arc<dyn MetricReader>> {
        self.reader.as_ref()
    }

    /// The service provider this meter provider created and owns, if it was
    /// built standalone.
    pub fn owned_service_provider(&self) -> Option<&ServiceProvider> {
        self.owned_services.as_ref()
    }

    /// Returns `true` once the provider has been disposed.
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Asks the reader to collect.
    pub fn collect(&self) -> OTelSdkResult {
        match self.active_reader()? {
            Some(reader) => reader.collect(),
            None => Ok(()),
        }
    }

    /// Flushes the reader.
    pub fn force_flush(&self) -> OTelSdkResult {
        match self.active_reader()? {
            Some(reader) => reader.force_flush(),
            None => Ok(()),
        }
    }

    /// Flushes and shuts down the reader.
    ///
    /// # Errors
    ///
    /// The reader is shut down even when the flush fails.
    ///
    /// Returns [`MeterProviderError::Shutdown`] if the reader fails to flush or
    /// shut down, or if the provider was already shut down. When both steps
    /// fail, the two messages are folded into one
    /// [`OTelSdkError::InternalFailure`].
    pub fn shutdown(&self) -> Result<(), MeterProviderError> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Err(MeterProviderError::Shutdown(OTelSdkError::AlreadyShutdown));
        }

        let Some(reader) = &self.reader else {
            return Ok(());
        };

        let flushed = reader.force_flush();
        if let Err(e) = &flushed {
            tracing::debug!(
                target: "meter_provider_lifecycle",
                error = %e,
                "Failed to flush reader before shutdown"
            );
        }

        match (flushed, reader.shutdown()) {
            (Ok(()), Ok(())) => Ok(()),
            (Err(e), Ok(())) | (Ok(()), Err(e)) => Err(MeterProviderError::Shutdown(e)),
            (Err(flush), Err(shutdown)) => Err(MeterProviderError::Shutdown(
                OTelSdkError::InternalFailure(format!(
                    "flush failed: {flush}; shutdown failed: {shutdown}"
                )),
            )),
        }
    }

    /// Shuts down the reader if still running, disposes instrumentations this
    /// provider created, then the owned service provider, if any.
    ///
    /// Subsequent calls do nothing.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        tracing::debug!(
            target: "meter_provider_lifecycle",
            owns_services = self.owned_services.is_some(),
            "Disposing meter provider"
        );

        if !self.shut_down.load(Ordering::Acquire)
            && let Err(e) = self.shutdown()
        {
            tracing::error!(
                target: "meter_provider_lifecycle",
                error = %e,
                "Failed to shut down meter provider"
            );
        }

        for instrumentation in self.owned_instrumentations.iter().rev() {
            instrumentation.dispose();
        }

        if let Some(services) = &self.owned_services {
            services.dispose();
        }
    }

    fn active_reader(&self) -> Result<Option<&Arc<dyn MetricReader>>, OTelSdkError> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(OTelSdkError::AlreadyShutdown);
        }
        Ok(self.reader.as_ref())
    }
}

impl Service for MeterProvider {
    fn dispose(&self) {
        MeterProvider::dispose(self);
    }
}

impl Drop for MeterProvider {
    fn drop(&mut self) {
        MeterProvider::dispose(self);
    }
}

impl fmt::Debug for MeterProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MeterProvider")
            .field("meter_sources", &self.meter_sources.names())
            .field("instrumentations", &self.instrumentations.len())
            .field("has_reader", &self.reader.is_some())
            .field("owns_services", &self.owned_services.is_some())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
