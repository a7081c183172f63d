//! Turns accumulated builder state into a [`MeterProvider`].
//!
//! Assembly runs in two phases against an already resolved
//! [`ServiceProvider`]: deferred builder callbacks are drained as a FIFO queue,
//! then readers, instrumentations and the resource are materialised.

use crate::builder::MeterProviderBuilder;
use crate::error::MeterProviderError;
use crate::provider::{MeterProvider, MeterSources};
use crate::reader::{CompositeMetricReader, MetricReader};
use crate::services::{ServiceCollection, ServiceProvider};
use crate::state::BuilderState;
use std::sync::Arc;

/// Builds a provider that owns a service provider created from `services`.
pub(crate) fn build_owned(
    services: ServiceCollection,
    mut state: BuilderState,
) -> Result<MeterProvider, MeterProviderError> {
    let provider_services = services.build_service_provider();

    if let Some(pending) = provider_services.take_configurations::<BuilderState>() {
        for contributed in pending {
            state.merge(contributed);
        }
    }

    // On failure `provider_services` is dropped, which disposes it.
    let provider = assemble(&provider_services, state)?;
    Ok(provider.with_owned_services(provider_services))
}

/// Builds the provider registered by `configure_metrics` inside an external
/// container.
pub(crate) fn build_from_services(
    services: &ServiceProvider,
) -> Result<MeterProvider, MeterProviderError> {
    let pending = services
        .take_configurations::<BuilderState>()
        .ok_or(MeterProviderError::InvalidState(
            "meter provider configuration was already consumed by another build",
        ))?;

    let mut state = BuilderState::default();
    for contributed in pending {
        state.merge(contributed);
    }

    assemble(services, state)
}

fn assemble(
    services: &ServiceProvider,
    state: BuilderState,
) -> Result<MeterProvider, MeterProviderError> {
    let state = drain(services, state)?;
    materialize(services, state)
}

fn drain(
    services: &ServiceProvider,
    state: BuilderState,
) -> Result<BuilderState, MeterProviderError> {
    let mut builder = MeterProviderBuilder::resolved(state);
    let mut invocations = 0_usize;

    // Callbacks may queue further callbacks, so the queue is re-checked each turn.
    while let Some(callback) = builder.pop_deferred() {
        invocations += 1;
        tracing::trace!(
            target: "meter_provider_lifecycle",
            invocation = invocations,
            queued = builder.state().pending_callbacks(),
            "Running deferred builder callback"
        );
        callback(services, &mut builder)?;
    }

    tracing::debug!(
        target: "meter_provider_lifecycle",
        invocations,
        "Deferred builder callbacks drained"
    );
    Ok(builder.into_state())
}

fn materialize(
    services: &ServiceProvider,
    state: BuilderState,
) -> Result<MeterProvider, MeterProviderError> {
    let BuilderState {
        meter_sources,
        instrumentations,
        readers,
        resource,
        ..
    } = state;

    let meter_sources = MeterSources::new(meter_sources)?;

    let mut resolved = Vec::with_capacity(readers.len());
    for registration in readers {
        resolved.push(registration.resolve(services)?);
    }
    let reader_count = resolved.len();
    let reader: Option<Arc<dyn MetricReader>> = match reader_count {
        0 | 1 => resolved.pop(),
        _ => Some(Arc::new(CompositeMetricReader::new(resolved)?)),
    };

    let mut live = Vec::with_capacity(instrumentations.len());
    for registration in instrumentations {
        match registration.resolve(services) {
            Ok(instrumentation) => live.push(instrumentation),
            Err(e) => {
                for created in live.iter().rev().filter(|i| i.owned) {
                    created.instance.dispose();
                }
                return Err(e);
            }
        }
    }

    let resource = resource.resolve();

    tracing::debug!(
        target: "meter_provider_lifecycle",
        meters = meter_sources.names().len(),
        instrumentations = live.len(),
        readers = reader_count,
        resource_attributes = resource.len(),
        "Meter provider assembled"
    );

    Ok(MeterProvider::new(resource, meter_sources, live, reader))
}
