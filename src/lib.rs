//! Deferred composition and lifecycle management for meter providers.
//!
//! A [`MeterProviderBuilder`] collects meters, instrumentations, readers and
//! resource configuration from any number of call sites, then assembles a
//! [`MeterProvider`] once a [`ServiceProvider`] is available. Callbacks
//! queued with [`MeterProviderBuilder::configure_builder`] run after the
//! container exists and may queue further callbacks.
//!
//! Providers are built in one of two ownership modes:
//! - standalone: [`MeterProviderBuilder::build`] creates the container and the
//!   provider disposes it;
//! - embedded: [`MetricsServiceCollectionExt::configure_metrics`] registers
//!   the provider with an external [`ServiceCollection`], whose provider
//!   builds and disposes it.
//!
//! # Example
//!
//! ```no_run
//! use meter_provider_builder::{
//!     MeterProvider, MeterProviderError, MetricsServiceCollectionExt, ServiceCollection,
//! };
//!
//! fn main() -> Result<(), MeterProviderError> {
//!     let mut services = ServiceCollection::new();
//!     services.configure_metrics(|builder| {
//!         builder.add_meter("MyCompany.*")?.configure_resource(|r| {
//!             r.add_service("my-service");
//!         })?;
//!         Ok(())
//!     })?;
//!
//!     let services = services.build_service_provider();
//!     let provider = services.get_required_service::<MeterProvider>()?;
//!     assert!(provider.is_meter_enabled("MyCompany.Orders"));
//!
//!     // Disposing the container disposes the provider.
//!     services.dispose();
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod assemble;
mod builder;
mod config;
mod error;
mod provider;
mod reader;
mod resource;
mod services;
mod state;

pub use builder::{MeterProviderBuilder, MetricsServiceCollectionExt};
pub use config::{MetricsConfig, MetricsConfigBuilder, ResourceConfig};
pub use error::{BoxError, MeterProviderError};
pub use provider::{MeterProvider, MeterSources};
pub use reader::{CompositeMetricReader, MetricReader, ReaderNode, Readers};
pub use resource::ResourceBuilder;
pub use services::{Service, ServiceCollection, ServiceProvider};
pub use state::{BuilderState, DeferredCallback};

/// Re-exported for version compatibility with this crate's dependencies.
pub use opentelemetry;
/// Re-exported for version compatibility with this crate's dependencies.
pub use opentelemetry_sdk;
/// Re-exported for version compatibility with this crate's dependencies.
pub use tracing;

/// Re-exported for users who want to construct custom configuration providers.
pub use figment;

/// Creates a fresh standalone [`MeterProviderBuilder`].
///
/// Every call returns an independent builder.
pub fn meter_provider_builder() -> MeterProviderBuilder {
    MeterProviderBuilder::new()
}
