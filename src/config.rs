//! Configuration types for seeding a meter provider builder.
//!
//! [`MetricsConfig`] is deserialised with figment from layered sources:
//! 1. Compiled defaults
//! 2. An optional TOML file
//! 3. Prefixed environment variables
//! 4. Standard OpenTelemetry environment variables
//! 5. Programmatic overrides
//!
//! Later sources take precedence. The result is applied to a builder with
//! [`MeterProviderBuilder::apply_config`](crate::MeterProviderBuilder::apply_config).

use crate::error::MeterProviderError;
use crate::resource::ResourceBuilder;
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Meters and resource attributes to register on a builder.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Meter names to listen to. `*` acts as a wildcard.
    pub meters: Vec<String>,

    /// Resource configuration.
    pub resource: ResourceConfig,
}

/// Resource configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    /// Service name.
    pub service_name: Option<String>,

    /// Service version.
    pub service_version: Option<String>,

    /// Deployment environment (e.g., "production", "staging").
    pub deployment_environment: Option<String>,

    /// Additional resource attributes.
    pub attributes: HashMap<String, String>,

    /// Whether to read `OTEL_RESOURCE_ATTRIBUTES` and `OTEL_SERVICE_NAME`
    /// when the resource is built.
    pub detect_environment: bool,
}

impl ResourceConfig {
    /// Creates a new resource config with a service name.
    pub fn with_service_name(name: impl Into<String>) -> Self {
        Self {
            service_name: Some(name.into()),
            ..Default::default()
        }
    }

    /// Adds the configured attributes to `builder`.
    ///
    /// Detected attributes come first, then `attributes` sorted by key, then
    /// the explicit service and deployment fields, so explicit fields win.
    pub fn apply(&self, builder: &mut ResourceBuilder) {
        if self.detect_environment {
            builder.add_environment_variables();
        }

        let mut attributes: Vec<_> = self.attributes.iter().collect();
        attributes.sort();
        for (key, value) in attributes {
            builder.add_attribute(key.clone(), value.clone());
        }

        if let Some(name) = &self.service_name {
            builder.add_service(name.clone());
        }

        if let Some(version) = &self.service_version {
            builder.add_service_version(version.clone());
        }

        if let Some(env) = &self.deployment_environment {
            builder.add_attribute("deployment.environment.name", env.clone());
        }
    }
}

/// Layers configuration sources into a [`MetricsConfig`].
///
/// # Example
///
/// ```no_run
/// use meter_provider_builder::{MeterProviderBuilder, MeterProviderError, MetricsConfigBuilder};
///
/// fn main() -> Result<(), MeterProviderError> {
///     let config = MetricsConfigBuilder::new()
///         .with_file("/etc/metrics.toml")
///         .with_env("METRICS_")
///         .with_standard_env()
///         .meter("MyCompany.*")
///         .extract()?;
///
///     let mut builder = MeterProviderBuilder::new();
///     builder.apply_config(&config)?;
///     let _provider = builder.build()?;
///     Ok(())
/// }
/// ```
#[must_use = "builders do nothing unless .extract() is called"]
pub struct MetricsConfigBuilder {
    figment: Figment,
    meters: Vec<String>,
    resource_attributes: HashMap<String, String>,
}

impl MetricsConfigBuilder {
    /// Creates a builder seeded with [`MetricsConfig::default`].
    pub fn new() -> Self {
        Self::from_figment(Figment::from(Serialized::defaults(MetricsConfig::default())))
    }

    /// Creates a builder from an existing figment.
    pub fn from_figment(figment: Figment) -> Self {
        Self {
            figment,
            meters: Vec::new(),
            resource_attributes: HashMap::new(),
        }
    }

    /// Merges configuration from a TOML file.
    ///
    /// If the file doesn't exist, it's silently skipped.
    pub fn with_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        let path = path.as_ref();
        if path.exists() {
            self.figment = self.figment.merge(Toml::file(path));
        } else {
            tracing::debug!(
                target: "meter_provider_lifecycle",
                path = %path.display(),
                "Configuration file not found, skipping"
            );
        }
        self
    }

    /// Merges configuration from environment variables with the given prefix.
    ///
    /// Nested keys are separated by a double underscore. With prefix
    /// `METRICS_`:
    /// - `METRICS_RESOURCE__SERVICE_NAME` → `resource.service_name`
    /// - `METRICS_RESOURCE__DETECT_ENVIRONMENT` → `resource.detect_environment`
    pub fn with_env(mut self, prefix: &str) -> Self {
        self.figment = self.figment.merge(Env::prefixed(prefix).split("__"));
        self
    }

    /// Merges `OTEL_SERVICE_NAME` into `resource.service_name` when it is set
    /// and not blank.
    pub fn with_standard_env(mut self) -> Self {
        if let Ok(service_name) = std::env::var("OTEL_SERVICE_NAME")
            && !service_name.trim().is_empty()
        {
            self.figment = self
                .figment
                .merge(Serialized::default("resource.service_name", service_name));
        }
        self
    }

    /// Adds a meter name after those from other sources.
    pub fn meter(mut self, name: impl Into<String>) -> Self {
        self.meters.push(name.into());
        self
    }

    /// Sets the service name resource attribute.
    pub fn service_name(mut self, name: impl Into<String>) -> Self {
        self.figment = self
            .figment
            .merge(Serialized::default("resource.service_name", name.into()));
        self
    }

    /// Sets the service version resource attribute.
    pub fn service_version(mut self, version: impl Into<String>) -> Self {
        self.figment = self.figment.merge(Serialized::default(
            "resource.service_version",
            version.into(),
        ));
        self
    }

    /// Sets the deployment environment resource attribute.
    pub fn deployment_environment(mut self, env: impl Into<String>) -> Self {
        self.figment = self.figment.merge(Serialized::default(
            "resource.deployment_environment",
            env.into(),
        ));
        self
    }

    /// Adds a resource attribute.
    pub fn resource_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.resource_attributes.insert(key.into(), value.into());
        self
    }

    /// Enables or disables environment resource detection.
    ///
    /// Default: disabled
    pub fn detect_environment(mut self, enabled: bool) -> Self {
        self.figment = self
            .figment
            .merge(Serialized::default("resource.detect_environment", enabled));
        self
    }

    /// Extracts the layered configuration.
    ///
    /// # Errors
    ///
    /// Returns [`MeterProviderError::Config`] if a source can't be read or
    /// deserialised, and [`MeterProviderError::Configuration`] if a meter
    /// name is blank.
    pub fn extract(self) -> Result<MetricsConfig, MeterProviderError> {
        let mut config: MetricsConfig = self.figment.extract()?;

        for name in self.meters {
            if !config.meters.contains(&name) {
                config.meters.push(name);
            }
        }

        // Attributes that couldn't go through figment
        config.resource.attributes.extend(self.resource_attributes);

        if config.meters.iter().any(|m| m.trim().is_empty()) {
            return Err(MeterProviderError::Configuration(
                "meter name must not be empty".to_string(),
            ));
        }

        Ok(config)
    }
}

impl Default for MetricsConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
