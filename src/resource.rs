//! Resource attribute accumulation.
//!
//! A [`ResourceBuilder`] is the working set of attributes that ends up as the
//! provider's [`Resource`]. The builder front records resource operations in a
//! [`ResourceConfiguration`] log: setting a builder replaces the accumulator,
//! configuring one appends a callback. The log is replayed in call order when
//! the provider is materialised.

use opentelemetry::{Key, KeyValue, Value};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::resource::{
    EnvResourceDetector, ResourceDetector, TelemetryResourceDetector,
};
use opentelemetry_semantic_conventions::resource::{SERVICE_NAME, SERVICE_VERSION};
use std::fmt;

/// Ordered, key-unique set of resource attributes.
///
/// Adding an attribute whose key is already present overwrites the earlier
/// value in place.
#[derive(Debug, Clone, Default)]
pub struct ResourceBuilder {
    attributes: Vec<KeyValue>,
}

impl ResourceBuilder {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an attribute, replacing any earlier value for the same key.
    pub fn add_attribute(&mut self, key: impl Into<Key>, value: impl Into<Value>) -> &mut Self {
        self.upsert(KeyValue::new(key, value));
        self
    }

    /// Adds several attributes in order.
    pub fn add_attributes<I>(&mut self, attributes: I) -> &mut Self
    where
        I: IntoIterator<Item = KeyValue>,
    {
        for attribute in attributes {
            self.upsert(attribute);
        }
        self
    }

    /// Sets `service.name`.
    pub fn add_service(&mut self, name: impl Into<String>) -> &mut Self {
        self.add_attribute(SERVICE_NAME, name.into())
    }

    /// Sets `service.version`.
    pub fn add_service_version(&mut self, version: impl Into<String>) -> &mut Self {
        self.add_attribute(SERVICE_VERSION, version.into())
    }

    /// Runs `detector` now and adds everything it reports.
    pub fn add_detector(&mut self, detector: &dyn ResourceDetector) -> &mut Self {
        let detected = detector.detect();
        self.add_attributes(
            detected
                .iter()
                .map(|(key, value)| KeyValue::new(key.clone(), value.clone())),
        )
    }

    /// Adds the `telemetry.sdk.*` attributes.
    pub fn add_telemetry_sdk(&mut self) -> &mut Self {
        self.add_detector(&TelemetryResourceDetector)
    }

    /// Adds attributes from `OTEL_RESOURCE_ATTRIBUTES`, then `service.name`
    /// from `OTEL_SERVICE_NAME` when it is set and non-empty.
    pub fn add_environment_variables(&mut self) -> &mut Self {
        self.add_detector(&EnvResourceDetector::new());

        if let Ok(name) = std::env::var("OTEL_SERVICE_NAME")
            && !name.trim().is_empty()
        {
            self.add_service(name);
        }

        self
    }

    /// Returns the number of attributes.
    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    /// Returns `true` if no attribute has been added.
    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    /// Returns the value stored for `key`.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.attributes
            .iter()
            .find(|kv| kv.key.as_str() == key)
            .map(|kv| &kv.value)
    }

    /// Iterates over the attributes in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &KeyValue> {
        self.attributes.iter()
    }

    /// Builds the final resource.
    pub fn build(&self) -> Resource {
        Resource::builder_empty()
            .with_attributes(self.attributes.iter().cloned())
            .build()
    }

    fn upsert(&mut self, attribute: KeyValue) {
        match self.attributes.iter_mut().find(|kv| kv.key == attribute.key) {
            Some(existing) => existing.value = attribute.value,
            None => self.attributes.push(attribute),
        }
    }
}

pub(crate) type ResourceCallback = Box<dyn FnOnce(&mut ResourceBuilder) + Send>;

enum ResourceOp {
    Replace(ResourceBuilder),
    Configure(ResourceCallback),
}

/// Call-ordered log of `set_resource_builder` and `configure_resource` calls.
#[derive(Default)]
pub(crate) struct ResourceConfiguration {
    ops: Vec<ResourceOp>,
}

impl ResourceConfiguration {
    pub(crate) fn replace(&mut self, builder: ResourceBuilder) {
        self.ops.push(ResourceOp::Replace(builder));
    }

    pub(crate) fn configure(&mut self, callback: ResourceCallback) {
        self.ops.push(ResourceOp::Configure(callback));
    }

    pub(crate) fn append(&mut self, other: ResourceConfiguration) {
        self.ops.extend(other.ops);
    }

    /// Replays the log against an initially empty accumulator.
    pub(crate) fn resolve(self) -> Resource {
        let mut current = ResourceBuilder::new();
        for op in self.ops {
            match op {
                ResourceOp::Replace(builder) => current = builder,
                ResourceOp::Configure(callback) => callback(&mut current),
            }
        }
        current.build()
    }
}

impl fmt::Debug for ResourceConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceConfiguration")
            .field("operations", &self.ops.len())
            .finish()
    }
}
