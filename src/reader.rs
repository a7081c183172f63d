//! Metric reader capability and the composite fan-out reader.

use crate::error::MeterProviderError;
use crate::services::Service;
use opentelemetry_sdk::error::{OTelSdkError, OTelSdkResult};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// A reader that pulls metrics out of the pipeline.
///
/// Collection and export semantics belong to the implementation; the provider
/// only forwards lifecycle calls to it.
pub trait MetricReader: Service {
    /// Collects pending metrics.
    fn collect(&self) -> OTelSdkResult;

    /// Flushes anything buffered by the reader.
    fn force_flush(&self) -> OTelSdkResult {
        Ok(())
    }

    /// Shuts the reader down.
    fn shutdown(&self) -> OTelSdkResult;
}

impl dyn MetricReader {
    /// Returns `true` if the reader is of type `T`.
    pub fn is<T: MetricReader>(&self) -> bool {
        let any: &dyn Any = self;
        any.is::<T>()
    }

    /// Returns a reference to the concrete reader if it is of type `T`.
    pub fn downcast_ref<T: MetricReader>(&self) -> Option<&T> {
        let any: &dyn Any = self;
        any.downcast_ref::<T>()
    }
}

/// One link of a [`CompositeMetricReader`] chain.
pub struct ReaderNode {
    value: Arc<dyn MetricReader>,
    next: Option<Box<ReaderNode>>,
}

impl ReaderNode {
    /// The reader held by this node.
    pub fn value(&self) -> &Arc<dyn MetricReader> {
        &self.value
    }

    /// The following node, if any.
    pub fn next(&self) -> Option<&ReaderNode> {
        self.next.as_deref()
    }
}

/// Forwards every reader operation to an ordered chain of readers.
///
/// Every node is visited even when an earlier node fails. The call succeeds
/// only if all nodes succeed; a single failure is returned unchanged, several
/// are folded into one [`OTelSdkError::InternalFailure`] listing each message
/// in chain order.
pub struct CompositeMetricReader {
    head: ReaderNode,
    len: usize,
}

impl CompositeMetricReader {
    /// Chains `readers` head to tail in iteration order.
    ///
    /// # Errors
    ///
    /// Returns [`MeterProviderError::Configuration`] if `readers` is empty.
    pub fn new<I>(readers: I) -> Result<Self, MeterProviderError>
    where
        I: IntoIterator<Item = Arc<dyn MetricReader>>,
    {
        let mut readers: Vec<_> = readers.into_iter().collect();
        let len = readers.len();

        let Some(last) = readers.pop() else {
            return Err(MeterProviderError::Configuration(
                "a composite reader needs at least one reader".to_string(),
            ));
        };

        let mut head = ReaderNode {
            value: last,
            next: None,
        };
        while let Some(reader) = readers.pop() {
            head = ReaderNode {
                value: reader,
                next: Some(Box::new(head)),
            };
        }

        Ok(Self { head, len })
    }

    /// The first registered reader's node.
    pub fn head(&self) -> &ReaderNode {
        &self.head
    }

    /// Number of readers in the chain.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Always `false`; a composite holds at least one reader.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Iterates over the readers in chain order.
    pub fn iter(&self) -> Readers<'_> {
        Readers {
            node: Some(&self.head),
        }
    }

    fn fan_out(
        &self,
        operation: &str,
        call: impl Fn(&dyn MetricReader) -> OTelSdkResult,
    ) -> OTelSdkResult {
        let mut failures = Vec::new();
        for (index, reader) in self.iter().enumerate() {
            if let Err(e) = call(&**reader) {
                tracing::debug!(
                    target: "meter_provider_lifecycle",
                    operation,
                    index,
                    error = %e,
                    "Reader in composite chain failed"
                );
                failures.push(e);
            }
        }

        if failures.len() > 1 {
            let message = failures
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            return Err(OTelSdkError::InternalFailure(format!(
                "{} of {} readers failed to {operation}: {message}",
                failures.len(),
                self.len
            )));
        }

        match failures.pop() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Service for CompositeMetricReader {}

impl MetricReader for CompositeMetricReader {
    fn collect(&self) -> OTelSdkResult {
        self.fan_out("collect", |r| r.collect())
    }

    fn force_flush(&self) -> OTelSdkResult {
        self.fan_out("flush", |r| r.force_flush())
    }

    fn shutdown(&self) -> OTelSdkResult {
        self.fan_out("shut down", |r| r.shutdown())
    }
}

impl fmt::Debug for CompositeMetricReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompositeMetricReader")
            .field("len", &self.len)
            .finish()
    }
}

impl<'a> IntoIterator for &'a CompositeMetricReader {
    type Item = &'a Arc<dyn MetricReader>;
    type IntoIter = Readers<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Iterator over the readers of a [`CompositeMetricReader`].
pub struct Readers<'a> {
    node: Option<&'a ReaderNode>,
}

impl<'a> Iterator for Readers<'a> {
    type Item = &'a Arc<dyn MetricReader>;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.node?;
        self.node = node.next();
        Some(&node.value)
    }
}
