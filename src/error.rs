//! Error types for meter provider composition and lifecycle.

use figment::Error as FigmentError;
use opentelemetry_sdk::error::OTelSdkError;

/// Boxed error returned by user-supplied callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors from building, resolving, and shutting down a meter provider.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum MeterProviderError {
    /// The operation is not allowed in the builder's current lifecycle phase.
    #[error("invalid builder state: {0}")]
    InvalidState(&'static str),

    /// The operation is structurally disallowed for this builder.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    /// A registration carried invalid content.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// A required service was never registered with the container.
    #[error("no service registered for type {type_name}")]
    MissingService {
        /// Name of the requested type.
        type_name: &'static str,
    },

    /// A singleton factory (indirectly) requested its own type.
    #[error("circular dependency while resolving {type_name}")]
    CircularDependency {
        /// Name of the type whose resolution re-entered itself.
        type_name: &'static str,
    },

    /// A user callback failed.
    #[error("callback failed")]
    Callback(#[source] BoxError),

    /// Failed to extract configuration from sources.
    #[error("configuration error: {0}")]
    Config(#[source] Box<FigmentError>),

    /// Failed to shut down the provider's reader.
    #[error("failed to shut down meter provider")]
    Shutdown(#[source] OTelSdkError),
}

impl MeterProviderError {
    /// Wraps an arbitrary error raised inside a callback.
    pub fn callback(error: impl Into<BoxError>) -> Self {
        Self::Callback(error.into())
    }
}

impl From<FigmentError> for MeterProviderError {
    fn from(error: FigmentError) -> Self {
        Self::Config(Box::new(error))
    }
}
