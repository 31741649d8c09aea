use std::sync::Arc;

use thiserror::Error;

/// Represents a result type for fallible construction and lookup operations.
///
/// Resolution itself never returns this type: every anomaly found while resolving a decision is
/// absorbed into [`DecisionReasons`](crate::decision::DecisionReasons) and a well-formed decision
/// with no variation.
pub type Result<T> = std::result::Result<T, Error>;

/// Enum representing possible errors raised while building configuration or looking up entities.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// A condition leaf names a match type that is not registered.
    #[error("unknown match type: {0}")]
    UnknownMatchType(String),

    /// A condition could not be interpreted (operand of the wrong type for its match type, or a
    /// malformed condition tree).
    #[error("invalid audience condition: {0}")]
    InvalidCondition(String),

    /// Datafile JSON could not be deserialized into the configuration model.
    #[error("error parsing configuration")]
    // serde_json::Error is not clonable, so we're wrapping it in an Arc.
    ConfigurationParseError(#[source] Arc<serde_json::Error>),

    /// No experiment with the requested key exists in configuration.
    #[error("experiment not found: {0}")]
    UnknownExperiment(String),

    /// No feature flag with the requested key exists in configuration.
    #[error("flag not found: {0}")]
    UnknownFlag(String),
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::ConfigurationParseError(Arc::new(value))
    }
}
