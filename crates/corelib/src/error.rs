//! Error types for the core library.

use thiserror::Error;

/// Result type alias for the core library.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the core library.
///
/// Everything here is a *local*, synchronous failure. Failures that happen
/// while a call crosses the network are never raised as errors; they are
/// folded into a [`ServiceCallResult`](crate::rpc::ServiceCallResult).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// A string could not be parsed into the requested identifier kind.
    #[error("Malformed identifier: {0}")]
    MalformedIdentifier(String),
    /// An identifier conversion is not possible without extra information.
    #[error("Invalid identifier conversion from {from} to {to}: {reason}")]
    InvalidConversion {
        from: &'static str,
        to: &'static str,
        reason: String,
    },
    /// A service call request is missing a required field.
    #[error("Invalid service call request: {0}")]
    InvalidRequest(String),
    /// An internal invariant of a replicated registry was violated.
    #[error("Registry inconsistency: {0}")]
    RegistryInconsistency(String),
    /// A payload could not be encoded or decoded.
    #[error("Serialization failed: {0}")]
    Serialization(String),
    /// The persistent key/value store failed.
    #[error("Storage error: {0}")]
    Storage(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
