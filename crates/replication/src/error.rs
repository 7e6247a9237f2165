//! Error types for node property replication.

use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Errors that can occur while decoding or merging node properties.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplicationError {
    /// Identity or registry invariant errors from the core library.
    #[error(transparent)]
    Core(#[from] corelib::Error),
    /// A single property record could not be decoded or is invalid.
    #[error("Malformed node property record: {0}")]
    MalformedRecord(String),
    /// An update message could not be decoded.
    #[error("Malformed node property update: {0}")]
    MalformedUpdate(String),
}

impl ReplicationError {
    /// True for invariant violations that indicate a bug or a duplicate
    /// node in the network, as opposed to bad input.
    pub fn is_inconsistency(&self) -> bool {
        matches!(self, ReplicationError::Core(corelib::Error::RegistryInconsistency(_)))
    }
}

impl From<serde_json::Error> for ReplicationError {
    fn from(e: serde_json::Error) -> Self {
        ReplicationError::MalformedUpdate(e.to_string())
    }
}
