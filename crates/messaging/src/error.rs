//! Error types for message transports and channels.

use thiserror::Error;

/// Result type alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Errors that can occur while connecting or using a channel.
///
/// These never reach RPC callers directly; the caller side folds them into
/// a failed [`ServiceCallResult`](corelib::ServiceCallResult).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Nothing is listening at the contact point.
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),
    /// Both sides are reachable but speak different protocol versions.
    #[error("Protocol version mismatch: local {local}, remote {remote}")]
    ProtocolMismatch { local: u32, remote: u32 },
    /// The channel is not (or no longer) in the established state.
    #[error("Channel {channel_id} is not usable in state {state}")]
    ChannelNotUsable { channel_id: String, state: String },
    /// The remote side went away while a message was in flight.
    #[error("Disconnected: {0}")]
    Disconnected(String),
    /// No response within the allowed time.
    #[error("Operation timed out")]
    Timeout,
    /// No transport is registered for the contact point.
    #[error("Unknown transport: {0}")]
    UnknownTransport(String),
    /// A contact point string could not be parsed.
    #[error("Invalid contact point: {0}")]
    InvalidContactPoint(String),
}
