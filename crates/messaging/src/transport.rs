//! Transport abstraction.
//!
//! A transport knows how to reach a contact point and how to move a
//! [`NetworkRequest`] to the other side and its [`NetworkResponse`] back. It
//! knows nothing about RPC or node properties. Three seams:
//!
//! - [`TransportProvider`]: connect to a contact point, run servers
//! - [`ChannelLink`]: the transport-specific half of one channel
//! - [`MessageChannelEndpointHandler`]: the local side that answers
//!   inbound requests (implemented by the channel service)

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use corelib::InstanceSessionId;

use crate::channel::MessageChannel;
use crate::config::ChannelServiceConfig;
use crate::error::{Result, TransportError};
use crate::protocol::{NetworkRequest, NetworkResponse};

/// Where a node can be reached: `<transport id>:<address>`.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct ContactPoint {
    transport_id: String,
    address: String,
}

impl ContactPoint {
    pub fn new(transport_id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            transport_id: transport_id.into(),
            address: address.into(),
        }
    }

    pub fn transport_id(&self) -> &str {
        &self.transport_id
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

impl fmt::Display for ContactPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.transport_id, self.address)
    }
}

impl FromStr for ContactPoint {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once(':') {
            Some((transport, address)) if !transport.is_empty() && !address.is_empty() => {
                Ok(ContactPoint::new(transport, address))
            }
            _ => Err(TransportError::InvalidContactPoint(s.to_owned())),
        }
    }
}

/// Moves requests of one channel to the remote side.
///
/// Implementations must not interpret payloads. An `Err` means the channel
/// is unusable from now on; the channel marks itself broken.
#[async_trait]
pub trait ChannelLink: Send + Sync + 'static {
    async fn exchange(&self, channel_id: &str, request: NetworkRequest) -> Result<NetworkResponse>;
}

/// The local side of a channel endpoint: answers inbound requests and is
/// told about channels the remote side opened towards it.
#[async_trait]
pub trait MessageChannelEndpointHandler: Send + Sync + 'static {
    /// Session presented to the remote side in the handshake.
    fn local_session(&self) -> InstanceSessionId;

    /// A duplex connect created a channel from this node back to the
    /// connecting node.
    fn on_remote_initiated_channel_established(&self, channel: Arc<MessageChannel>);

    /// Handle one inbound request that arrived over the channel `channel_id`
    /// (the sender's channel id).
    async fn on_request(&self, channel_id: &str, request: NetworkRequest) -> NetworkResponse;
}

/// A pluggable transport.
#[async_trait]
pub trait TransportProvider: Send + Sync + 'static {
    /// Id used as the first part of contact points.
    fn transport_id(&self) -> &str;

    /// Open an established channel to `address`.
    ///
    /// With `allow_duplex`, the remote side also gets a channel back to
    /// the caller, cross-linked via mirror ids.
    async fn connect(
        &self,
        local: Arc<dyn MessageChannelEndpointHandler>,
        address: &str,
        config: &ChannelServiceConfig,
        allow_duplex: bool,
    ) -> Result<Arc<MessageChannel>>;

    /// Accept connections at `address`.
    async fn start_server(
        &self,
        address: &str,
        handler: Arc<dyn MessageChannelEndpointHandler>,
        protocol_version: u32,
    ) -> Result<()>;

    /// Stop accepting connections at `address`. Existing channels into it
    /// break on their next use.
    async fn stop_server(&self, address: &str) -> Result<()>;
}
