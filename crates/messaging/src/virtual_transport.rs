//! In-process transport for tests and simulations.
//!
//! A [`VirtualNetwork`] is a shared address book of running servers. Every
//! [`VirtualTransport`] created from the same network can reach every
//! server in it. Requests are handed to the remote endpoint handler
//! directly, each in its own task, so a panicking handler surfaces as
//! `ExceptionDuringDelivery` instead of taking the caller down.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use corelib::InstanceSessionId;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::channel::MessageChannel;
use crate::config::ChannelServiceConfig;
use crate::error::{Result, TransportError};
use crate::protocol::{NetworkRequest, NetworkResponse, ResultCode};
use crate::transport::{ChannelLink, MessageChannelEndpointHandler, TransportProvider};

/// Transport id of the virtual transport.
pub const VIRTUAL_TRANSPORT_ID: &str = "virtual";

struct VirtualServer {
    handler: Arc<dyn MessageChannelEndpointHandler>,
    session: InstanceSessionId,
    protocol_version: u32,
}

/// Shared address book of in-process servers.
#[derive(Default)]
pub struct VirtualNetwork {
    servers: DashMap<String, VirtualServer>,
}

impl VirtualNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn server_count(&self) -> usize {
        self.servers.len()
    }

    pub fn is_listening(&self, address: &str) -> bool {
        self.servers.contains_key(address)
    }

    fn server(&self, address: &str) -> Option<(Arc<dyn MessageChannelEndpointHandler>, InstanceSessionId, u32)> {
        self.servers.get(address).map(|server| {
            (
                Arc::clone(&server.handler),
                server.session.clone(),
                server.protocol_version,
            )
        })
    }
}

/// Deliver `request` to `handler` in a separate task.
async fn deliver(
    handler: Arc<dyn MessageChannelEndpointHandler>,
    channel_id: &str,
    request: NetworkRequest,
) -> NetworkResponse {
    let request_id = request.request_id();
    let channel_id = channel_id.to_owned();
    let delivery = tokio::spawn(async move { handler.on_request(&channel_id, request).await });
    match delivery.await {
        Ok(response) => response,
        Err(e) => {
            warn!(error = %e, "Virtual delivery failed");
            NetworkResponse::failure(request_id, ResultCode::ExceptionDuringDelivery, Bytes::new())
        }
    }
}

/// Client-to-server half: resolves the server on every send, so stopping
/// the server breaks the channel on its next use.
struct ServerLink {
    network: Arc<VirtualNetwork>,
    address: String,
    server_session: InstanceSessionId,
}

#[async_trait]
impl ChannelLink for ServerLink {
    async fn exchange(&self, channel_id: &str, request: NetworkRequest) -> Result<NetworkResponse> {
        match self.network.server(&self.address) {
            Some((handler, session, _)) if session == self.server_session => {
                Ok(deliver(handler, channel_id, request).await)
            }
            _ => Err(TransportError::Disconnected(format!(
                "no server for {} at '{}'",
                self.server_session, self.address
            ))),
        }
    }
}

/// Server-to-client half of a duplex pair.
struct ClientLink {
    client: Weak<dyn MessageChannelEndpointHandler>,
    client_session: InstanceSessionId,
}

#[async_trait]
impl ChannelLink for ClientLink {
    async fn exchange(&self, channel_id: &str, request: NetworkRequest) -> Result<NetworkResponse> {
        match self.client.upgrade() {
            Some(handler) => Ok(deliver(handler, channel_id, request).await),
            None => Err(TransportError::Disconnected(format!(
                "{} is gone",
                self.client_session
            ))),
        }
    }
}

/// [`TransportProvider`] over a [`VirtualNetwork`].
pub struct VirtualTransport {
    network: Arc<VirtualNetwork>,
}

impl VirtualTransport {
    pub fn new(network: Arc<VirtualNetwork>) -> Self {
        Self { network }
    }

    pub fn network(&self) -> &Arc<VirtualNetwork> {
        &self.network
    }
}

#[async_trait]
impl TransportProvider for VirtualTransport {
    fn transport_id(&self) -> &str {
        VIRTUAL_TRANSPORT_ID
    }

    async fn connect(
        &self,
        local: Arc<dyn MessageChannelEndpointHandler>,
        address: &str,
        config: &ChannelServiceConfig,
        allow_duplex: bool,
    ) -> Result<Arc<MessageChannel>> {
        let (server, server_session, server_version) = self
            .network
            .server(address)
            .ok_or_else(|| TransportError::ConnectionRefused(format!("nothing listens at '{}'", address)))?;
        if server_version != config.protocol_version {
            return Err(TransportError::ProtocolMismatch {
                local: config.protocol_version,
                remote: server_version,
            });
        }

        let local_session = local.local_session();
        let outgoing = MessageChannel::new(
            local_session.clone(),
            server_session.clone(),
            false,
            config.protocol_version,
            config.goodbye_timeout,
            Arc::new(ServerLink {
                network: Arc::clone(&self.network),
                address: address.to_owned(),
                server_session: server_session.clone(),
            }),
        );

        if allow_duplex {
            let reverse = MessageChannel::new(
                server_session.clone(),
                local_session.clone(),
                true,
                config.protocol_version,
                config.goodbye_timeout,
                Arc::new(ClientLink {
                    client: Arc::downgrade(&local),
                    client_session: local_session.clone(),
                }),
            );
            outgoing.set_mirror_channel_id(reverse.channel_id());
            reverse.set_mirror_channel_id(outgoing.channel_id());
            reverse.mark_established();
            server.on_remote_initiated_channel_established(reverse);
        }

        outgoing.mark_established();
        debug!(
            channel = %outgoing.channel_id(),
            local = %local_session,
            remote = %server_session,
            duplex = allow_duplex,
            "Virtual channel established"
        );
        Ok(outgoing)
    }

    async fn start_server(
        &self,
        address: &str,
        handler: Arc<dyn MessageChannelEndpointHandler>,
        protocol_version: u32,
    ) -> Result<()> {
        let session = handler.local_session();
        match self.network.servers.entry(address.to_owned()) {
            Entry::Occupied(_) => Err(TransportError::ConnectionRefused(format!(
                "address '{}' is already in use",
                address
            ))),
            Entry::Vacant(slot) => {
                info!(address, session = %session, "Virtual server started");
                slot.insert(VirtualServer {
                    handler,
                    session,
                    protocol_version,
                });
                Ok(())
            }
        }
    }

    async fn stop_server(&self, address: &str) -> Result<()> {
        if self.network.servers.remove(address).is_some() {
            info!(address, "Virtual server stopped");
        }
        Ok(())
    }
}
