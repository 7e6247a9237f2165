//! The message channel service.
//!
//! One [`MessageChannelService`] per node. It owns the node's outgoing
//! channels, knows the registered transports, dispatches inbound requests
//! to per-message-type handlers and tells lifecycle listeners about
//! channels coming and going.
//!
//! Every outgoing channel is registered here, including the reverse half
//! of a duplex connect that a remote node opened towards this node.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use corelib::marker::log_error_with_marker;
use corelib::rpc::ErrorInfo;
use corelib::InstanceSessionId;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::channel::{ChannelState, ChannelStateObserver, MessageChannel};
use crate::config::ChannelServiceConfig;
use crate::error::{Result, TransportError};
use crate::protocol::{ChannelOutcome, NetworkRequest, NetworkResponse, ResultCode, MESSAGE_TYPE_GOODBYE};
use crate::transport::{ContactPoint, MessageChannelEndpointHandler, TransportProvider};

/// Error type returned by request handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Handles inbound requests of one message type.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    /// Produce the payload of the success response.
    ///
    /// An `Err` is logged under a marker at this node; the sender receives
    /// an `ExceptionAtDestination` response carrying only that marker.
    async fn handle_request(&self, request: &NetworkRequest) -> std::result::Result<Bytes, HandlerError>;
}

/// Notified about outgoing channels of the local node.
///
/// Callbacks run synchronously on the task that caused the change; spawn
/// for anything that needs to wait.
pub trait ChannelLifecycleListener: Send + Sync + 'static {
    fn on_outgoing_channel_established(&self, _channel: &Arc<MessageChannel>) {}

    fn on_outgoing_channel_closed(&self, _channel: &Arc<MessageChannel>) {}

    fn on_outgoing_channel_broken(&self, _channel: &Arc<MessageChannel>) {}
}

/// Per-node channel management and request dispatch.
pub struct MessageChannelService {
    local: InstanceSessionId,
    config: ChannelServiceConfig,
    transports: DashMap<String, Arc<dyn TransportProvider>>,
    channels: DashMap<String, Arc<MessageChannel>>,
    handlers: DashMap<String, Arc<dyn RequestHandler>>,
    listeners: RwLock<Vec<Arc<dyn ChannelLifecycleListener>>>,
    self_ref: Weak<MessageChannelService>,
}

impl MessageChannelService {
    pub fn new(local: InstanceSessionId, config: ChannelServiceConfig) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            local,
            config,
            transports: DashMap::new(),
            channels: DashMap::new(),
            handlers: DashMap::new(),
            listeners: RwLock::new(Vec::new()),
            self_ref: self_ref.clone(),
        })
    }

    pub fn local_node(&self) -> &InstanceSessionId {
        &self.local
    }

    pub fn config(&self) -> &ChannelServiceConfig {
        &self.config
    }

    // ========================================================================
    // Registration
    // ========================================================================

    pub fn add_transport(&self, transport: Arc<dyn TransportProvider>) {
        self.transports
            .insert(transport.transport_id().to_owned(), transport);
    }

    /// Register the handler for `message_type`, replacing any previous one.
    pub fn register_request_handler(&self, message_type: impl Into<String>, handler: Arc<dyn RequestHandler>) {
        self.handlers.insert(message_type.into(), handler);
    }

    /// Add a listener. It is not told about channels that already exist.
    pub fn add_lifecycle_listener(&self, listener: Arc<dyn ChannelLifecycleListener>) {
        self.listeners.write().push(listener);
    }

    fn transport(&self, transport_id: &str) -> Result<Arc<dyn TransportProvider>> {
        self.transports
            .get(transport_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| TransportError::UnknownTransport(transport_id.to_owned()))
    }

    fn self_handler(&self) -> Result<Arc<dyn MessageChannelEndpointHandler>> {
        let this: Arc<dyn MessageChannelEndpointHandler> = self
            .self_ref
            .upgrade()
            .ok_or_else(|| TransportError::Disconnected("channel service is shutting down".into()))?;
        Ok(this)
    }

    // ========================================================================
    // Servers and connections
    // ========================================================================

    /// Accept connections at `contact`.
    pub async fn start_server(&self, contact: &ContactPoint) -> Result<()> {
        let transport = self.transport(contact.transport_id())?;
        transport
            .start_server(contact.address(), self.self_handler()?, self.config.protocol_version)
            .await
    }

    pub async fn stop_server(&self, contact: &ContactPoint) -> Result<()> {
        self.transport(contact.transport_id())?
            .stop_server(contact.address())
            .await
    }

    /// Open an outgoing channel to `contact` and register it.
    pub async fn connect(&self, contact: &ContactPoint, allow_duplex: bool) -> Result<Arc<MessageChannel>> {
        let transport = self.transport(contact.transport_id())?;
        let channel = transport
            .connect(self.self_handler()?, contact.address(), &self.config, allow_duplex)
            .await?;
        info!(
            channel = %channel.channel_id(),
            remote = %channel.remote_node(),
            contact = %contact,
            "Outgoing channel established"
        );
        self.register_channel(Arc::clone(&channel));
        Ok(channel)
    }

    fn register_channel(&self, channel: Arc<MessageChannel>) {
        let observer: Weak<dyn ChannelStateObserver> = self.self_ref.clone();
        channel.set_state_observer(observer);
        self.channels
            .insert(channel.channel_id().to_owned(), Arc::clone(&channel));

        // the channel may have terminated before the observer was attached
        if channel.state().is_terminal() {
            self.channels.remove(channel.channel_id());
            return;
        }
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener.on_outgoing_channel_established(&channel);
        }
    }

    pub fn channel(&self, channel_id: &str) -> Option<Arc<MessageChannel>> {
        self.channels.get(channel_id).map(|entry| Arc::clone(entry.value()))
    }

    /// An established outgoing channel to `remote`, if any.
    pub fn channel_to(&self, remote: &InstanceSessionId) -> Option<Arc<MessageChannel>> {
        self.channels
            .iter()
            .find(|entry| entry.remote_node() == remote && entry.is_established())
            .map(|entry| Arc::clone(entry.value()))
    }

    /// All established outgoing channels.
    pub fn outgoing_channels(&self) -> Vec<Arc<MessageChannel>> {
        self.channels
            .iter()
            .filter(|entry| entry.is_established())
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Sessions this node currently has an established channel to.
    pub fn connected_nodes(&self) -> Vec<InstanceSessionId> {
        let mut nodes: Vec<InstanceSessionId> = self
            .outgoing_channels()
            .iter()
            .map(|channel| channel.remote_node().clone())
            .collect();
        nodes.sort();
        nodes.dedup();
        nodes
    }

    pub async fn close_channel(&self, channel_id: &str) {
        if let Some(channel) = self.channel(channel_id) {
            channel.close().await;
        }
    }

    /// Close every outgoing channel, e.g. on shutdown.
    pub async fn close_all(&self) {
        let channels: Vec<Arc<MessageChannel>> =
            self.channels.iter().map(|entry| Arc::clone(entry.value())).collect();
        for channel in channels {
            channel.close().await;
        }
    }

    // ========================================================================
    // Sending
    // ========================================================================

    /// Send to `target` over any established channel to it.
    ///
    /// Without such a channel the handler receives `NoRouteToDestination`.
    pub fn send_request<F>(
        &self,
        target: &InstanceSessionId,
        message_type: &str,
        payload: Bytes,
        timeout: Option<Duration>,
        handler: F,
    ) where
        F: FnOnce(ChannelOutcome) + Send + 'static,
    {
        let timeout = timeout.unwrap_or(self.config.default_request_timeout);
        match self.channel_to(target) {
            Some(channel) => channel.send_request(message_type, payload, timeout, handler),
            None => {
                debug!(destination = %target, message_type, "No channel to destination");
                let outcome = ChannelOutcome::failure(
                    ResultCode::NoRouteToDestination,
                    format!("no channel to {}", target),
                );
                tokio::spawn(async move { handler(outcome) });
            }
        }
    }

    /// Send to `target` and await the outcome.
    pub async fn request(
        &self,
        target: &InstanceSessionId,
        message_type: &str,
        payload: Bytes,
        timeout: Option<Duration>,
    ) -> ChannelOutcome {
        let timeout = timeout.unwrap_or(self.config.default_request_timeout);
        match self.channel_to(target) {
            Some(channel) => channel.request(message_type, payload, timeout).await,
            None => ChannelOutcome::failure(
                ResultCode::NoRouteToDestination,
                format!("no channel to {}", target),
            ),
        }
    }

    // ========================================================================
    // Inbound
    // ========================================================================

    /// The remote side closed the channel `remote_channel_id`; close our
    /// mirror of it without a second goodbye.
    fn handle_goodbye(&self, remote_channel_id: &str, sender: &InstanceSessionId) {
        let mirror = self
            .channels
            .iter()
            .find(|entry| entry.mirror_channel_id().as_deref() == Some(remote_channel_id))
            .map(|entry| Arc::clone(entry.value()));
        match mirror {
            Some(channel) => {
                channel.mark_closed_by_remote();
            }
            None => debug!(sender = %sender, remote_channel = remote_channel_id, "Goodbye for channel without mirror"),
        }
    }

    fn error_response(&self, request_id: u64, code: ResultCode, detail: String) -> NetworkResponse {
        let marker = log_error_with_marker(detail);
        let info = ErrorInfo::new(marker, self.local.clone());
        NetworkResponse::failure(request_id, code, Bytes::from(info.encode()))
    }
}

#[async_trait]
impl MessageChannelEndpointHandler for MessageChannelService {
    fn local_session(&self) -> InstanceSessionId {
        self.local.clone()
    }

    fn on_remote_initiated_channel_established(&self, channel: Arc<MessageChannel>) {
        info!(
            channel = %channel.channel_id(),
            remote = %channel.remote_node(),
            "Remote-initiated channel established"
        );
        self.register_channel(channel);
    }

    async fn on_request(&self, channel_id: &str, request: NetworkRequest) -> NetworkResponse {
        let request_id = request.request_id();
        if request.message_type() == MESSAGE_TYPE_GOODBYE {
            self.handle_goodbye(channel_id, request.sender());
            return NetworkResponse::success(request_id, Bytes::new());
        }

        let handler = self
            .handlers
            .get(request.message_type())
            .map(|entry| Arc::clone(entry.value()));
        let Some(handler) = handler else {
            warn!(message_type = request.message_type(), sender = %request.sender(), "No handler for message type");
            return self.error_response(
                request_id,
                ResultCode::NoHandlerForMessageType,
                format!("no handler for message type '{}'", request.message_type()),
            );
        };

        match handler.handle_request(&request).await {
            Ok(payload) => NetworkResponse::success(request_id, payload),
            Err(e) => self.error_response(
                request_id,
                ResultCode::ExceptionAtDestination,
                format!(
                    "Error handling '{}' request from {}: {}",
                    request.message_type(),
                    request.sender(),
                    e
                ),
            ),
        }
    }
}

impl ChannelStateObserver for MessageChannelService {
    fn on_channel_state_changed(&self, channel: &Arc<MessageChannel>, state: ChannelState) {
        if !state.is_terminal() {
            return;
        }
        if self.channels.remove(channel.channel_id()).is_none() {
            return;
        }
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            match state {
                ChannelState::Broken => listener.on_outgoing_channel_broken(channel),
                _ => listener.on_outgoing_channel_closed(channel),
            }
        }
    }
}
