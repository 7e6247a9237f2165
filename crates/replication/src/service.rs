//! Gossip of node properties over message channels.
//!
//! Every node runs one [`NodePropertiesService`]. It keeps two registries:
//!
//! - **published**: what the local node itself has published
//! - **complete**: everything known, local publications included
//!
//! # Protocol
//!
//! 1. When an outgoing channel is established, the service sends an `init`
//!    update with its knowledge (published entries, or complete knowledge in
//!    relay mode). The receiver merges it and answers with the entries the
//!    sender is missing, which the sender merges in turn.
//! 2. Local publications are broadcast as `delta` updates to every
//!    connected node.
//! 3. In relay mode the effective subset of every merge is forwarded to all
//!    connected nodes except the one it came from.
//!
//! Received entries that claim to come from the local session but disagree
//! with what was actually published are corrected: a value the local node
//! never published is cancelled with a tombstone, an outdated one is
//! republished with a fresh sequence number.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use corelib::marker::log_error_with_marker;
use corelib::{InstanceId, InstanceSessionId, NodeNames};
use messaging::service::HandlerError;
use messaging::{ChannelLifecycleListener, ChannelOutcome, MessageChannel, MessageChannelService, NetworkRequest, RequestHandler};
use metrics::counter;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::NodePropertiesConfig;
use crate::error::Result;
use crate::listener::{ChannelForwarder, NodePropertiesChange, NodePropertiesChangeListener};
use crate::message::{UpdateKind, UpdateMessage, MESSAGE_TYPE_NODE_PROPERTIES};
use crate::property::{NodeProperty, KEY_DISPLAY_NAME};
use crate::registry::NodePropertiesRegistry;
use crate::timekeeper::SequentialTimeKeeper;

/// Publishes local node properties and replicates those of other nodes.
pub struct NodePropertiesService {
    local: InstanceSessionId,
    config: NodePropertiesConfig,
    channels: Arc<MessageChannelService>,
    complete: NodePropertiesRegistry,
    published: NodePropertiesRegistry,
    // serializes "compare with published, then merge" sequences
    knowledge_lock: Mutex<()>,
    time_keeper: SequentialTimeKeeper,
}

impl NodePropertiesService {
    /// Create the service and attach it to `channels`.
    ///
    /// Registers the update request handler and a lifecycle listener that
    /// starts the initial exchange on every new outgoing channel. Display
    /// names received as `displayName` properties are applied to `names`.
    pub fn new(
        channels: Arc<MessageChannelService>,
        names: Arc<NodeNames>,
        config: NodePropertiesConfig,
    ) -> Arc<Self> {
        let service = Arc::new(Self {
            local: channels.local_node().clone(),
            config,
            channels: Arc::clone(&channels),
            complete: NodePropertiesRegistry::new(),
            published: NodePropertiesRegistry::new(),
            knowledge_lock: Mutex::new(()),
            time_keeper: SequentialTimeKeeper::new(),
        });
        service.complete.add_listener(Arc::new(DisplayNameApplier::new(names)));

        let weak = Arc::downgrade(&service);
        channels.register_request_handler(
            MESSAGE_TYPE_NODE_PROPERTIES,
            Arc::new(UpdateRequestHandler { service: weak.clone() }),
        );
        channels.add_lifecycle_listener(Arc::new(ExchangeTrigger { service: weak }));

        // channels established before the listener was added
        for channel in channels.outgoing_channels() {
            service.start_initial_exchange(&channel);
        }
        info!(local = %service.local, relay = service.config.relay, "Node properties service started");
        service
    }

    pub fn local_node(&self) -> &InstanceSessionId {
        &self.local
    }

    pub fn config(&self) -> &NodePropertiesConfig {
        &self.config
    }

    // ========================================================================
    // Publishing
    // ========================================================================

    /// Publish properties of the local node; a `None` value removes the key.
    ///
    /// Every entry gets its own sequence number. All keys are validated
    /// before anything is stored. Returns the published records.
    pub fn publish<I, K>(&self, updates: I) -> Result<Vec<NodeProperty>>
    where
        I: IntoIterator<Item = (K, Option<String>)>,
        K: Into<String>,
    {
        let entries = {
            let _guard = self.knowledge_lock.lock();
            let entries = updates
                .into_iter()
                .map(|(key, value)| NodeProperty::new(self.local.clone(), key, self.time_keeper.next(), value))
                .collect::<Result<Vec<_>>>()?;
            self.store_local(&entries)?;
            entries
        };
        if entries.is_empty() {
            return Ok(entries);
        }

        counter!("nodemesh_property_publications_total").increment(entries.len() as u64);
        debug!(count = entries.len(), "Publishing node properties");
        self.broadcast(&entries, None)?;
        Ok(entries)
    }

    pub fn publish_property(&self, key: &str, value: impl Into<String>) -> Result<()> {
        self.publish([(key, Some(value.into()))]).map(|_| ())
    }

    /// Remove a local property; replicated as a tombstone.
    pub fn remove_property(&self, key: &str) -> Result<()> {
        self.publish([(key, None)]).map(|_| ())
    }

    /// Publish the local node's display name.
    pub fn publish_display_name(&self, name: impl Into<String>) -> Result<()> {
        self.publish_property(KEY_DISPLAY_NAME, name)
    }

    fn store_local(&self, entries: &[NodeProperty]) -> Result<()> {
        self.published.merge_unchecked(entries)?;
        self.complete.merge_unchecked(entries)?;
        Ok(())
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Live properties of `instance`.
    pub fn node_properties(&self, instance: &InstanceId) -> BTreeMap<String, String> {
        self.complete.node_properties(instance)
    }

    pub fn node_property(&self, instance: &InstanceId, key: &str) -> Option<String> {
        self.complete
            .node_property(instance, key)
            .and_then(|property| property.value().map(str::to_owned))
    }

    /// Live properties of every known node, keyed by its current session.
    pub fn all_node_properties(&self) -> BTreeMap<InstanceSessionId, BTreeMap<String, String>> {
        self.complete.all_node_properties()
    }

    /// Live properties published by the local node.
    pub fn local_properties(&self) -> BTreeMap<String, String> {
        self.published.node_properties(&self.local.instance_id())
    }

    /// Registry with everything this node knows.
    pub fn complete_registry(&self) -> &NodePropertiesRegistry {
        &self.complete
    }

    /// Registry with the local publications.
    pub fn published_registry(&self) -> &NodePropertiesRegistry {
        &self.published
    }

    pub fn add_listener(&self, listener: Arc<dyn NodePropertiesChangeListener>) {
        self.complete.add_listener(listener);
    }

    /// Stream of changes to the complete knowledge, starting with the
    /// current state as one `added` event.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Arc<NodePropertiesChange>> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.complete.add_listener(Arc::new(ChannelForwarder::new(sender)));
        receiver
    }

    // ========================================================================
    // Exchange
    // ========================================================================

    fn knowledge_base(&self) -> &NodePropertiesRegistry {
        if self.config.relay {
            &self.complete
        } else {
            &self.published
        }
    }

    fn start_initial_exchange(self: &Arc<Self>, channel: &Arc<MessageChannel>) {
        let knowledge = self.knowledge_base().detached_copy_of_entries();
        let payload = match UpdateMessage::new(UpdateKind::Init, &knowledge).encode() {
            Ok(payload) => payload,
            Err(e) => {
                log_error_with_marker(format!("failed to encode initial node property update: {}", e));
                return;
            }
        };
        debug!(
            channel = %channel.channel_id(),
            remote = %channel.remote_node(),
            count = knowledge.len(),
            "Starting initial node property exchange"
        );

        let remote = channel.remote_node().clone();
        let service = Arc::downgrade(self);
        channel.send_request(
            MESSAGE_TYPE_NODE_PROPERTIES,
            payload,
            self.config.exchange_timeout,
            move |outcome| {
                if let Some(service) = service.upgrade() {
                    service.complete_initial_exchange(&remote, outcome);
                }
            },
        );
    }

    fn complete_initial_exchange(&self, remote: &InstanceSessionId, outcome: ChannelOutcome) {
        let Some(payload) = outcome.success_payload() else {
            warn!(
                remote = %remote,
                code = %outcome.result_code(),
                "Initial node property exchange failed"
            );
            return;
        };
        let result = UpdateMessage::decode(payload)
            .and_then(|message| message.properties())
            .and_then(|entries| self.absorb(remote, entries));
        match result {
            Ok(effective) => debug!(remote = %remote, effective = effective.len(), "Initial node property exchange complete"),
            Err(e) => {
                log_error_with_marker(format!("initial node property exchange with {} failed: {}", remote, e));
            }
        }
    }

    fn handle_update(&self, request: &NetworkRequest) -> Result<Bytes> {
        let message = UpdateMessage::decode(request.payload())?;
        let entries = message.properties()?;
        debug!(
            sender = %request.sender(),
            kind = ?message.kind,
            count = entries.len(),
            "Received node property update"
        );

        match message.kind {
            UpdateKind::Delta => {
                self.absorb(request.sender(), entries)?;
                Ok(Bytes::new())
            }
            UpdateKind::Init => {
                self.absorb(request.sender(), entries.clone())?;
                let complement = self.knowledge_base().complementing_knowledge(&entries);
                UpdateMessage::new(UpdateKind::Delta, &complement).encode()
            }
        }
    }

    /// Merge entries received from `sender` and propagate the consequences.
    fn absorb(&self, sender: &InstanceSessionId, entries: Vec<NodeProperty>) -> Result<Vec<NodeProperty>> {
        let local_instance = self.local.instance_id();
        let (effective, corrections) = {
            let _guard = self.knowledge_lock.lock();
            let (own, foreign): (Vec<_>, Vec<_>) = entries
                .into_iter()
                .partition(|entry| entry.instance_id() == local_instance);
            let corrections = self.republish_or_cancel(&own)?;
            let effective = self.complete.merge_and_get_effective_subset(&foreign)?;
            (effective, corrections)
        };

        if !corrections.is_empty() {
            self.broadcast(&corrections, None)?;
        }
        if self.config.relay && !effective.is_empty() {
            self.broadcast(&effective, Some(sender))?;
        }
        Ok(effective)
    }

    /// Correct received entries of the local instance. Must be called with
    /// the knowledge lock held.
    fn republish_or_cancel(&self, received: &[NodeProperty]) -> Result<Vec<NodeProperty>> {
        let instance = self.local.instance_id();
        let mut corrections = Vec::new();
        for entry in received {
            if *entry.owner() != self.local {
                if entry.owner().is_newer_than(&self.local) {
                    log_error_with_marker(format!(
                        "received properties of session {} which is newer than the local session {}",
                        entry.owner(),
                        self.local
                    ));
                }
                continue;
            }

            let sequence = || self.time_keeper.next_after(entry.sequence());
            let correction = match self.published.node_property(&instance, entry.key()) {
                None if entry.is_tombstone() => None,
                None => Some(NodeProperty::tombstone(self.local.clone(), entry.key(), sequence())?),
                Some(local) if local.sequence() >= entry.sequence() => None,
                Some(local) => Some(NodeProperty::new(
                    self.local.clone(),
                    entry.key(),
                    sequence(),
                    local.value().map(str::to_owned),
                )?),
            };
            if let Some(correction) = correction {
                info!(
                    key = entry.key(),
                    received_sequence = entry.sequence(),
                    cancel = correction.is_tombstone(),
                    "Correcting stale local node property"
                );
                corrections.push(correction);
            }
        }
        if !corrections.is_empty() {
            self.store_local(&corrections)?;
        }
        Ok(corrections)
    }

    /// Send a delta with `entries` to every connected node except `except`.
    fn broadcast(&self, entries: &[NodeProperty], except: Option<&InstanceSessionId>) -> Result<()> {
        let payload = UpdateMessage::new(UpdateKind::Delta, entries).encode()?;
        for node in self.channels.connected_nodes() {
            if Some(&node) == except {
                continue;
            }
            let destination = node.clone();
            self.channels.send_request(
                &node,
                MESSAGE_TYPE_NODE_PROPERTIES,
                payload.clone(),
                Some(self.config.exchange_timeout),
                move |outcome| {
                    if !outcome.is_success() {
                        warn!(
                            destination = %destination,
                            code = %outcome.result_code(),
                            "Node property update not delivered"
                        );
                    }
                },
            );
        }
        Ok(())
    }
}

// ============================================================================
// Adapters
// ============================================================================

struct UpdateRequestHandler {
    service: Weak<NodePropertiesService>,
}

#[async_trait]
impl RequestHandler for UpdateRequestHandler {
    async fn handle_request(&self, request: &NetworkRequest) -> std::result::Result<Bytes, HandlerError> {
        let service = self
            .service
            .upgrade()
            .ok_or("node properties service is shut down")?;
        Ok(service.handle_update(request)?)
    }
}

struct ExchangeTrigger {
    service: Weak<NodePropertiesService>,
}

impl ChannelLifecycleListener for ExchangeTrigger {
    fn on_outgoing_channel_established(&self, channel: &Arc<MessageChannel>) {
        if let Some(service) = self.service.upgrade() {
            service.start_initial_exchange(channel);
        }
    }

    fn on_outgoing_channel_broken(&self, channel: &Arc<MessageChannel>) {
        debug!(remote = %channel.remote_node(), "Channel for node property exchange broke");
    }
}

/// Applies `displayName` properties to the display-name table.
struct DisplayNameApplier {
    names: Arc<NodeNames>,
    // session whose name is applied, per instance
    owners: Mutex<BTreeMap<InstanceId, InstanceSessionId>>,
}

impl DisplayNameApplier {
    fn new(names: Arc<NodeNames>) -> Self {
        Self {
            names,
            owners: Mutex::new(BTreeMap::new()),
        }
    }
}

impl NodePropertiesChangeListener for DisplayNameApplier {
    fn on_node_properties_changed(&self, change: &NodePropertiesChange) {
        let mut owners = self.owners.lock();
        for property in change.removed.iter().filter(|p| p.key() == KEY_DISPLAY_NAME) {
            let instance = property.instance_id();
            self.names.forget(property.owner());
            self.names.forget(&instance);
            if owners.get(&instance) == Some(property.owner()) {
                owners.remove(&instance);
            }
        }
        let assigned = change.added.iter().chain(&change.updated);
        for property in assigned.filter(|p| p.key() == KEY_DISPLAY_NAME) {
            let Some(name) = property.value() else { continue };
            let instance = property.instance_id();
            if let Some(previous) = owners.insert(instance.clone(), property.owner().clone()) {
                if previous != *property.owner() {
                    self.names.forget(&previous);
                }
            }
            self.names.associate(property.owner(), name);
            self.names.associate(&instance, name);
        }
    }
}
