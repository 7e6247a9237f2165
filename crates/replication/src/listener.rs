//! Change notification for node properties.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

use crate::property::NodeProperty;

/// The visible effect of one merge.
///
/// Only live values count: a tombstone replacing a live value is reported
/// as `removed` (with the record that was removed), a tombstone replacing
/// nothing is not reported at all.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodePropertiesChange {
    pub added: Vec<NodeProperty>,
    pub updated: Vec<NodeProperty>,
    pub removed: Vec<NodeProperty>,
}

impl NodePropertiesChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    pub fn len(&self) -> usize {
        self.added.len() + self.updated.len() + self.removed.len()
    }
}

/// Receives the changes of a registry.
///
/// Callbacks run synchronously and in merge order. They must not merge
/// into the registry that calls them.
pub trait NodePropertiesChangeListener: Send + Sync {
    fn on_node_properties_changed(&self, change: &NodePropertiesChange);

    /// A detached listener is dropped by the registry after the next
    /// notification.
    fn is_detached(&self) -> bool {
        false
    }
}

/// Forwards changes into a tokio channel; see
/// [`NodePropertiesService::subscribe`](crate::NodePropertiesService::subscribe).
pub(crate) struct ChannelForwarder {
    sender: mpsc::UnboundedSender<Arc<NodePropertiesChange>>,
}

impl ChannelForwarder {
    pub(crate) fn new(sender: mpsc::UnboundedSender<Arc<NodePropertiesChange>>) -> Self {
        Self { sender }
    }
}

impl NodePropertiesChangeListener for ChannelForwarder {
    fn on_node_properties_changed(&self, change: &NodePropertiesChange) {
        if self.sender.send(Arc::new(change.clone())).is_err() {
            debug!("Node property subscriber is gone");
        }
    }

    fn is_detached(&self) -> bool {
        self.sender.is_closed()
    }
}
