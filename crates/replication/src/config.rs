//! Node properties service configuration.

use std::time::Duration;

/// Settings of a [`NodePropertiesService`](crate::NodePropertiesService).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodePropertiesConfig {
    /// Forward received knowledge to all other neighbours, and exchange the
    /// complete knowledge (not only the local publications) on connect.
    /// Needed when nodes are not fully meshed.
    pub relay: bool,
    /// Timeout of a single update exchange.
    pub exchange_timeout: Duration,
}

impl Default for NodePropertiesConfig {
    fn default() -> Self {
        Self {
            relay: false,
            exchange_timeout: Duration::from_secs(10),
        }
    }
}

impl NodePropertiesConfig {
    pub fn with_relay(mut self, relay: bool) -> Self {
        self.relay = relay;
        self
    }

    pub fn with_exchange_timeout(mut self, timeout: Duration) -> Self {
        self.exchange_timeout = timeout;
        self
    }
}
