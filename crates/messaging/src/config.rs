//! Channel service configuration.

use std::time::Duration;

/// Protocol version spoken by this build.
pub const PROTOCOL_VERSION: u32 = 1;

/// Settings of a [`MessageChannelService`](crate::MessageChannelService) and
/// the channels it opens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelServiceConfig {
    /// Channels are only established between equal versions.
    pub protocol_version: u32,
    /// Timeout for requests that do not specify their own.
    pub default_request_timeout: Duration,
    /// How long a graceful close waits for the goodbye answer.
    pub goodbye_timeout: Duration,
}

impl Default for ChannelServiceConfig {
    fn default() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            default_request_timeout: Duration::from_secs(30),
            goodbye_timeout: Duration::from_secs(2),
        }
    }
}

impl ChannelServiceConfig {
    pub fn with_protocol_version(mut self, version: u32) -> Self {
        self.protocol_version = version;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.default_request_timeout = timeout;
        self
    }
}
