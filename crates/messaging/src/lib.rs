//! Message channels and service calls between nodes.
//!
//! This crate provides the transport-agnostic messaging layer:
//! - Channels with an explicit lifecycle and per-request correlation
//! - A transport provider abstraction and an in-process virtual transport
//! - The per-node channel service with request dispatch and lifecycle events
//! - Service call handling and calling on top of channels

pub mod channel;
pub mod config;
pub mod error;
pub mod protocol;
pub mod rpc;
pub mod service;
pub mod transport;
pub mod virtual_transport;

pub use channel::{ChannelState, MessageChannel};
pub use config::ChannelServiceConfig;
pub use error::TransportError;
pub use protocol::{ChannelOutcome, NetworkRequest, NetworkResponse, ResultCode};
pub use rpc::{MethodError, RemotableService, RemoteServiceCaller, ServiceCallHandler};
pub use service::{ChannelLifecycleListener, MessageChannelService, RequestHandler};
pub use transport::{ContactPoint, TransportProvider};
pub use virtual_transport::{VirtualNetwork, VirtualTransport};
