//! Core library for the node mesh.
//!
//! This crate provides the building blocks shared by all other crates:
//! - Node identities at instance, session and logical node granularity
//! - Display-name association and identity persistence
//! - Service call request/result envelopes and the result factory
//! - Error markers for log correlation

pub mod error;
pub mod marker;
pub mod node;
pub mod rpc;

pub use error::{Error, Result};
pub use marker::ErrorMarker;
pub use node::{
    Freshness, IdType, InstanceId, InstanceSessionId, LogicalNodeId, LogicalNodeSessionId, NodeId,
    NodeIdentity, NodeNames,
};
pub use rpc::{ServiceCallRequest, ServiceCallResult};
