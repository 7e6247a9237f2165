//! Replication of node properties.
//!
//! This crate provides:
//! - Node property records and their compact wire form
//! - A registry that merges property batches with session supersession
//! - Change listeners for added, updated and removed properties
//! - A gossip service that exchanges properties over message channels

pub mod config;
pub mod error;
pub mod listener;
pub mod message;
pub mod property;
pub mod registry;
pub mod service;
pub mod timekeeper;

pub use config::NodePropertiesConfig;
pub use error::{ReplicationError, Result};
pub use listener::{NodePropertiesChange, NodePropertiesChangeListener};
pub use message::{UpdateKind, UpdateMessage, MESSAGE_TYPE_NODE_PROPERTIES};
pub use property::{NodeProperty, KEY_DISPLAY_NAME};
pub use registry::NodePropertiesRegistry;
pub use service::NodePropertiesService;
pub use timekeeper::SequentialTimeKeeper;
