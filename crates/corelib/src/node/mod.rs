//! Node identity model.
//!
//! A node is identified at four levels of granularity:
//!
//! - [`InstanceId`]: one installed instance, stable across restarts
//! - [`InstanceSessionId`]: one run of that instance
//! - [`LogicalNodeId`]: an addressable endpoint hosted by an instance
//! - [`LogicalNodeSessionId`]: that endpoint within one run
//!
//! All ids are immutable values with a canonical string form. Display names
//! are kept outside of the ids in a [`NodeNames`] table.

pub mod ids;
pub mod names;
pub mod store;

use std::fmt;
use std::str::FromStr;

pub use ids::{
    Freshness, InstanceId, InstanceSessionId, LogicalNodeId, LogicalNodeSessionId,
    MAX_SESSION_GENERATION,
};
pub use names::NodeNames;
pub use store::{FileStore, KeyValueStore, LocalIdentity, MemoryStore};

use crate::error::{Error, Result};

/// Length of the instance part in hex characters.
pub const INSTANCE_PART_LENGTH: usize = 32;
/// Length of the session part in hex characters.
pub const SESSION_PART_LENGTH: usize = 10;
/// Leading hex digits of the session part that carry the session generation.
pub const SESSION_GENERATION_DIGITS: usize = 6;
/// Maximum length of a custom logical node part.
pub const MAX_LOGICAL_NODE_PART_LENGTH: usize = 32;
/// Logical node part of the default logical node of every instance.
pub const DEFAULT_LOGICAL_NODE_PART: &str = "0";

pub(crate) const PART_SEPARATOR: char = ':';
pub(crate) const SESSION_SEPARATOR: &str = "::";

/// Discriminates the four identifier kinds.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum IdType {
    InstanceId,
    InstanceSessionId,
    LogicalNodeId,
    LogicalNodeSessionId,
}

impl IdType {
    pub fn name(&self) -> &'static str {
        match self {
            IdType::InstanceId => "instance id",
            IdType::InstanceSessionId => "instance session id",
            IdType::LogicalNodeId => "logical node id",
            IdType::LogicalNodeSessionId => "logical node session id",
        }
    }
}

impl fmt::Display for IdType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Common read access to all identifier kinds.
pub trait NodeIdentity {
    fn id_type(&self) -> IdType;

    /// The canonical string form.
    fn as_str(&self) -> &str;

    /// The 32 character instance part.
    fn instance_part(&self) -> &str;

    /// Key under which a display name is associated with this id.
    ///
    /// Session-less ids share the name of their instance; session ids carry
    /// their own.
    fn name_key(&self) -> &str;

    fn logical_node_part(&self) -> Option<&str> {
        None
    }

    fn is_same_instance_as(&self, other: &dyn NodeIdentity) -> bool {
        self.instance_part() == other.instance_part()
    }
}

/// Any of the four identifier kinds, as returned by [`NodeId::parse`].
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum NodeId {
    Instance(InstanceId),
    InstanceSession(InstanceSessionId),
    LogicalNode(LogicalNodeId),
    LogicalNodeSession(LogicalNodeSessionId),
}

impl NodeId {
    /// Parse any canonical id string, detecting its kind from the separators.
    pub fn parse(input: &str) -> Result<Self> {
        match (input.contains("::"), input.matches(':').count()) {
            (false, 0) => InstanceId::parse(input).map(NodeId::Instance),
            (false, 1) => LogicalNodeId::parse(input).map(NodeId::LogicalNode),
            (true, 2) => InstanceSessionId::parse(input).map(NodeId::InstanceSession),
            (true, 3) => LogicalNodeSessionId::parse(input).map(NodeId::LogicalNodeSession),
            _ => Err(Error::MalformedIdentifier(format!(
                "'{}' does not match any node id form",
                input
            ))),
        }
    }

    pub fn as_identity(&self) -> &dyn NodeIdentity {
        match self {
            NodeId::Instance(id) => id,
            NodeId::InstanceSession(id) => id,
            NodeId::LogicalNode(id) => id,
            NodeId::LogicalNodeSession(id) => id,
        }
    }

    pub fn id_type(&self) -> IdType {
        self.as_identity().id_type()
    }

    pub fn as_str(&self) -> &str {
        self.as_identity().as_str()
    }

    pub fn instance_id(&self) -> InstanceId {
        match self {
            NodeId::Instance(id) => id.clone(),
            NodeId::InstanceSession(id) => id.instance_id(),
            NodeId::LogicalNode(id) => id.instance_id(),
            NodeId::LogicalNodeSession(id) => id.instance_id(),
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        NodeId::parse(s)
    }
}
