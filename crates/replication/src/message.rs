//! Update messages exchanged between node properties services.
//!
//! The payload is JSON: `{"kind": "init" | "delta", "entries": [...]}` with
//! every entry in the compact record form of [`NodeProperty`].

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{ReplicationError, Result};
use crate::property::NodeProperty;

/// Message type the service registers its request handler for.
pub const MESSAGE_TYPE_NODE_PROPERTIES: &str = "nodeProperties.update";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateKind {
    /// First exchange on a new channel; answered with complementing knowledge.
    Init,
    /// Incremental update; answered with an empty payload.
    Delta,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateMessage {
    pub kind: UpdateKind,
    pub entries: Vec<String>,
}

impl UpdateMessage {
    pub fn new(kind: UpdateKind, properties: &[NodeProperty]) -> Self {
        Self {
            kind,
            entries: properties.iter().map(NodeProperty::to_compact_form).collect(),
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload).map_err(|e| ReplicationError::MalformedUpdate(e.to_string()))
    }

    /// Decode all entries; one malformed entry rejects the whole message.
    pub fn properties(&self) -> Result<Vec<NodeProperty>> {
        self.entries
            .iter()
            .map(|entry| NodeProperty::parse_compact_form(entry))
            .collect()
    }
}
