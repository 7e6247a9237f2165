//! Display-name association for node ids.
//!
//! Names are presentation metadata only: last write wins, nothing is merged,
//! and ids never look at them for equality. The table is an explicit context
//! object; create one per process (or per simulated node in tests) and pass
//! an `Arc<NodeNames>` to whatever needs to render ids.

use dashmap::DashMap;

use super::{NodeIdentity, DEFAULT_LOGICAL_NODE_PART};

/// Placeholder shown for ids without an associated name.
pub const UNKNOWN_DISPLAY_NAME: &str = "<unknown>";

/// Concurrent table from id name keys to display names.
#[derive(Debug, Default)]
pub struct NodeNames {
    names: DashMap<String, String>,
}

impl NodeNames {
    pub fn new() -> Self {
        Self::default()
    }

    /// Associate `name` with `id`, replacing any previous name.
    pub fn associate(&self, id: &dyn NodeIdentity, name: impl Into<String>) {
        self.names.insert(id.name_key().to_owned(), name.into());
    }

    /// Associate a name by raw key; used when the key arrives as a string
    /// (e.g. from a replicated property) and has already been validated.
    pub fn associate_key(&self, key: impl Into<String>, name: impl Into<String>) {
        self.names.insert(key.into(), name.into());
    }

    pub fn forget(&self, id: &dyn NodeIdentity) {
        self.names.remove(id.name_key());
    }

    /// The raw associated name, if any.
    pub fn display_name(&self, id: &dyn NodeIdentity) -> Option<String> {
        self.names.get(id.name_key()).map(|entry| entry.value().clone())
    }

    /// The associated name, or a placeholder. Custom logical nodes get their
    /// logical part appended.
    pub fn display_name_or_default(&self, id: &dyn NodeIdentity) -> String {
        let base = self
            .display_name(id)
            .unwrap_or_else(|| UNKNOWN_DISPLAY_NAME.to_owned());
        match id.logical_node_part() {
            Some(part) if part != DEFAULT_LOGICAL_NODE_PART => {
                format!("{} [logical node #{}]", base, part)
            }
            _ => base,
        }
    }

    /// Human-readable form for logs and messages: `"name" [id]`.
    pub fn describe(&self, id: &dyn NodeIdentity) -> String {
        format!("\"{}\" [{}]", self.display_name_or_default(id), id.as_str())
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}
