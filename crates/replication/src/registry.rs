//! Replicated registry of node properties.
//!
//! The registry holds, per instance, the properties of exactly one session:
//! the freshest one it has heard of. Within that session every key keeps
//! its last-written record; across sessions nothing is compared but the
//! session generation.
//!
//! # Algorithm
//!
//! [`NodePropertiesRegistry::merge_and_get_effective_subset`]:
//!
//! 1. Group the incoming records by instance
//! 2. Per instance, pick the freshest session in the batch and compare it
//!    against the session on record
//!    - newer: drop everything stored for the instance, adopt the session
//!    - same: last writer wins per key by sequence number
//!    - older: ignore the instance's records entirely
//!    - conflicting: fail the whole merge without changing anything
//! 3. Return the records that were applied
//!
//! # Performance
//!
//! - **Time**: O(b log n) per merge, b = batch size, n = stored entries,
//!   plus a copy of the live entries of every touched instance for change
//!   detection
//! - **Space**: O(n)
//!
//! # Thread Safety
//!
//! One lock serializes all merges. Listener callbacks run after the state
//! lock is released but in merge order.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use corelib::{Freshness, InstanceId, InstanceSessionId};
use metrics::counter;
use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::error::Result;
use crate::listener::{NodePropertiesChange, NodePropertiesChangeListener};
use crate::property::NodeProperty;

#[derive(Clone, Debug)]
struct InstanceEntries {
    session: InstanceSessionId,
    properties: BTreeMap<String, NodeProperty>,
}

impl InstanceEntries {
    fn new(session: InstanceSessionId) -> Self {
        Self {
            session,
            properties: BTreeMap::new(),
        }
    }

    fn live_view(&self) -> BTreeMap<String, NodeProperty> {
        self.properties
            .iter()
            .filter(|(_, property)| !property.is_tombstone())
            .map(|(key, property)| (key.clone(), property.clone()))
            .collect()
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum MergeAction {
    /// Start over with the incoming session.
    Supersede,
    /// Same session; apply per key.
    Update,
}

/// Whether incoming records are checked against the stored state.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum MergeMode {
    Checked,
    /// Records are authoritative (local publications).
    Unchecked,
}

/// Replicated store of node properties.
#[derive(Default)]
pub struct NodePropertiesRegistry {
    state: Mutex<BTreeMap<InstanceId, InstanceEntries>>,
    // lock order: state, then listeners
    listeners: Mutex<Vec<Arc<dyn NodePropertiesChangeListener>>>,
}

impl NodePropertiesRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Merging
    // ========================================================================

    /// Merge `incoming` and return the records that changed the stored state.
    ///
    /// # Errors
    ///
    /// `RegistryInconsistency` if two sessions of one instance cannot be
    /// ordered (same generation, different suffix). Nothing is applied in
    /// that case.
    pub fn merge_and_get_effective_subset(&self, incoming: &[NodeProperty]) -> Result<Vec<NodeProperty>> {
        self.merge(incoming, MergeMode::Checked)
    }

    /// Store `entries` without freshness or sequence checks.
    ///
    /// For properties published by the local node, which are new by
    /// construction. Fails only if the batch itself mixes two sessions that
    /// cannot be ordered.
    pub fn merge_unchecked(&self, entries: &[NodeProperty]) -> Result<Vec<NodeProperty>> {
        self.merge(entries, MergeMode::Unchecked)
    }

    fn merge(&self, incoming: &[NodeProperty], mode: MergeMode) -> Result<Vec<NodeProperty>> {
        let groups = group_by_instance(incoming);
        let mut state = self.state.lock();

        // validate everything before touching the state
        let mut plans = Vec::with_capacity(groups.len());
        for (instance, entries) in groups {
            let session = freshest_session(&instance, &entries)?;
            let action = match (state.get(&instance), mode) {
                (None, _) => MergeAction::Supersede,
                (Some(current), MergeMode::Unchecked) if current.session == session => MergeAction::Update,
                (Some(_), MergeMode::Unchecked) => MergeAction::Supersede,
                (Some(current), MergeMode::Checked) => match session.freshness_against(&current.session) {
                    Freshness::Newer => MergeAction::Supersede,
                    Freshness::Same => MergeAction::Update,
                    Freshness::Older => {
                        debug!(
                            incoming = %session,
                            current = %current.session,
                            count = entries.len(),
                            "Ignoring node properties of an outdated session"
                        );
                        continue;
                    }
                    Freshness::Conflicting => {
                        return Err(inconsistency(format!(
                            "sessions {} and {} both claim to be current",
                            session, current.session
                        )))
                    }
                },
            };
            plans.push((instance, session, action, entries));
        }

        let mut effective: Vec<NodeProperty> = Vec::new();
        let mut positions: HashMap<(InstanceId, String), usize> = HashMap::new();
        let mut change = NodePropertiesChange::default();

        for (instance, session, action, entries) in plans {
            let before = state
                .get(&instance)
                .map(InstanceEntries::live_view)
                .unwrap_or_default();

            let stored = state
                .entry(instance.clone())
                .or_insert_with(|| InstanceEntries::new(session.clone()));
            if action == MergeAction::Supersede {
                if stored.session != session {
                    info!(
                        previous = %stored.session,
                        current = %session,
                        discarded = stored.properties.len(),
                        "Node session superseded"
                    );
                }
                *stored = InstanceEntries::new(session.clone());
            }

            for entry in entries.into_iter().filter(|entry| *entry.owner() == session) {
                let accept = match (stored.properties.get(entry.key()), mode) {
                    (None, _) | (Some(_), MergeMode::Unchecked) => true,
                    (Some(existing), MergeMode::Checked) => {
                        entry.sequence() > existing.sequence()
                            || (entry.sequence() == existing.sequence() && entry.value() != existing.value())
                    }
                };
                if !accept {
                    continue;
                }
                stored.properties.insert(entry.key().to_owned(), entry.clone());
                match positions.get(&(instance.clone(), entry.key().to_owned())) {
                    Some(&index) => effective[index] = entry.clone(),
                    None => {
                        positions.insert((instance.clone(), entry.key().to_owned()), effective.len());
                        effective.push(entry.clone());
                    }
                }
            }

            diff_live_views(&before, &stored.live_view(), &mut change);
        }

        counter!("nodemesh_property_merges_total").increment(1);
        debug!(
            incoming = incoming.len(),
            effective = effective.len(),
            changed = change.len(),
            "Merged node properties"
        );

        let mut listeners = self.listeners.lock();
        drop(state);
        if !change.is_empty() {
            for listener in listeners.iter() {
                listener.on_node_properties_changed(&change);
            }
            let registered = listeners.len();
            listeners.retain(|listener| !listener.is_detached());
            if listeners.len() < registered {
                debug!(dropped = registered - listeners.len(), "Dropped detached node property listeners");
            }
        }
        Ok(effective)
    }

    // ========================================================================
    // Listeners
    // ========================================================================

    /// Add a listener. It first receives the current live entries as
    /// `added`, before any later change.
    pub fn add_listener(&self, listener: Arc<dyn NodePropertiesChangeListener>) {
        let state = self.state.lock();
        let initial = NodePropertiesChange {
            added: state.values().flat_map(|entries| entries.live_view().into_values()).collect(),
            ..Default::default()
        };
        let mut listeners = self.listeners.lock();
        drop(state);
        if !initial.is_empty() {
            listener.on_node_properties_changed(&initial);
        }
        listeners.push(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn NodePropertiesChangeListener>) {
        self.listeners
            .lock()
            .retain(|existing| !Arc::ptr_eq(existing, listener));
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// The stored record for `key` of `instance`, tombstones included.
    pub fn node_property(&self, instance: &InstanceId, key: &str) -> Option<NodeProperty> {
        self.state
            .lock()
            .get(instance)
            .and_then(|entries| entries.properties.get(key).cloned())
    }

    /// Live key/value pairs of `instance`.
    pub fn node_properties(&self, instance: &InstanceId) -> BTreeMap<String, String> {
        self.state
            .lock()
            .get(instance)
            .map(live_values)
            .unwrap_or_default()
    }

    /// Live key/value pairs of every known node, keyed by its current session.
    pub fn all_node_properties(&self) -> BTreeMap<InstanceSessionId, BTreeMap<String, String>> {
        self.state
            .lock()
            .values()
            .map(|entries| (entries.session.clone(), live_values(entries)))
            .collect()
    }

    /// Snapshot of every stored record, tombstones included. Later merges
    /// do not affect the returned records.
    pub fn detached_copy_of_entries(&self) -> Vec<NodeProperty> {
        self.state
            .lock()
            .values()
            .flat_map(|entries| entries.properties.values().cloned())
            .collect()
    }

    /// Stored records the holder of `remote` is missing or has older
    /// versions of.
    pub fn complementing_knowledge(&self, remote: &[NodeProperty]) -> Vec<NodeProperty> {
        let mut remote_sessions: HashMap<InstanceId, &InstanceSessionId> = HashMap::new();
        let mut remote_entries: HashMap<(InstanceId, &str), &NodeProperty> = HashMap::new();
        for entry in remote {
            let instance = entry.instance_id();
            remote_sessions
                .entry(instance.clone())
                .and_modify(|session| {
                    if entry.owner().is_newer_than(session) {
                        *session = entry.owner();
                    }
                })
                .or_insert(entry.owner());
            remote_entries
                .entry((instance, entry.key()))
                .and_modify(|existing| {
                    if is_more_recent(entry, existing) {
                        *existing = entry;
                    }
                })
                .or_insert(entry);
        }

        let state = self.state.lock();
        let mut result = Vec::new();
        for (instance, entries) in state.iter() {
            if let Some(remote_session) = remote_sessions.get(instance) {
                if entries.session.freshness_against(remote_session) == Freshness::Older {
                    continue;
                }
            }
            for property in entries.properties.values() {
                let wanted = match remote_entries.get(&(instance.clone(), property.key())) {
                    None => true,
                    Some(known) => is_more_recent(property, known),
                };
                if wanted {
                    result.push(property.clone());
                }
            }
        }
        result
    }

    /// Number of stored records, tombstones included.
    pub fn entry_count(&self) -> usize {
        self.state
            .lock()
            .values()
            .map(|entries| entries.properties.len())
            .sum()
    }

    pub fn instance_entry_count(&self, instance: &InstanceId) -> usize {
        self.state
            .lock()
            .get(instance)
            .map(|entries| entries.properties.len())
            .unwrap_or(0)
    }

    /// The session whose properties are stored for `instance`.
    pub fn current_session(&self, instance: &InstanceId) -> Option<InstanceSessionId> {
        self.state.lock().get(instance).map(|entries| entries.session.clone())
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn inconsistency(message: String) -> crate::error::ReplicationError {
    counter!("nodemesh_property_inconsistencies_total").increment(1);
    error!(%message, "Node properties registry inconsistency");
    corelib::Error::RegistryInconsistency(message).into()
}

/// Group records by instance, keeping the first-seen order of instances and
/// the batch order within each group.
fn group_by_instance(incoming: &[NodeProperty]) -> Vec<(InstanceId, Vec<&NodeProperty>)> {
    let mut groups: Vec<(InstanceId, Vec<&NodeProperty>)> = Vec::new();
    let mut index: HashMap<InstanceId, usize> = HashMap::new();
    for entry in incoming {
        let instance = entry.instance_id();
        match index.get(&instance) {
            Some(&i) => groups[i].1.push(entry),
            None => {
                index.insert(instance.clone(), groups.len());
                groups.push((instance, vec![entry]));
            }
        }
    }
    groups
}

/// The freshest session among `entries`, which all belong to `instance`.
fn freshest_session(instance: &InstanceId, entries: &[&NodeProperty]) -> Result<InstanceSessionId> {
    let mut best: Option<&InstanceSessionId> = None;
    for entry in entries {
        let candidate = entry.owner();
        best = match best {
            None => Some(candidate),
            Some(current) => match candidate.freshness_against(current) {
                Freshness::Newer => Some(candidate),
                Freshness::Same | Freshness::Older => Some(current),
                Freshness::Conflicting => {
                    return Err(inconsistency(format!(
                        "batch contains conflicting sessions {} and {} of instance {}",
                        candidate, current, instance
                    )))
                }
            },
        };
    }
    // groups are never empty
    best.cloned().ok_or_else(|| inconsistency(format!("empty group for instance {}", instance)))
}

/// True if `a` supersedes `b`; both describe the same instance and key.
fn is_more_recent(a: &NodeProperty, b: &NodeProperty) -> bool {
    match a.owner().freshness_against(b.owner()) {
        Freshness::Newer => true,
        Freshness::Same => a.sequence() > b.sequence(),
        Freshness::Older | Freshness::Conflicting => false,
    }
}

fn live_values(entries: &InstanceEntries) -> BTreeMap<String, String> {
    entries
        .properties
        .iter()
        .filter_map(|(key, property)| property.value().map(|value| (key.clone(), value.to_owned())))
        .collect()
}

fn diff_live_views(
    before: &BTreeMap<String, NodeProperty>,
    after: &BTreeMap<String, NodeProperty>,
    change: &mut NodePropertiesChange,
) {
    for (key, property) in after {
        match before.get(key) {
            None => change.added.push(property.clone()),
            Some(previous) if previous.value() != property.value() => change.updated.push(property.clone()),
            Some(_) => {}
        }
    }
    for (key, property) in before {
        if !after.contains_key(key) {
            change.removed.push(property.clone());
        }
    }
}
