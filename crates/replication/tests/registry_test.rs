//! Merge semantics of the node properties registry.
//!
//! # Test Strategy
//!
//! 1. **Worked examples**: supersession of a single key, partial updates
//! 2. **Properties**: idempotence, supersession, out-of-order rejection
//! 3. **Snapshots**: detached copies do not follow later merges
//! 4. **Concurrency**: racing merges of two sessions of one instance

use std::collections::{BTreeMap, BTreeSet};
use std::thread;

use corelib::{InstanceId, InstanceSessionId};
use proptest::prelude::*;
use replication::{NodeProperty, NodePropertiesRegistry};

fn session(instance: &InstanceId, generation: u32) -> InstanceSessionId {
    InstanceSessionId::new(instance, generation).unwrap()
}

fn record(owner: &InstanceSessionId, key: &str, sequence: u64, value: &str) -> NodeProperty {
    NodeProperty::parse_compact_form(&format!("{}:{}:{}:{}", owner, key, sequence, value)).unwrap()
}

// ============================================================================
// Worked Examples
// ============================================================================

#[test]
fn test_newer_session_keeps_single_entry() {
    // A::S1:k1:100:v1 followed by A::S2:k1:100:v2
    let registry = NodePropertiesRegistry::new();
    let a = InstanceId::generate();
    let (s1, s2) = (session(&a, 1), session(&a, 2));

    registry
        .merge_and_get_effective_subset(&[record(&s1, "k1", 100, "v1")])
        .unwrap();
    registry
        .merge_and_get_effective_subset(&[record(&s2, "k1", 100, "v2")])
        .unwrap();

    assert_eq!(registry.instance_entry_count(&a), 1);
    assert_eq!(registry.current_session(&a), Some(s2.clone()));
    let stored = registry.node_property(&a, "k1").unwrap();
    assert_eq!(stored.owner(), &s2);
    assert_eq!(stored.value(), Some("v2"));
}

#[test]
fn test_partial_update_effective_subset() {
    // 4 properties across two instances, then an update to 2 of them
    let registry = NodePropertiesRegistry::new();
    let a = session(&InstanceId::generate(), 1);
    let b = session(&InstanceId::generate(), 1);

    let initial = [
        record(&a, "k1", 1, "a1"),
        record(&a, "k2", 1, "a2"),
        record(&b, "k1", 1, "b1"),
        record(&b, "k2", 1, "b2"),
    ];
    assert_eq!(registry.merge_and_get_effective_subset(&initial).unwrap().len(), 4);
    assert_eq!(registry.entry_count(), 4);

    let update = [record(&a, "k1", 2, "a1'"), record(&b, "k2", 2, "b2'")];
    let effective = registry.merge_and_get_effective_subset(&update).unwrap();
    assert_eq!(effective.len(), 2);
    assert_eq!(registry.entry_count(), 4);
    assert_eq!(
        registry.node_properties(&a.instance_id()).get("k1").map(String::as_str),
        Some("a1'")
    );
}

#[test]
fn test_supersession_ignores_sequence_numbers() {
    let registry = NodePropertiesRegistry::new();
    let a = InstanceId::generate();
    let (s1, s2) = (session(&a, 4), session(&a, 5));

    registry
        .merge_and_get_effective_subset(&[record(&s1, "k", u64::MAX, "old")])
        .unwrap();
    let effective = registry
        .merge_and_get_effective_subset(&[record(&s2, "k", 0, "new")])
        .unwrap();

    assert_eq!(effective.len(), 1);
    assert_eq!(registry.node_property(&a, "k").unwrap().value(), Some("new"));
}

#[test]
fn test_all_node_properties_keyed_by_session() {
    let registry = NodePropertiesRegistry::new();
    let a = session(&InstanceId::generate(), 1);
    let b = session(&InstanceId::generate(), 2);
    registry
        .merge_and_get_effective_subset(&[
            record(&a, "k", 1, "x"),
            record(&b, "k", 1, "y"),
            record(&b, "gone", 1, ""),
        ])
        .unwrap();

    let all = registry.all_node_properties();
    assert_eq!(all.len(), 2);
    assert_eq!(all[&a].get("k").map(String::as_str), Some("x"));
    assert_eq!(all[&b].len(), 1);
}

#[test]
fn test_detached_copy_is_a_snapshot() {
    let registry = NodePropertiesRegistry::new();
    let a = session(&InstanceId::generate(), 1);
    registry.merge_and_get_effective_subset(&[record(&a, "k", 1, "x")]).unwrap();

    let snapshot = registry.detached_copy_of_entries();
    registry
        .merge_and_get_effective_subset(&[record(&a, "k", 2, "y"), record(&a, "j", 2, "z")])
        .unwrap();

    assert_eq!(snapshot, vec![record(&a, "k", 1, "x")]);
    assert_eq!(registry.detached_copy_of_entries().len(), 2);
}

// ============================================================================
// Concurrency
// ============================================================================

#[test]
fn test_concurrent_merges_for_one_instance() {
    const THREADS: u64 = 8;
    const ROUNDS: u64 = 50;
    const KEYS: [&str; 3] = ["k0", "k1", "k2"];

    let registry = NodePropertiesRegistry::new();
    let a = InstanceId::generate();
    let (s1, s2) = (session(&a, 1), session(&a, 2));
    // every third batch comes from the old session, with larger sequences
    let owner_of = |thread: u64, round: u64| if (thread + round) % 3 == 0 { &s1 } else { &s2 };
    let sequence_of = |thread: u64, round: u64| {
        let sequence = round * THREADS + thread;
        if (thread + round) % 3 == 0 {
            sequence + 1_000_000
        } else {
            sequence
        }
    };
    let value_of = |thread: u64, round: u64| format!("t{}r{}", thread, round);

    let applied: Vec<NodeProperty> = thread::scope(|scope| {
        let workers: Vec<_> = (0..THREADS)
            .map(|thread| {
                let registry = &registry;
                scope.spawn(move || {
                    let mut applied = Vec::new();
                    for round in 0..ROUNDS {
                        let batch: Vec<NodeProperty> = KEYS
                            .iter()
                            .map(|key| {
                                record(
                                    owner_of(thread, round),
                                    key,
                                    sequence_of(thread, round),
                                    &value_of(thread, round),
                                )
                            })
                            .collect();
                        applied.extend(registry.merge_and_get_effective_subset(&batch).unwrap());
                    }
                    applied
                })
            })
            .collect();
        workers
            .into_iter()
            .flat_map(|worker| worker.join().unwrap())
            .collect()
    });

    // only the newer session survives
    let stored = registry.detached_copy_of_entries();
    assert_eq!(registry.current_session(&a), Some(s2.clone()));
    assert_eq!(stored.len(), KEYS.len());
    assert!(stored.iter().all(|entry| entry.owner() == &s2));

    // each key holds the highest sequence the newer session sent
    let (thread, round) = (0..THREADS)
        .flat_map(|thread| (0..ROUNDS).map(move |round| (thread, round)))
        .filter(|&(thread, round)| owner_of(thread, round) == &s2)
        .max_by_key(|&(thread, round)| sequence_of(thread, round))
        .unwrap();
    for entry in &stored {
        assert_eq!(entry.sequence(), sequence_of(thread, round), "{}", entry);
        assert_eq!(entry.value(), Some(value_of(thread, round).as_str()));
    }

    // the final state was reported as effective by some merge
    for entry in &stored {
        assert!(applied.contains(entry), "{} never reported as effective", entry);
    }
    let last_applied: BTreeMap<&str, &NodeProperty> = applied
        .iter()
        .filter(|entry| entry.owner() == &s2)
        .map(|entry| (entry.key(), entry))
        .fold(BTreeMap::new(), |mut latest, (key, entry)| {
            let newer = latest.get(key).map_or(true, |current: &&NodeProperty| entry.sequence() > current.sequence());
            if newer {
                latest.insert(key, entry);
            }
            latest
        });
    let final_state: BTreeMap<&str, &NodeProperty> = stored.iter().map(|entry| (entry.key(), entry)).collect();
    assert_eq!(last_applied, final_state);
}

// ============================================================================
// Properties
// ============================================================================

/// (instance index, generation index, key index, sequence, value index)
type RawEntry = (usize, usize, usize, u64, usize);

const VALUES: [&str; 3] = ["a", "b", ""];

fn raw_entries() -> impl Strategy<Value = Vec<RawEntry>> {
    prop::collection::vec((0..2usize, 0..3usize, 0..3usize, 0..5u64, 0..3usize), 0..24)
}

/// Two instances with three ordered sessions each.
fn session_table() -> Vec<Vec<InstanceSessionId>> {
    (0..2)
        .map(|_| {
            let instance = InstanceId::generate();
            (1..=3).map(|generation| session(&instance, generation)).collect()
        })
        .collect()
}

fn build(table: &[Vec<InstanceSessionId>], raw: &[RawEntry]) -> Vec<NodeProperty> {
    raw.iter()
        .map(|&(instance, generation, key, sequence, value)| {
            record(&table[instance][generation], &format!("k{}", key), sequence, VALUES[value])
        })
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn merge_is_idempotent(raw in raw_entries(), prior in raw_entries()) {
        let table = session_table();
        let registry = NodePropertiesRegistry::new();
        registry.merge_and_get_effective_subset(&build(&table, &prior)).unwrap();

        let batch = build(&table, &raw);
        registry.merge_and_get_effective_subset(&batch).unwrap();
        let once = registry.detached_copy_of_entries();
        registry.merge_and_get_effective_subset(&batch).unwrap();
        let twice = registry.detached_copy_of_entries();

        prop_assert_eq!(once, twice);
    }

    #[test]
    fn newer_session_supersedes(old in raw_entries(), new in raw_entries()) {
        let table = session_table();
        let registry = NodePropertiesRegistry::new();
        let old: Vec<RawEntry> = old.into_iter().map(|(_, _, k, s, v)| (0, 0, k, s + 1_000, v)).collect();
        let new: Vec<RawEntry> = new.into_iter().map(|(_, _, k, s, v)| (0, 1, k, s, v)).collect();
        prop_assume!(!new.is_empty());

        registry.merge_and_get_effective_subset(&build(&table, &old)).unwrap();
        registry.merge_and_get_effective_subset(&build(&table, &new)).unwrap();

        let instance = table[0][0].instance_id();
        let stored = registry.detached_copy_of_entries();
        prop_assert!(stored.iter().all(|entry| entry.owner() == &table[0][1]));

        let expected_keys: BTreeSet<String> = new.iter().map(|&(_, _, k, _, _)| format!("k{}", k)).collect();
        let stored_keys: BTreeSet<String> = stored.iter().map(|entry| entry.key().to_owned()).collect();
        prop_assert_eq!(stored_keys, expected_keys);
        prop_assert_eq!(registry.current_session(&instance), Some(table[0][1].clone()));
    }

    #[test]
    fn older_session_is_rejected(current in raw_entries(), late in raw_entries()) {
        let table = session_table();
        let registry = NodePropertiesRegistry::new();
        let current: Vec<RawEntry> = current.into_iter().map(|(_, _, k, s, v)| (0, 2, k, s, v)).collect();
        let late: Vec<RawEntry> = late.into_iter().map(|(_, g, k, s, v)| (0, g.min(1), k, s + 1_000, v)).collect();
        prop_assume!(!current.is_empty());

        registry.merge_and_get_effective_subset(&build(&table, &current)).unwrap();
        let before = registry.detached_copy_of_entries();
        let effective = registry.merge_and_get_effective_subset(&build(&table, &late)).unwrap();

        prop_assert!(effective.is_empty());
        prop_assert_eq!(registry.detached_copy_of_entries(), before);
    }

    #[test]
    fn effective_subset_is_applied(raw in raw_entries()) {
        let table = session_table();
        let registry = NodePropertiesRegistry::new();
        let effective = registry.merge_and_get_effective_subset(&build(&table, &raw)).unwrap();

        for entry in &effective {
            let stored = registry.node_property(&entry.instance_id(), entry.key());
            prop_assert_eq!(stored.as_ref(), Some(entry));
        }
    }
}
