#![allow(missing_docs)]

use std::collections::BTreeSet;

use proptest::prelude::*;
use recstore::store::common::id_file_path;
use recstore::store::record::{NodeFormat, NodeRecord};
use recstore::store::{IdGenerator, RecordStore, RebuildMode, Store, StoreConfig};
use recstore::types::NodeId;
use tempfile::tempdir;

const MAX: u64 = u32::MAX as u64;

#[derive(Debug, Clone)]
enum Op {
    Allocate,
    /// Frees the live id at this position (modulo the live count).
    Free(usize),
    /// Closes and reopens the sidecar.
    Reopen,
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => Just(Op::Allocate),
        3 => any::<usize>().prop_map(Op::Free),
        1 => Just(Op::Reopen),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_issued_ids_are_unique_and_lowest_free_first(
        ops in prop::collection::vec(arb_op(), 1..200)
    ) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nodes.id");
        IdGenerator::create(&path, 0).unwrap();
        let mut ids = IdGenerator::open(&path, MAX).unwrap();
        let mut live: BTreeSet<u64> = BTreeSet::new();
        let mut free: BTreeSet<u64> = BTreeSet::new();
        let mut high = 0u64;

        for op in ops {
            match op {
                Op::Allocate => {
                    let id = ids.next_id().unwrap();
                    let expected = free.pop_first().unwrap_or_else(|| {
                        high += 1;
                        high - 1
                    });
                    prop_assert_eq!(id, expected);
                    prop_assert!(live.insert(id), "id {} issued twice", id);
                }
                Op::Free(pick) => {
                    if live.is_empty() {
                        continue;
                    }
                    let id = *live.iter().nth(pick % live.len()).unwrap();
                    ids.free_id(id).unwrap();
                    live.remove(&id);
                    free.insert(id);
                }
                Op::Reopen => {
                    ids.close().unwrap();
                    ids = IdGenerator::open(&path, MAX).unwrap();
                }
            }
            prop_assert_eq!(ids.high_id(), high);
            prop_assert_eq!(ids.number_of_ids_in_use(), live.len() as u64);
        }
    }

    #[test]
    fn prop_full_rebuild_frees_exactly_the_unused_gaps(
        used in prop::collection::btree_set(0u64..64, 1..32)
    ) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nodes.id");
        let mut ids = IdGenerator::rebuild(&path, MAX, RebuildMode::Full, 64, |id| {
            Ok(used.contains(&id))
        })
        .unwrap();
        let last = *used.iter().next_back().unwrap();
        prop_assert_eq!(ids.high_id(), last + 1);
        let gaps: Vec<u64> = (0..last).filter(|id| !used.contains(id)).collect();
        prop_assert_eq!(ids.free_count(), gaps.len());
        for gap in gaps {
            prop_assert_eq!(ids.next_id().unwrap(), gap);
        }
        prop_assert_eq!(ids.next_id().unwrap(), last + 1);
    }
}

#[test]
fn repaired_node_store_reuses_its_holes() -> recstore::Result<()> {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("graph.nodes");
    RecordStore::<NodeFormat>::create(&path)?;
    let config = StoreConfig::default().rebuild_id_generators_fast(false);
    {
        let store = RecordStore::<NodeFormat>::open(&path, &config)?;
        for _ in 0..5 {
            let id = store.next_id()?;
            // Odd slots are issued but never written.
            if id.0 % 2 == 0 {
                store.update_record(&NodeRecord::new(id))?;
            }
        }
        store.close()?;
    }
    std::fs::remove_file(id_file_path(&path))?;

    let store = RecordStore::<NodeFormat>::open(&path, &config)?;
    assert!(!store.is_store_ok());
    store.set_recovery_mode(true);
    store.make_store_ok()?;
    store.set_recovery_mode(false);
    assert_eq!(store.next_id()?, NodeId(1));
    assert_eq!(store.next_id()?, NodeId(3));
    assert_eq!(store.next_id()?, NodeId(5));
    store.close()
}
