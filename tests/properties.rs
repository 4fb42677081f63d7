//! Property tests: the store against an in-memory model.

use instance_store::{Compactor, DataStore, IndexStore, InstanceKey, InstanceStore, StoreConfig};
use proptest::prelude::*;
use std::collections::HashMap;
use tempfile::TempDir;

#[derive(Clone, Debug)]
enum Op {
    Put(u8, Vec<u8>),
    Modify(u8, Vec<u8>),
    Remove(u8),
    Reclaim,
}

fn arb_bytes() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..64)
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0u8..8, arb_bytes()).prop_map(|(k, v)| Op::Put(k, v)),
        3 => (0u8..8, arb_bytes()).prop_map(|(k, v)| Op::Modify(k, v)),
        3 => (0u8..8).prop_map(Op::Remove),
        1 => Just(Op::Reclaim),
    ]
}

fn key(k: u8) -> InstanceKey {
    InstanceKey::new(format!("pg_prop.id=\"{}\"", k))
}

fn apply(store: &InstanceStore, model: &mut HashMap<u8, Vec<u8>>, op: &Op) {
    match op {
        Op::Put(k, v) => {
            let result = store.put(&key(*k), v);
            if model.contains_key(k) {
                assert!(result.is_err());
            } else {
                result.unwrap();
                model.insert(*k, v.clone());
            }
        }
        Op::Modify(k, v) => {
            let result = store.modify(&key(*k), v);
            if model.contains_key(k) {
                result.unwrap();
                model.insert(*k, v.clone());
            } else {
                assert!(result.is_err());
            }
        }
        Op::Remove(k) => {
            let result = store.remove(&key(*k));
            if model.remove(k).is_some() {
                result.unwrap();
            } else {
                assert!(result.is_err());
            }
        }
        Op::Reclaim => {
            store.reclaim().unwrap();
        }
    }
}

fn check(store: &InstanceStore, model: &HashMap<u8, Vec<u8>>) {
    for k in 0u8..8 {
        match model.get(&k) {
            Some(v) => assert_eq!(&store.get(&key(k)).unwrap(), v),
            None => assert!(!store.contains(&key(k))),
        }
    }

    let all: HashMap<InstanceKey, Vec<u8>> = store.get_all().unwrap().into_iter().collect();
    assert_eq!(all.len(), model.len());
    for (k, v) in model {
        assert_eq!(all.get(&key(*k)), Some(v));
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_store_matches_model(ops in prop::collection::vec(arb_op(), 1..60)) {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig {
            max_free_count: 4,
            max_orphaned_bytes: 256,
            cache_size: 3,
            ..StoreConfig::new(dir.path().join("repository"), "pg_prop")
        };

        let mut model = HashMap::new();
        {
            let store = InstanceStore::open(config.clone()).unwrap();
            for op in &ops {
                apply(&store, &mut model, op);
            }
            check(&store, &model);
        }

        // Same contents after reopening from disk
        let store = InstanceStore::open(config).unwrap();
        check(&store, &model);
    }

    #[test]
    fn prop_compaction_preserves_live_entries(
        values in prop::collection::vec(arb_bytes(), 1..20),
        deletes in prop::collection::vec(any::<bool>(), 20),
        rewrites in prop::collection::vec(prop::option::of(arb_bytes()), 20),
    ) {
        let dir = TempDir::new().unwrap();
        let mut index = IndexStore::open(dir.path().join("pg.idx")).unwrap();
        let mut data = DataStore::open(dir.path().join("pg.instances")).unwrap();

        let mut expected = Vec::new();
        for (i, value) in values.iter().enumerate() {
            let k = key(i as u8);
            let offset = data.append_instance(value).unwrap();
            index.create_entry(&k, offset, value.len() as u64).unwrap();

            if deletes[i] {
                index.delete_entry(&k).unwrap();
                continue;
            }
            let content = match &rewrites[i] {
                Some(new_value) => {
                    let offset = data.append_instance(new_value).unwrap();
                    index.modify_entry(&k, offset, new_value.len() as u64).unwrap();
                    new_value.clone()
                }
                None => value.clone(),
            };
            expected.push((k, content));
        }

        let stats = Compactor::new(&mut index, &mut data).run().unwrap();

        let all = index.enumerate_entries(true);
        prop_assert_eq!(all.free_count(), 0);
        prop_assert_eq!(&all.keys, &expected.iter().map(|(k, _)| k.clone()).collect::<Vec<_>>());

        let live_bytes: u64 = expected.iter().map(|(_, v)| v.len() as u64).sum();
        prop_assert_eq!(data.len(), live_bytes);
        prop_assert_eq!(stats.bytes_after, live_bytes);

        for (k, content) in &expected {
            let entry = index.lookup_entry(k).unwrap().clone();
            prop_assert_eq!(&data.load_instance(entry.offset, entry.size).unwrap(), content);
        }
    }

    #[test]
    fn prop_rollback_restores_data(
        committed in prop::collection::vec(arb_bytes(), 0..8),
        discarded in prop::collection::vec(arb_bytes(), 1..8),
    ) {
        let dir = TempDir::new().unwrap();
        let mut data = DataStore::open(dir.path().join("pg.instances")).unwrap();

        for bytes in &committed {
            data.append_instance(bytes).unwrap();
        }
        let before = data.load_all_instances().unwrap();

        data.begin_transaction().unwrap();
        for bytes in &discarded {
            data.append_instance(bytes).unwrap();
        }
        data.rollback_transaction().unwrap();

        prop_assert_eq!(data.load_all_instances().unwrap(), before);
    }
}
