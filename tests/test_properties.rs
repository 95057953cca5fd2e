//! Randomized operation sequences checked against an in-memory model.

use std::collections::{BTreeMap, BTreeSet};

use lumokv::{DbFlags, Environment, Error, Lookup, WriteFlags};
use proptest::prelude::*;
use tempfile::TempDir;

#[derive(Debug, Clone)]
enum Op {
    Put(Vec<u8>, Vec<u8>),
    PutNoOverwrite(Vec<u8>, Vec<u8>),
    Del(Vec<u8>),
    Commit,
    Abort,
}

/// Keys from a small alphabet so that operations collide.
fn key_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(prop::sample::select(b"abcdefgh".to_vec()), 1..6)
}

/// Mostly small values, sometimes large enough to spill into overflow pages.
fn value_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop_oneof![
        8 => prop::collection::vec(any::<u8>(), 0..64),
        1 => prop::collection::vec(any::<u8>(), 1500..6000),
    ]
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        6 => (key_strategy(), value_strategy()).prop_map(|(k, v)| Op::Put(k, v)),
        1 => (key_strategy(), value_strategy()).prop_map(|(k, v)| Op::PutNoOverwrite(k, v)),
        3 => key_strategy().prop_map(Op::Del),
        1 => Just(Op::Commit),
        1 => Just(Op::Abort),
    ]
}

fn small_value_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(prop::sample::select(b"xyz".to_vec()), 0..4)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn plain_database_matches_model(ops in prop::collection::vec(op_strategy(), 1..200)) {
        let dir = TempDir::new().unwrap();
        let env = Environment::open(dir.path(), 0, 8 << 20).unwrap();
        let db = env.open_db(None, DbFlags::empty()).unwrap();

        let mut committed: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
        let mut staged = committed.clone();
        let mut txn = env.begin_rw_txn().unwrap();
        for op in ops {
            match op {
                Op::Put(k, v) => {
                    db.put(&txn, &k, &v, WriteFlags::empty()).unwrap();
                    staged.insert(k, v);
                }
                Op::PutNoOverwrite(k, v) => {
                    let result = db.put(&txn, &k, &v, WriteFlags::NOOVERWRITE);
                    if staged.contains_key(&k) {
                        prop_assert!(matches!(result, Err(Error::KeyExist)));
                    } else {
                        result.unwrap();
                        staged.insert(k, v);
                    }
                }
                Op::Del(k) => {
                    let result = db.del(&txn, &k, None);
                    if staged.remove(&k).is_some() {
                        result.unwrap();
                    } else {
                        prop_assert!(matches!(result, Err(Error::NotFound)));
                    }
                }
                Op::Commit => {
                    txn.commit().unwrap();
                    committed = staged.clone();
                    txn = env.begin_rw_txn().unwrap();
                }
                Op::Abort => {
                    txn.abort();
                    staged = committed.clone();
                    txn = env.begin_rw_txn().unwrap();
                }
            }
        }

        // Staged view, through a cursor on the write transaction
        {
            let mut cursor = db.cursor(&txn).unwrap();
            let entries = cursor.iter().collect::<Result<Vec<_>, _>>().unwrap();
            let expected: Vec<_> = staged.clone().into_iter().collect();
            prop_assert_eq!(entries, expected);
        }
        prop_assert_eq!(db.stat(&txn).unwrap().entries, staged.len() as u64);
        txn.commit().unwrap();

        // Committed view, backwards
        let txn = env.begin_ro_txn().unwrap();
        let mut cursor = db.cursor(&txn).unwrap();
        let mut backwards = Vec::new();
        while cursor.prev().unwrap() {
            backwards.push((cursor.key().to_vec(), cursor.value().to_vec()));
        }
        backwards.reverse();
        let expected: Vec<_> = staged.into_iter().collect();
        prop_assert_eq!(backwards, expected);
    }

    #[test]
    fn dupsort_database_matches_model(
        ops in prop::collection::vec((key_strategy(), small_value_strategy(), any::<bool>()), 1..300)
    ) {
        let dir = TempDir::new().unwrap();
        let env = Environment::open(dir.path(), 1, 8 << 20).unwrap();
        let db = env.open_db(Some("dups"), DbFlags::CREATE | DbFlags::DUPSORT).unwrap();

        let mut model: BTreeMap<Vec<u8>, BTreeSet<Vec<u8>>> = BTreeMap::new();
        let txn = env.begin_rw_txn().unwrap();
        for (key, value, insert) in ops {
            if insert {
                db.put(&txn, &key, &value, WriteFlags::empty()).unwrap();
                model.entry(key).or_default().insert(value);
            } else {
                let result = db.del(&txn, &key, Some(value.as_slice()));
                let removed = model.get_mut(&key).map_or(false, |set| set.remove(&value));
                if removed {
                    result.unwrap();
                    if model.get(&key).map_or(false, BTreeSet::is_empty) {
                        model.remove(&key);
                    }
                } else {
                    prop_assert!(matches!(result, Err(Error::NotFound)));
                }
            }
        }
        txn.commit().unwrap();

        let txn = env.begin_ro_txn().unwrap();
        for (key, values) in &model {
            let expected = Lookup::Duplicates(values.iter().cloned().collect());
            prop_assert_eq!(db.lookup(&txn, key).unwrap(), Some(expected));
        }
        let mut cursor = db.cursor(&txn).unwrap();
        let mut keys = Vec::new();
        while cursor.next().unwrap() {
            keys.push(cursor.key().to_vec());
            prop_assert_eq!(cursor.count().unwrap(), model[cursor.key()].len() as u64);
            while cursor.next_dup().unwrap() {}
        }
        let expected: Vec<_> = model.keys().cloned().collect();
        prop_assert_eq!(keys, expected);
    }
}
