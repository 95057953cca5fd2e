use lumokv::{Database, DbFlags, Environment, Error, Lookup, WriteFlags, MAX_KEY_SIZE};
use tempfile::TempDir;

fn setup_dup_db() -> (TempDir, Environment, Database) {
    let temp_dir = TempDir::new().unwrap();
    let env = Environment::open(temp_dir.path(), 4, 1 << 21).unwrap();
    let db = env.open_db(Some("dups"), DbFlags::CREATE | DbFlags::DUPSORT).unwrap();
    (temp_dir, env, db)
}

#[test]
fn test_values_come_back_sorted() {
    let (_dir, env, db) = setup_dup_db();
    let txn = env.begin_rw_txn().unwrap();
    db.put(&txn, b"k", b"b", WriteFlags::empty()).unwrap();
    db.put(&txn, b"k", b"a", WriteFlags::empty()).unwrap();
    db.put(&txn, b"k", b"c", WriteFlags::empty()).unwrap();
    // Same pair again is a no-op
    db.put(&txn, b"k", b"a", WriteFlags::empty()).unwrap();
    txn.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    assert_eq!(db.flags(&txn).unwrap(), DbFlags::DUPSORT);
    assert_eq!(
        db.lookup(&txn, b"k").unwrap(),
        Some(Lookup::Duplicates(vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]))
    );
    assert_eq!(db.get(&txn, b"k").unwrap().unwrap(), b"a");
    assert_eq!(db.stat(&txn).unwrap().entries, 3);
    assert_eq!(db.lookup(&txn, b"other").unwrap(), None);
}

#[test]
fn test_single_value_still_reported_as_duplicates() {
    let (_dir, env, db) = setup_dup_db();
    let txn = env.begin_rw_txn().unwrap();
    db.put(&txn, b"k", b"only", WriteFlags::empty()).unwrap();
    let found = db.lookup(&txn, b"k").unwrap().unwrap();
    assert_eq!(found, Lookup::Duplicates(vec![b"only".to_vec()]));
    assert_eq!(found.first(), b"only");
    assert_eq!(found.len(), 1);
}

#[test]
fn test_write_flags() {
    let (_dir, env, db) = setup_dup_db();
    let txn = env.begin_rw_txn().unwrap();
    db.put(&txn, b"k", b"a", WriteFlags::empty()).unwrap();

    assert!(matches!(
        db.put(&txn, b"k", b"a", WriteFlags::NODUPDATA),
        Err(Error::KeyExist)
    ));
    db.put(&txn, b"k", b"b", WriteFlags::NODUPDATA).unwrap();
    assert!(matches!(
        db.put(&txn, b"k", b"z", WriteFlags::NOOVERWRITE),
        Err(Error::KeyExist)
    ));
    db.put(&txn, b"j", b"z", WriteFlags::NOOVERWRITE).unwrap();

    let too_long = vec![0u8; MAX_KEY_SIZE + 1];
    assert!(matches!(
        db.put(&txn, b"k", &too_long, WriteFlags::empty()),
        Err(Error::BadValSize)
    ));
    assert_eq!(db.stat(&txn).unwrap().entries, 3);
}

#[test]
fn test_delete_one_or_all_values() {
    let (_dir, env, db) = setup_dup_db();
    let txn = env.begin_rw_txn().unwrap();
    for v in [b"1", b"2", b"3"] {
        db.put(&txn, b"k", v, WriteFlags::empty()).unwrap();
    }
    db.put(&txn, b"m", b"1", WriteFlags::empty()).unwrap();

    db.del(&txn, b"k", Some(&b"2"[..])).unwrap();
    assert!(matches!(db.del(&txn, b"k", Some(&b"2"[..])), Err(Error::NotFound)));
    assert_eq!(db.lookup(&txn, b"k").unwrap().unwrap().into_vec(), vec![b"1".to_vec(), b"3".to_vec()]);

    db.del(&txn, b"k", None).unwrap();
    assert_eq!(db.lookup(&txn, b"k").unwrap(), None);
    assert!(matches!(db.del(&txn, b"k", None), Err(Error::NotFound)));
    assert_eq!(db.get(&txn, b"m").unwrap().unwrap(), b"1");
    assert_eq!(db.stat(&txn).unwrap().entries, 1);
}

#[test]
fn test_cursor_duplicate_navigation() {
    let (_dir, env, db) = setup_dup_db();
    let txn = env.begin_rw_txn().unwrap();
    for (k, v) in [("a", "1"), ("b", "1"), ("b", "2"), ("b", "3"), ("c", "9")] {
        db.put(&txn, k.as_bytes(), v.as_bytes(), WriteFlags::empty()).unwrap();
    }
    txn.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    let mut cursor = db.cursor(&txn).unwrap();
    cursor.set_key(b"b").unwrap();
    assert_eq!(cursor.item(), (&b"b"[..], &b"1"[..]));
    assert_eq!(cursor.count().unwrap(), 3);

    assert!(cursor.next_dup().unwrap());
    assert_eq!(cursor.value(), b"2");
    assert!(cursor.last_dup().unwrap());
    assert_eq!(cursor.value(), b"3");
    // Past the last value the cursor stays put
    assert!(!cursor.next_dup().unwrap());
    assert_eq!(cursor.value(), b"3");
    assert!(cursor.prev_dup().unwrap());
    assert_eq!(cursor.value(), b"2");
    assert!(cursor.first_dup().unwrap());
    assert_eq!(cursor.value(), b"1");
    assert!(!cursor.prev_dup().unwrap());

    assert!(cursor.next_nodup().unwrap());
    assert_eq!(cursor.item(), (&b"c"[..], &b"9"[..]));
    assert!(cursor.prev_nodup().unwrap());
    assert_eq!(cursor.item(), (&b"b"[..], &b"3"[..]));
    assert!(cursor.prev_nodup().unwrap());
    assert_eq!(cursor.key(), b"a");
    assert!(!cursor.prev_nodup().unwrap());
    assert!(!cursor.is_positioned());

    cursor.get_both(b"b", b"2").unwrap();
    assert_eq!(cursor.value(), b"2");
    assert!(matches!(cursor.get_both(b"b", b"7"), Err(Error::NotFound)));
    assert_eq!(cursor.value(), b"2");
    assert!(cursor.get_both_range(b"b", b"25").unwrap());
    assert_eq!(cursor.value(), b"3");
    assert!(!cursor.get_both_range(b"b", b"4").unwrap());
    assert_eq!(cursor.value(), b"3");

    let values: Vec<_> = cursor.iter_dup_of(b"b").map(|r| r.unwrap().1).collect();
    assert_eq!(values, vec![b"1".to_vec(), b"2".to_vec(), b"3".to_vec()]);
}

#[test]
fn test_cursor_del_removes_single_value() {
    let (_dir, env, db) = setup_dup_db();
    let txn = env.begin_rw_txn().unwrap();
    for v in ["x", "y", "z"] {
        db.put(&txn, b"k", v.as_bytes(), WriteFlags::empty()).unwrap();
    }
    let mut cursor = db.cursor(&txn).unwrap();
    cursor.get_both(b"k", b"y").unwrap();
    cursor.del().unwrap();
    assert_eq!(cursor.item(), (&b"k"[..], &b"z"[..]));
    assert_eq!(cursor.count().unwrap(), 2);
    drop(cursor);
    txn.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    assert_eq!(db.lookup(&txn, b"k").unwrap().unwrap().into_vec(), vec![b"x".to_vec(), b"z".to_vec()]);
}

#[test]
fn test_many_duplicates_span_pages() {
    let (_dir, env, db) = setup_dup_db();
    let txn = env.begin_rw_txn().unwrap();
    // Insert in reverse so every page split happens inside one key
    for i in (0..600u32).rev() {
        let value = format!("{:0>200}", i);
        db.put(&txn, b"same", value.as_bytes(), WriteFlags::empty()).unwrap();
    }
    db.put(&txn, b"after", b"1", WriteFlags::empty()).unwrap();
    db.put(&txn, b"zulu", b"1", WriteFlags::empty()).unwrap();
    let before = db.stat(&txn).unwrap();
    assert!(before.leaf_pages > 1);
    txn.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    let mut cursor = db.cursor(&txn).unwrap();
    cursor.set_key(b"same").unwrap();
    assert_eq!(cursor.count().unwrap(), 600);
    let values: Vec<_> = cursor.iter_dup_of(b"same").map(|r| r.unwrap().1).collect();
    assert_eq!(values.len(), 600);
    assert!(values.windows(2).all(|w| w[0] < w[1]));

    assert!(cursor.next_nodup().unwrap());
    assert_eq!(cursor.key(), b"zulu");
    cursor.set_key(b"same").unwrap();
    assert!(cursor.prev_nodup().unwrap());
    assert_eq!(cursor.key(), b"after");
    txn.abort();

    let txn = env.begin_rw_txn().unwrap();
    db.del(&txn, b"same", None).unwrap();
    let stat = db.stat(&txn).unwrap();
    assert_eq!(stat.entries, 2);
    assert!(stat.leaf_pages < before.leaf_pages);
    assert_eq!(db.get(&txn, b"zulu").unwrap().unwrap(), b"1");
    txn.commit().unwrap();
}

#[test]
fn test_conflicting_flags_are_rejected() {
    let (_dir, env, db) = setup_dup_db();
    assert!(matches!(env.open_db(Some("dups"), DbFlags::CREATE), Err(Error::Incompatible)));
    assert_eq!(env.open_db(Some("dups"), DbFlags::empty()).unwrap(), db);
    assert_eq!(env.open_db(Some("dups"), DbFlags::DUPSORT).unwrap(), db);
    assert!(matches!(env.open_db(None, DbFlags::DUPSORT), Err(Error::Incompatible)));
}
