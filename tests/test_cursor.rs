use lumokv::{CursorOp, Database, DbFlags, Environment, Error, WriteFlags};
use tempfile::TempDir;

fn setup_test_env() -> (TempDir, Environment) {
    let temp_dir = TempDir::new().unwrap();
    let env = Environment::open(temp_dir.path(), 4, 1 << 20).unwrap();
    (temp_dir, env)
}

fn fill(env: &Environment, db: Database, pairs: &[(&str, &str)]) {
    let txn = env.begin_rw_txn().unwrap();
    for (key, value) in pairs {
        db.put(&txn, key.as_bytes(), value.as_bytes(), WriteFlags::empty()).unwrap();
    }
    txn.commit().unwrap();
}

#[test]
fn test_hello_world_traversal() {
    let (_dir, env) = setup_test_env();
    let db = env.open_db(None, DbFlags::empty()).unwrap();

    let text = b"hello, world";
    let txn = env.begin_rw_txn().unwrap();
    for pair in text.windows(2) {
        db.put(&txn, &pair[..1], &pair[1..], WriteFlags::empty()).unwrap();
    }
    txn.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    let mut cursor = db.cursor(&txn).unwrap();
    let mut seen = Vec::new();
    while cursor.next().unwrap() {
        let (key, value) = cursor.item();
        seen.push((key[0], value[0]));
    }
    assert_eq!(
        seen,
        vec![
            (b' ', b'w'),
            (b',', b' '),
            (b'e', b'l'),
            (b'h', b'e'),
            (b'l', b'd'),
            (b'o', b'r'),
            (b'r', b'l'),
            (b'w', b'o'),
        ]
    );
    // Past the end the cursor is unpositioned
    assert!(!cursor.is_positioned());
    assert_eq!(cursor.item(), (&b""[..], &b""[..]));
}

#[test]
fn test_movement_past_the_ends() {
    let (_dir, env) = setup_test_env();
    let db = env.open_db(None, DbFlags::empty()).unwrap();
    fill(&env, db, &[("a", "1"), ("b", "2"), ("c", "3")]);

    let txn = env.begin_ro_txn().unwrap();
    let mut cursor = db.cursor(&txn).unwrap();

    assert!(cursor.last().unwrap());
    assert_eq!(cursor.key(), b"c");
    assert!(!cursor.next().unwrap());
    // Off the end: next stays off, prev comes back to the last entry
    assert!(!cursor.next().unwrap());
    assert!(cursor.prev().unwrap());
    assert_eq!(cursor.key(), b"c");

    assert!(cursor.first().unwrap());
    assert!(!cursor.prev().unwrap());
    assert!(!cursor.prev().unwrap());
    assert!(cursor.next().unwrap());
    assert_eq!(cursor.item(), (&b"a"[..], &b"1"[..]));

    // An unset cursor walks backwards from the last entry
    let mut back = db.cursor(&txn).unwrap();
    let keys: Vec<u8> = std::iter::from_fn(|| back.prev().unwrap().then(|| back.key()[0])).collect();
    assert_eq!(keys, b"cba");
}

#[test]
fn test_set_key_and_set_range() {
    let (_dir, env) = setup_test_env();
    let db = env.open_db(None, DbFlags::empty()).unwrap();
    fill(&env, db, &[("apple", "1"), ("banana", "2"), ("cherry", "3")]);

    let txn = env.begin_ro_txn().unwrap();
    let mut cursor = db.cursor(&txn).unwrap();

    cursor.set_key(b"banana").unwrap();
    assert_eq!(cursor.value(), b"2");

    // A miss leaves the cursor where it was
    assert!(matches!(cursor.set_key(b"blueberry"), Err(Error::NotFound)));
    assert_eq!(cursor.key(), b"banana");

    assert!(cursor.set_range(b"blueberry").unwrap());
    assert_eq!(cursor.key(), b"cherry");
    assert!(!cursor.set_range(b"zucchini").unwrap());
    assert!(!cursor.is_positioned());
    assert!(!cursor.next().unwrap());

    assert_eq!(
        cursor.get(CursorOp::SetKey, Some(&b"apple"[..]), None).unwrap(),
        Some((b"apple".to_vec(), b"1".to_vec()))
    );
    assert_eq!(cursor.get(CursorOp::SetKey, Some(&b"nope"[..]), None).unwrap(), None);
    assert_eq!(
        cursor.get(CursorOp::Next, None, None).unwrap(),
        Some((b"banana".to_vec(), b"2".to_vec()))
    );
}

#[test]
fn test_dup_operations_on_plain_database() {
    let (_dir, env) = setup_test_env();
    let db = env.open_db(None, DbFlags::empty()).unwrap();
    fill(&env, db, &[("a", "1"), ("b", "2")]);

    let txn = env.begin_ro_txn().unwrap();
    let mut cursor = db.cursor(&txn).unwrap();
    assert!(!cursor.next_dup().unwrap());
    assert_eq!(cursor.count().unwrap(), 0);

    cursor.set_key(b"a").unwrap();
    assert!(cursor.first_dup().unwrap());
    assert!(cursor.last_dup().unwrap());
    assert!(cursor.next_dup().unwrap());
    assert!(cursor.next_nodup().unwrap());
    assert_eq!(cursor.key(), b"a");
    assert_eq!(cursor.count().unwrap(), 1);
}

#[test]
fn test_cursor_sees_writes_in_same_transaction() {
    let (_dir, env) = setup_test_env();
    let db = env.open_db(None, DbFlags::empty()).unwrap();
    fill(&env, db, &[("b", "2"), ("d", "4")]);

    let txn = env.begin_rw_txn().unwrap();
    let mut cursor = db.cursor(&txn).unwrap();
    assert!(cursor.first().unwrap());
    assert_eq!(cursor.key(), b"b");

    // Written through the handle, not the cursor
    db.put(&txn, b"c", b"3", WriteFlags::empty()).unwrap();
    db.put(&txn, b"a", b"1", WriteFlags::empty()).unwrap();
    assert!(cursor.next().unwrap());
    assert_eq!(cursor.key(), b"c");

    db.del(&txn, b"c", None).unwrap();
    assert!(!cursor.get_current().unwrap());
    assert!(cursor.next().unwrap());
    assert_eq!(cursor.key(), b"d");

    assert!(cursor.first().unwrap());
    assert_eq!(cursor.key(), b"a");
}

#[test]
fn test_item_follows_writes_to_current_entry() {
    let (_dir, env) = setup_test_env();
    let db = env.open_db(None, DbFlags::empty()).unwrap();
    fill(&env, db, &[("j", "0"), ("k", "v1"), ("l", "2")]);

    let txn = env.begin_rw_txn().unwrap();
    let mut cursor = db.cursor(&txn).unwrap();
    cursor.set_key(b"k").unwrap();
    assert_eq!(cursor.value(), b"v1");

    db.put(&txn, b"k", b"v2", WriteFlags::empty()).unwrap();
    assert_eq!(cursor.item(), (&b"k"[..], &b"v2"[..]));
    assert_eq!(
        cursor.get(CursorOp::GetCurrent, None, None).unwrap(),
        Some((b"k".to_vec(), b"v2".to_vec()))
    );

    // A deleted entry reads as empty; movement resumes from its place
    db.del(&txn, b"k", None).unwrap();
    assert_eq!(cursor.item(), (&b""[..], &b""[..]));
    assert!(!cursor.is_positioned());
    assert!(!cursor.get_current().unwrap());
    assert!(cursor.next().unwrap());
    assert_eq!(cursor.item(), (&b"l"[..], &b"2"[..]));

    cursor.set_key(b"j").unwrap();
    db.del(&txn, b"j", None).unwrap();
    assert!(!cursor.prev().unwrap());
    assert!(cursor.next().unwrap());
    assert_eq!(cursor.key(), b"l");
}

#[test]
fn test_cursor_put_and_del() {
    let (_dir, env) = setup_test_env();
    let db = env.open_db(None, DbFlags::empty()).unwrap();

    let txn = env.begin_rw_txn().unwrap();
    let mut cursor = db.cursor(&txn).unwrap();
    assert!(matches!(cursor.del(), Err(Error::NotFound)));

    for key in [b"k3", b"k1", b"k2"] {
        cursor.put(key, b"v", WriteFlags::empty()).unwrap();
        assert_eq!(cursor.key(), key);
    }

    cursor.set_key(b"k2").unwrap();
    cursor.del().unwrap();
    assert_eq!(cursor.key(), b"k3");
    cursor.del().unwrap();
    assert!(!cursor.is_positioned());
    assert!(cursor.prev().unwrap());
    assert_eq!(cursor.key(), b"k1");
    drop(cursor);

    assert_eq!(db.stat(&txn).unwrap().entries, 1);
    txn.commit().unwrap();
}

#[test]
fn test_iterators() {
    let (_dir, env) = setup_test_env();
    let db = env.open_db(None, DbFlags::empty()).unwrap();
    let txn = env.begin_rw_txn().unwrap();
    for i in 0..500u32 {
        db.put(&txn, format!("{:04}", i).as_bytes(), &i.to_le_bytes(), WriteFlags::empty()).unwrap();
    }
    txn.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    let mut cursor = db.cursor(&txn).unwrap();
    let all: Vec<_> = cursor.iter().collect::<Result<_, _>>().unwrap();
    assert_eq!(all.len(), 500);
    assert!(all.windows(2).all(|w| w[0].0 < w[1].0));

    let tail: Vec<_> = cursor.iter_from(b"0490").map(|r| r.unwrap().0).collect();
    assert_eq!(tail.len(), 10);
    assert_eq!(tail[0], b"0490");

    let one: Vec<_> = cursor.iter_dup_of(b"0007").map(|r| r.unwrap().1).collect();
    assert_eq!(one, vec![7u32.to_le_bytes().to_vec()]);
    assert_eq!(cursor.iter_dup_of(b"missing").count(), 0);
}
