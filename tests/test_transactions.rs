use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use lumokv::{Database, DbFlags, EnvFlags, Environment, Error, WriteFlags};
use tempfile::TempDir;

fn setup_test_env() -> (TempDir, Environment, Database) {
    let _ = env_logger::builder().is_test(true).try_init();
    let temp_dir = TempDir::new().unwrap();
    let env = Environment::open(temp_dir.path(), 4, 1 << 20).unwrap();
    let db = env.open_db(None, DbFlags::empty()).unwrap();
    (temp_dir, env, db)
}

#[test]
fn test_abort_discards_writes() {
    let (_dir, env, db) = setup_test_env();
    let txn = env.begin_rw_txn().unwrap();
    db.put(&txn, b"kept", b"1", WriteFlags::empty()).unwrap();
    let committed = txn.commit().unwrap();

    let txn = env.begin_rw_txn().unwrap();
    db.put(&txn, b"lost", b"2", WriteFlags::empty()).unwrap();
    db.del(&txn, b"kept", None).unwrap();
    txn.abort();

    // Dropping without commit aborts too
    {
        let txn = env.begin_rw_txn().unwrap();
        db.put(&txn, b"dropped", b"3", WriteFlags::empty()).unwrap();
    }

    let txn = env.begin_ro_txn().unwrap();
    assert_eq!(txn.id(), committed);
    assert_eq!(db.get(&txn, b"kept").unwrap().unwrap(), b"1");
    assert!(db.get(&txn, b"lost").unwrap().is_none());
    assert!(db.get(&txn, b"dropped").unwrap().is_none());
}

#[test]
fn test_commit_versions() {
    let (_dir, env, db) = setup_test_env();
    let start = env.info().last_txnid;

    // Nothing written, nothing published
    let txn = env.begin_rw_txn().unwrap();
    assert_eq!(txn.commit().unwrap(), start);

    let txn = env.begin_rw_txn().unwrap();
    assert_eq!(txn.id(), start + 1);
    db.put(&txn, b"k", b"v", WriteFlags::empty()).unwrap();
    assert_eq!(txn.commit().unwrap(), start + 1);
    assert_eq!(env.info().last_txnid, start + 1);

    let txn = env.begin_ro_txn().unwrap();
    assert_eq!(txn.commit().unwrap(), start + 1);
}

#[test]
fn test_readers_keep_their_snapshot() {
    let (_dir, env, db) = setup_test_env();
    let txn = env.begin_rw_txn().unwrap();
    db.put(&txn, b"k", b"old", WriteFlags::empty()).unwrap();
    txn.commit().unwrap();

    let reader = env.begin_ro_txn().unwrap();
    let txn = env.begin_rw_txn().unwrap();
    db.put(&txn, b"k", b"new", WriteFlags::empty()).unwrap();
    db.put(&txn, b"extra", b"x", WriteFlags::empty()).unwrap();
    // Not visible before commit
    assert_eq!(db.get(&reader, b"k").unwrap().unwrap(), b"old");
    txn.commit().unwrap();

    // Nor after
    assert_eq!(db.get(&reader, b"k").unwrap().unwrap(), b"old");
    assert!(db.get(&reader, b"extra").unwrap().is_none());
    assert_eq!(env.reader_list().len(), 1);
    reader.abort();

    let fresh = env.begin_ro_txn().unwrap();
    assert_eq!(db.get(&fresh, b"k").unwrap().unwrap(), b"new");
}

#[test]
fn test_readers_and_writer_on_threads() {
    let (_dir, env, db) = setup_test_env();
    let txn = env.begin_rw_txn().unwrap();
    for i in 0..100u32 {
        db.put(&txn, &i.to_be_bytes(), b"v1", WriteFlags::empty()).unwrap();
    }
    txn.commit().unwrap();

    let (ready_tx, ready_rx) = mpsc::channel();
    let (go_tx, go_rx) = mpsc::channel::<()>();
    thread::scope(|s| {
        let env = &env;
        let reader = s.spawn(move || {
            let txn = env.begin_ro_txn().unwrap();
            ready_tx.send(()).unwrap();
            go_rx.recv().unwrap();
            let mut cursor = db.cursor(&txn).unwrap();
            let values: Vec<_> = cursor.iter().map(|r| r.unwrap().1).collect();
            assert_eq!(values.len(), 100);
            assert!(values.iter().all(|v| v == b"v1"));
        });

        ready_rx.recv().unwrap();
        let txn = env.begin_rw_txn().unwrap();
        for i in 0..100u32 {
            db.put(&txn, &i.to_be_bytes(), b"v2", WriteFlags::empty()).unwrap();
        }
        txn.commit().unwrap();
        go_tx.send(()).unwrap();
        reader.join().unwrap();
    });

    let txn = env.begin_ro_txn().unwrap();
    assert_eq!(db.get(&txn, &7u32.to_be_bytes()).unwrap().unwrap(), b"v2");
}

#[test]
fn test_writer_timeout() {
    let (_dir, env, _db) = setup_test_env();
    let (held_tx, held_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    thread::scope(|s| {
        let env = &env;
        s.spawn(move || {
            let txn = env.begin_rw_txn().unwrap();
            held_tx.send(()).unwrap();
            release_rx.recv().unwrap();
            txn.abort();
        });

        held_rx.recv().unwrap();
        assert!(matches!(
            env.begin_rw_txn_timeout(Duration::from_millis(50)),
            Err(Error::Timeout)
        ));
        // Readers are never blocked by the writer
        env.begin_ro_txn().unwrap().abort();
        release_tx.send(()).unwrap();
    });

    env.begin_rw_txn_timeout(Duration::from_secs(5)).unwrap().abort();
}

#[test]
fn test_reopen_persists_data() {
    let temp_dir = TempDir::new().unwrap();
    {
        let env = Environment::open(temp_dir.path(), 2, 1 << 20).unwrap();
        let db = env.open_db(Some("named"), DbFlags::CREATE).unwrap();
        let main = env.open_db(None, DbFlags::empty()).unwrap();
        let txn = env.begin_rw_txn().unwrap();
        db.put(&txn, b"inner", b"1", WriteFlags::empty()).unwrap();
        main.put(&txn, b"outer", b"2", WriteFlags::empty()).unwrap();
        txn.commit().unwrap();
        env.close().unwrap();
    }

    let env = Environment::open(temp_dir.path(), 2, 1 << 20).unwrap();
    let db = env.open_db(Some("named"), DbFlags::empty()).unwrap();
    let main = env.open_db(None, DbFlags::empty()).unwrap();
    let txn = env.begin_ro_txn().unwrap();
    assert_eq!(db.get(&txn, b"inner").unwrap().unwrap(), b"1");
    assert_eq!(main.get(&txn, b"outer").unwrap().unwrap(), b"2");
    // The main database also holds the record of "named"
    assert_eq!(main.stat(&txn).unwrap().entries, 2);
    assert!(matches!(main.put(&txn, b"named", b"x", WriteFlags::empty()), Err(Error::TxnReadOnly)));
    txn.abort();

    let txn = env.begin_rw_txn().unwrap();
    assert!(matches!(main.put(&txn, b"named", b"x", WriteFlags::empty()), Err(Error::Incompatible)));
    assert!(matches!(main.del(&txn, b"named", None), Err(Error::Incompatible)));
}

#[test]
fn test_freed_pages_are_reused() {
    let (_dir, env, db) = setup_test_env();
    let value = [1u8; 1000];

    let rewrite = |round: u8| {
        let txn = env.begin_rw_txn().unwrap();
        for i in 0..50u32 {
            db.put(&txn, &i.to_be_bytes(), &[round; 1000], WriteFlags::empty()).unwrap();
        }
        txn.commit().unwrap();
    };

    let txn = env.begin_rw_txn().unwrap();
    for i in 0..50u32 {
        db.put(&txn, &i.to_be_bytes(), &value, WriteFlags::empty()).unwrap();
    }
    txn.commit().unwrap();
    rewrite(2);
    let settled = env.info().last_pgno;

    for round in 3..20 {
        rewrite(round);
    }
    // Without reuse every round would add a full copy of the tree
    assert!(env.info().last_pgno < settled + 20);

    // A reader pins the pages of its snapshot
    let reader = env.begin_ro_txn().unwrap();
    let pinned = env.info().last_pgno;
    rewrite(30);
    rewrite(31);
    assert!(env.info().last_pgno > pinned);
    assert_eq!(db.get(&reader, &0u32.to_be_bytes()).unwrap().unwrap(), vec![19u8; 1000]);
}

#[test]
fn test_map_full_keeps_staged_state() {
    let temp_dir = TempDir::new().unwrap();
    let env = Environment::open(temp_dir.path(), 0, 64 * 4096).unwrap();
    let db = env.open_db(None, DbFlags::empty()).unwrap();
    let big = vec![9u8; 10_000];

    let txn = env.begin_rw_txn().unwrap();
    let mut stored = 0u32;
    let err = loop {
        match db.put(&txn, &stored.to_be_bytes(), &big, WriteFlags::empty()) {
            Ok(()) => stored += 1,
            Err(e) => break e,
        }
    };
    assert!(matches!(err, Error::MapFull));
    assert!(err.is_capacity());
    assert!(stored > 0);
    assert_eq!(db.stat(&txn).unwrap().entries, u64::from(stored));
    assert!(db.get(&txn, &stored.to_be_bytes()).unwrap().is_none());

    // The transaction is still usable and commits what it staged
    assert_eq!(db.get(&txn, &0u32.to_be_bytes()).unwrap().unwrap(), big);
    txn.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    assert_eq!(db.stat(&txn).unwrap().entries, u64::from(stored));
}

#[test]
fn test_read_only_environment() {
    let temp_dir = TempDir::new().unwrap();
    {
        let env = Environment::open(temp_dir.path(), 0, 1 << 20).unwrap();
        let db = env.open_db(None, DbFlags::empty()).unwrap();
        let txn = env.begin_rw_txn().unwrap();
        db.put(&txn, b"k", b"v", WriteFlags::empty()).unwrap();
        txn.commit().unwrap();
    }

    let env = Environment::builder()
        .set_flags(EnvFlags::RDONLY)
        .open(temp_dir.path())
        .unwrap();
    assert!(matches!(env.begin_rw_txn(), Err(Error::EnvReadOnly)));
    let db = env.open_db(None, DbFlags::empty()).unwrap();
    let txn = env.begin_ro_txn().unwrap();
    assert_eq!(db.get(&txn, b"k").unwrap().unwrap(), b"v");
}

#[test]
fn test_readers_full() {
    let temp_dir = TempDir::new().unwrap();
    let env = Environment::builder().set_max_readers(2).open(temp_dir.path()).unwrap();
    let a = env.begin_ro_txn().unwrap();
    let _b = env.begin_ro_txn().unwrap();
    let err = env.begin_ro_txn().unwrap_err();
    assert!(matches!(err, Error::ReadersFull));
    assert!(err.is_capacity());
    a.abort();
    env.begin_ro_txn().unwrap();
}

#[test]
fn test_nosync_flags_toggle() {
    let (_dir, env, db) = setup_test_env();
    env.set_flags(EnvFlags::NOSYNC, true).unwrap();
    assert!(env.flags().contains(EnvFlags::NOSYNC));
    assert!(matches!(env.set_flags(EnvFlags::RDONLY, true), Err(Error::EnvInvalidConfig(_))));

    let txn = env.begin_rw_txn().unwrap();
    db.put(&txn, b"k", b"v", WriteFlags::empty()).unwrap();
    txn.commit().unwrap();
    env.sync(true).unwrap();

    env.set_flags(EnvFlags::NOSYNC, false).unwrap();
    assert!(!env.flags().contains(EnvFlags::NOSYNC));
}
