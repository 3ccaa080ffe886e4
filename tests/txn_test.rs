mod common;

use burrow_db::{
    CursorFlags, DbFlags, DbParams, EnvFlags, EnvParams, Environment, Error, FindFlags,
    InsertFlags, TxnFlags,
};
use common::*;

fn txn_env(dir: &tempfile::TempDir) -> Environment {
    Environment::create(
        db_path(dir),
        EnvFlags::ENABLE_TRANSACTIONS,
        &EnvParams::default(),
    )
    .unwrap()
}

#[test]
fn txn_begin_requires_the_flag() {
    let dir = setup();
    let env = Environment::create(db_path(&dir), EnvFlags::empty(), &EnvParams::default())
        .unwrap();
    assert!(matches!(
        env.txn_begin(TxnFlags::empty()),
        Err(Error::InvalidParameter)
    ));
    env.close().unwrap();
}

#[test]
fn committed_ops_become_visible() {
    let dir = setup();
    let env = txn_env(&dir);
    let db = env.create_db(1, DbFlags::empty(), &DbParams::default()).unwrap();

    let txn = env.txn_begin(TxnFlags::empty()).unwrap();
    db.insert(Some(&txn), b"a", b"1", InsertFlags::empty()).unwrap();
    db.insert(Some(&txn), b"b", b"2", InsertFlags::empty()).unwrap();

    // the uncommitted view is private to the transaction
    assert_eq!(db.find(Some(&txn), b"a").unwrap(), b"1");
    assert!(matches!(db.find(None, b"a"), Err(Error::TxnConflict)));
    assert!(matches!(db.find(None, b"c"), Err(Error::KeyNotFound)));

    env.txn_commit(txn).unwrap();
    assert_eq!(db.find(None, b"a").unwrap(), b"1");
    assert_eq!(db.find(None, b"b").unwrap(), b"2");
    assert_eq!(db.key_count(None, false).unwrap(), 2);
    db.close().unwrap();
    env.close().unwrap();
}

#[test]
fn aborted_ops_disappear() {
    let dir = setup();
    let env = txn_env(&dir);
    let db = env.create_db(1, DbFlags::empty(), &DbParams::default()).unwrap();
    db.insert(None, b"keep", b"v", InsertFlags::empty()).unwrap();

    let txn = env.txn_begin(TxnFlags::empty()).unwrap();
    db.insert(Some(&txn), b"gone", b"x", InsertFlags::empty()).unwrap();
    db.erase(Some(&txn), b"keep").unwrap();
    assert!(matches!(db.find(Some(&txn), b"keep"), Err(Error::KeyNotFound)));

    env.txn_abort(txn).unwrap();
    assert_eq!(db.find(None, b"keep").unwrap(), b"v");
    assert!(matches!(db.find(None, b"gone"), Err(Error::KeyNotFound)));
    db.close().unwrap();
    env.close().unwrap();
}

#[test]
fn conflicting_writers_are_rejected() {
    let dir = setup();
    let env = txn_env(&dir);
    let db = env.create_db(1, DbFlags::empty(), &DbParams::default()).unwrap();

    let txn1 = env.txn_begin(TxnFlags::empty()).unwrap();
    let txn2 = env.txn_begin(TxnFlags::empty()).unwrap();

    db.insert(Some(&txn1), b"k", b"1", InsertFlags::empty()).unwrap();
    assert!(matches!(
        db.insert(Some(&txn2), b"k", b"2", InsertFlags::empty()),
        Err(Error::TxnConflict)
    ));
    // non-transactional writers hit the same claim
    assert!(matches!(
        db.insert(None, b"k", b"3", InsertFlags::empty()),
        Err(Error::TxnConflict)
    ));

    env.txn_commit(txn1).unwrap();
    // the claim is gone; the key now exists
    assert!(matches!(
        db.insert(Some(&txn2), b"k", b"2", InsertFlags::empty()),
        Err(Error::DuplicateKey)
    ));
    env.txn_abort(txn2).unwrap();
    assert_eq!(db.find(None, b"k").unwrap(), b"1");
    db.close().unwrap();
    env.close().unwrap();
}

#[test]
fn read_only_txn_refuses_writes() {
    let dir = setup();
    let env = txn_env(&dir);
    let db = env.create_db(1, DbFlags::empty(), &DbParams::default()).unwrap();
    db.insert(None, b"k", b"v", InsertFlags::empty()).unwrap();

    let txn = env.txn_begin(TxnFlags::READ_ONLY).unwrap();
    assert_eq!(db.find(Some(&txn), b"k").unwrap(), b"v");
    assert!(matches!(
        db.insert(Some(&txn), b"x", b"y", InsertFlags::empty()),
        Err(Error::InvalidParameter)
    ));
    env.txn_abort(txn).unwrap();
    db.close().unwrap();
    env.close().unwrap();
}

#[test]
fn cursor_merges_the_transaction_view() {
    let dir = setup();
    let env = txn_env(&dir);
    let db = env.create_db(1, DbFlags::empty(), &DbParams::default()).unwrap();
    db.insert(None, b"a", b"btree", InsertFlags::empty()).unwrap();
    db.insert(None, b"c", b"btree", InsertFlags::empty()).unwrap();

    let txn = env.txn_begin(TxnFlags::empty()).unwrap();
    db.insert(Some(&txn), b"b", b"txn", InsertFlags::empty()).unwrap();
    db.erase(Some(&txn), b"c").unwrap();

    let mut cursor = db.cursor(Some(&txn)).unwrap();
    cursor.move_to(CursorFlags::FIRST).unwrap();
    assert_eq!(cursor.key().unwrap(), b"a");
    assert_eq!(cursor.record().unwrap(), b"btree");
    cursor.move_to(CursorFlags::NEXT).unwrap();
    assert_eq!(cursor.key().unwrap(), b"b");
    assert_eq!(cursor.record().unwrap(), b"txn");
    // "c" is erased in the transaction and must be skipped
    assert!(matches!(cursor.move_to(CursorFlags::NEXT), Err(Error::KeyNotFound)));

    cursor.move_to(CursorFlags::LAST).unwrap();
    assert_eq!(cursor.key().unwrap(), b"b");
    cursor.close();

    assert_eq!(db.key_count(Some(&txn), false).unwrap(), 2);
    env.txn_commit(txn).unwrap();
    assert_eq!(db.key_count(None, false).unwrap(), 2);
    db.close().unwrap();
    env.close().unwrap();
}

#[test]
fn overwrite_inside_a_transaction() {
    let dir = setup();
    let env = txn_env(&dir);
    let db = env.create_db(1, DbFlags::empty(), &DbParams::default()).unwrap();
    db.insert(None, b"k", b"old", InsertFlags::empty()).unwrap();

    let txn = env.txn_begin(TxnFlags::empty()).unwrap();
    db.insert(Some(&txn), b"k", b"new", InsertFlags::OVERWRITE).unwrap();
    assert_eq!(db.find(Some(&txn), b"k").unwrap(), b"new");

    env.txn_commit(txn).unwrap();
    assert_eq!(db.find(None, b"k").unwrap(), b"new");
    db.close().unwrap();
    env.close().unwrap();
}

#[test]
fn duplicates_through_a_transaction() {
    let dir = setup();
    let env = txn_env(&dir);
    let db = env
        .create_db(1, DbFlags::ENABLE_DUPLICATE_KEYS, &DbParams::default())
        .unwrap();
    db.insert(None, b"k", b"one", InsertFlags::DUPLICATE).unwrap();

    let txn = env.txn_begin(TxnFlags::empty()).unwrap();
    db.insert(Some(&txn), b"k", b"two", InsertFlags::DUPLICATE).unwrap();

    let mut cursor = db.cursor(Some(&txn)).unwrap();
    cursor.find(b"k", FindFlags::empty()).unwrap();
    // the merged duplicate cache shows both sides in order
    assert_eq!(cursor.duplicate_count().unwrap(), 2);
    assert_eq!(cursor.record().unwrap(), b"one");
    cursor.move_to(CursorFlags::NEXT).unwrap();
    assert_eq!(cursor.record().unwrap(), b"two");
    cursor.close();

    env.txn_commit(txn).unwrap();
    let mut cursor = db.cursor(None).unwrap();
    cursor.find(b"k", FindFlags::empty()).unwrap();
    assert_eq!(cursor.duplicate_count().unwrap(), 2);
    cursor.close();
    db.close().unwrap();
    env.close().unwrap();
}
