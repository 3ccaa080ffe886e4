mod common;

use burrow_db::{
    CursorFlags, DbFlags, DbParams, EnvFlags, EnvParams, Environment, Error, FindFlags,
    InsertFlags, Match,
};
use common::*;

#[test]
fn full_scan_is_ordered_both_ways() {
    let dir = setup();
    let (env, db) = create_simple(&dir);
    let count = 1000u32;
    for i in (0..count).rev() {
        db.insert(None, &int_key(i), &i.to_le_bytes(), InsertFlags::empty())
            .unwrap();
    }

    let mut cursor = db.cursor(None).unwrap();
    cursor.move_to(CursorFlags::FIRST).unwrap();
    let mut previous = cursor.key().unwrap();
    for _ in 1..count {
        cursor.move_to(CursorFlags::NEXT).unwrap();
        let key = cursor.key().unwrap();
        assert!(previous < key, "keys must ascend");
        previous = key;
    }
    assert!(matches!(cursor.move_to(CursorFlags::NEXT), Err(Error::KeyNotFound)));

    cursor.move_to(CursorFlags::LAST).unwrap();
    let mut previous = cursor.key().unwrap();
    for _ in 1..count {
        cursor.move_to(CursorFlags::PREVIOUS).unwrap();
        let key = cursor.key().unwrap();
        assert!(previous > key, "keys must descend");
        previous = key;
    }
    assert!(matches!(
        cursor.move_to(CursorFlags::PREVIOUS),
        Err(Error::KeyNotFound)
    ));
    cursor.close();
    db.close().unwrap();
    env.close().unwrap();
}

#[test]
fn approximate_matches() {
    let dir = setup();
    let (env, db) = create_simple(&dir);
    db.insert(None, &[2u8], b"two", InsertFlags::empty()).unwrap();
    db.insert(None, &[4u8], b"four", InsertFlags::empty()).unwrap();

    let (key, record, sign) = db.find_record(None, &[3u8], FindFlags::LEQ_MATCH).unwrap();
    assert_eq!(key, [2u8]);
    assert_eq!(record, b"two");
    assert_eq!(sign, Match::Less);

    let (key, record, sign) = db.find_record(None, &[3u8], FindFlags::GEQ_MATCH).unwrap();
    assert_eq!(key, [4u8]);
    assert_eq!(record, b"four");
    assert_eq!(sign, Match::Greater);

    assert!(matches!(
        db.find_record(None, &[5u8], FindFlags::GEQ_MATCH),
        Err(Error::KeyNotFound)
    ));

    let (key, _, sign) = db.find_record(None, &[5u8], FindFlags::LEQ_MATCH).unwrap();
    assert_eq!(key, [4u8]);
    assert_eq!(sign, Match::Less);

    // an exact hit wins whenever the key is present
    let (key, _, sign) = db.find_record(None, &[2u8], FindFlags::NEAR_MATCH).unwrap();
    assert_eq!(key, [2u8]);
    assert_eq!(sign, Match::Exact);

    // the cursor flavour couples to the promoted key
    let mut cursor = db.cursor(None).unwrap();
    let (key, sign) = cursor.find(&[3u8], FindFlags::GEQ_MATCH).unwrap();
    assert_eq!(key, [4u8]);
    assert_eq!(sign, Match::Greater);
    assert_eq!(cursor.record().unwrap(), b"four");
    cursor.close();
    db.close().unwrap();
    env.close().unwrap();
}

#[test]
fn duplicates_keep_insertion_order() {
    let dir = setup();
    let env = Environment::create(db_path(&dir), EnvFlags::empty(), &EnvParams::default())
        .unwrap();
    let db = env
        .create_db(1, DbFlags::ENABLE_DUPLICATE_KEYS, &DbParams::default())
        .unwrap();

    for record in [b"a", b"b", b"c", b"d", b"e"] {
        db.insert(None, b"k", record, InsertFlags::DUPLICATE).unwrap();
    }

    let mut cursor = db.cursor(None).unwrap();
    cursor.find(b"k", FindFlags::empty()).unwrap();
    assert_eq!(cursor.duplicate_count().unwrap(), 5);

    let mut seen = Vec::new();
    seen.push(cursor.record().unwrap());
    for _ in 0..4 {
        cursor.move_to(CursorFlags::NEXT).unwrap();
        seen.push(cursor.record().unwrap());
    }
    assert_eq!(seen, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec(), b"e".to_vec()]);

    // erasing through the cursor removes exactly the current duplicate
    cursor.find(b"k", FindFlags::empty()).unwrap();
    cursor.erase().unwrap();
    assert!(cursor.is_nil());

    cursor.find(b"k", FindFlags::empty()).unwrap();
    assert_eq!(cursor.duplicate_count().unwrap(), 4);
    assert_eq!(cursor.record().unwrap(), b"b");
    cursor.close();

    assert_eq!(db.key_count(None, false).unwrap(), 4);
    assert_eq!(db.key_count(None, true).unwrap(), 1);
    db.close().unwrap();
    env.close().unwrap();
}

#[test]
fn duplicate_positioning_flags() {
    let dir = setup();
    let env = Environment::create(db_path(&dir), EnvFlags::empty(), &EnvParams::default())
        .unwrap();
    let db = env
        .create_db(1, DbFlags::ENABLE_DUPLICATE_KEYS, &DbParams::default())
        .unwrap();

    db.insert(None, b"k", b"middle", InsertFlags::DUPLICATE).unwrap();
    db.insert(None, b"k", b"first", InsertFlags::DUPLICATE_INSERT_FIRST)
        .unwrap();
    db.insert(None, b"k", b"last", InsertFlags::DUPLICATE_INSERT_LAST)
        .unwrap();

    let mut cursor = db.cursor(None).unwrap();
    cursor.find(b"k", FindFlags::empty()).unwrap();
    assert_eq!(cursor.record().unwrap(), b"first");
    cursor.move_to(CursorFlags::NEXT).unwrap();
    assert_eq!(cursor.record().unwrap(), b"middle");
    cursor.move_to(CursorFlags::NEXT).unwrap();
    assert_eq!(cursor.record().unwrap(), b"last");

    // BEFORE/AFTER are relative to the cursor's duplicate
    cursor.move_to(CursorFlags::PREVIOUS).unwrap();
    cursor
        .insert(b"k", b"wedge", InsertFlags::DUPLICATE_INSERT_AFTER)
        .unwrap();
    assert_eq!(cursor.record().unwrap(), b"wedge");
    cursor.move_to(CursorFlags::NEXT).unwrap();
    assert_eq!(cursor.record().unwrap(), b"last");
    cursor.close();
    db.close().unwrap();
    env.close().unwrap();
}

#[test]
fn skip_and_only_duplicates() {
    let dir = setup();
    let env = Environment::create(db_path(&dir), EnvFlags::empty(), &EnvParams::default())
        .unwrap();
    let db = env
        .create_db(1, DbFlags::ENABLE_DUPLICATE_KEYS, &DbParams::default())
        .unwrap();

    db.insert(None, b"a", b"a1", InsertFlags::DUPLICATE).unwrap();
    db.insert(None, b"a", b"a2", InsertFlags::DUPLICATE).unwrap();
    db.insert(None, b"b", b"b1", InsertFlags::DUPLICATE).unwrap();

    let mut cursor = db.cursor(None).unwrap();
    cursor.move_to(CursorFlags::FIRST).unwrap();
    cursor
        .move_to(CursorFlags::NEXT | CursorFlags::SKIP_DUPLICATES)
        .unwrap();
    assert_eq!(cursor.key().unwrap(), b"b");

    cursor.find(b"a", FindFlags::empty()).unwrap();
    cursor
        .move_to(CursorFlags::NEXT | CursorFlags::ONLY_DUPLICATES)
        .unwrap();
    assert_eq!(cursor.record().unwrap(), b"a2");
    assert!(matches!(
        cursor.move_to(CursorFlags::NEXT | CursorFlags::ONLY_DUPLICATES),
        Err(Error::KeyNotFound)
    ));
    cursor.close();
    db.close().unwrap();
    env.close().unwrap();
}

#[test]
fn cursor_overwrite_replaces_in_place() {
    let dir = setup();
    let (env, db) = create_simple(&dir);
    db.insert(None, b"k", b"old", InsertFlags::empty()).unwrap();

    let mut cursor = db.cursor(None).unwrap();
    cursor.find(b"k", FindFlags::empty()).unwrap();
    cursor.overwrite(b"new").unwrap();
    assert_eq!(cursor.record().unwrap(), b"new");
    assert_eq!(db.find(None, b"k").unwrap(), b"new");
    cursor.close();
    db.close().unwrap();
    env.close().unwrap();
}

#[test]
fn cloned_cursor_keeps_its_own_position() {
    let dir = setup();
    let (env, db) = create_simple(&dir);
    for i in 0..10u32 {
        db.insert(None, &int_key(i), b"v", InsertFlags::empty()).unwrap();
    }
    let mut cursor = db.cursor(None).unwrap();
    cursor.move_to(CursorFlags::FIRST).unwrap();
    let mut clone = cursor.clone_cursor();
    clone.move_to(CursorFlags::NEXT).unwrap();
    assert_eq!(cursor.key().unwrap(), int_key(0));
    assert_eq!(clone.key().unwrap(), int_key(1));
    cursor.close();
    clone.close();
    db.close().unwrap();
    env.close().unwrap();
}

#[test]
fn nil_cursor_reports_its_state() {
    let dir = setup();
    let (env, db) = create_simple(&dir);
    db.insert(None, b"k", b"v", InsertFlags::empty()).unwrap();

    let mut cursor = db.cursor(None).unwrap();
    assert!(cursor.is_nil());
    assert!(matches!(cursor.key(), Err(Error::CursorIsNil)));
    assert!(matches!(cursor.move_to(CursorFlags::NEXT), Err(Error::CursorIsNil)));

    cursor.find(b"k", FindFlags::empty()).unwrap();
    assert!(!cursor.is_nil());
    // going nil is always safe, also twice
    cursor.set_nil();
    cursor.set_nil();
    assert!(cursor.is_nil());
    cursor.close();
    db.close().unwrap();
    env.close().unwrap();
}

#[test]
fn close_refuses_open_cursors() {
    let dir = setup();
    let (env, db) = create_simple(&dir);
    db.insert(None, b"k", b"v", InsertFlags::empty()).unwrap();

    let cursor = db.cursor(None).unwrap();
    assert!(matches!(db.close(), Err(Error::CursorStillOpen)));
    cursor.close();
    db.close().unwrap();
    env.close().unwrap();
}
