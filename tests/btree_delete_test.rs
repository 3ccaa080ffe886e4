mod common;

use burrow_db::{EnvFlags, Error, InsertFlags};
use common::*;
use log::info;
use rand::prelude::*;

#[test]
fn erase_single_keys() {
    let dir = setup();
    let (env, db) = create_simple(&dir);
    db.insert(None, b"a", b"1", InsertFlags::empty()).unwrap();
    db.insert(None, b"b", b"2", InsertFlags::empty()).unwrap();

    db.erase(None, b"a").unwrap();
    assert!(matches!(db.find(None, b"a"), Err(Error::KeyNotFound)));
    assert_eq!(db.find(None, b"b").unwrap(), b"2");
    assert!(matches!(db.erase(None, b"a"), Err(Error::KeyNotFound)));
    assert_eq!(db.key_count(None, false).unwrap(), 1);
    db.close().unwrap();
    env.close().unwrap();
}

#[test]
fn erase_everything_leaves_an_empty_tree() {
    let dir = setup();
    let (env, db) = create_simple(&dir);

    let mut rng = rand::thread_rng();
    let mut keys: Vec<u32> = (0..4000).collect();
    keys.shuffle(&mut rng);
    for k in &keys {
        db.insert(None, &int_key(*k), &k.to_le_bytes(), InsertFlags::empty())
            .unwrap();
    }
    db.check_integrity().unwrap();

    keys.shuffle(&mut rng);
    for k in &keys {
        db.erase(None, &int_key(*k)).unwrap();
    }
    info!("all {} keys erased", keys.len());
    assert_eq!(db.key_count(None, false).unwrap(), 0);
    db.check_integrity().unwrap();

    let mut cursor = db.cursor(None).unwrap();
    assert!(matches!(
        cursor.move_to(burrow_db::CursorFlags::FIRST),
        Err(Error::KeyNotFound)
    ));
    cursor.close();

    // the empty tree accepts new keys again
    for k in 0..100u32 {
        db.insert(None, &int_key(k), b"back", InsertFlags::empty()).unwrap();
    }
    db.check_integrity().unwrap();
    assert_eq!(db.key_count(None, false).unwrap(), 100);
    db.close().unwrap();
    env.close().unwrap();
}

#[test]
fn interleaved_insert_and_erase() {
    let dir = setup();
    let (env, db) = create_simple(&dir);

    for round in 0..5u32 {
        for i in 0..1000u32 {
            db.insert(
                None,
                &int_key(round * 1000 + i),
                &round.to_le_bytes(),
                InsertFlags::empty(),
            )
            .unwrap();
        }
        // erase every second key of the round
        for i in (0..1000u32).step_by(2) {
            db.erase(None, &int_key(round * 1000 + i)).unwrap();
        }
        db.check_integrity().unwrap();
    }
    assert_eq!(db.key_count(None, false).unwrap(), 5 * 500);
    db.close().unwrap();
    env.close().unwrap();
}

#[test]
fn erased_state_survives_reopen() {
    let dir = setup();
    {
        let (env, db) = create_simple(&dir);
        for i in 0..500u32 {
            db.insert(None, &int_key(i), b"v", InsertFlags::empty()).unwrap();
        }
        for i in 100..200u32 {
            db.erase(None, &int_key(i)).unwrap();
        }
        db.close().unwrap();
        env.close().unwrap();
    }

    let (env, db) = open_simple(&dir, EnvFlags::empty());
    assert_eq!(db.key_count(None, false).unwrap(), 400);
    assert!(matches!(db.find(None, &int_key(150)), Err(Error::KeyNotFound)));
    assert_eq!(db.find(None, &int_key(99)).unwrap(), b"v");
    db.check_integrity().unwrap();
    db.close().unwrap();
    env.close().unwrap();
}
