mod common;

use burrow_db::{DbFlags, DbParams, EnvFlags, EnvParams, Environment, Error, InsertFlags};
use common::*;
use log::info;
use rand::prelude::*;

#[test]
fn ascending_inserts_survive_reopen() {
    let dir = setup();
    let count = 10_000u32;
    {
        let (env, db) = create_simple(&dir);
        info!("start insert, count: {}", count);
        for i in 0..count {
            db.insert(None, &int_key(i), &i.to_be_bytes(), InsertFlags::empty())
                .unwrap();
        }
        assert_eq!(db.key_count(None, false).unwrap(), count as u64);
        db.check_integrity().unwrap();
        db.close().unwrap();
        env.close().unwrap();
    }

    let (env, db) = open_simple(&dir, EnvFlags::empty());
    assert_eq!(db.key_count(None, false).unwrap(), count as u64);

    let mut cursor = db.cursor(None).unwrap();
    cursor
        .move_to(burrow_db::CursorFlags::FIRST)
        .unwrap();
    for i in 0..count {
        assert_eq!(cursor.key().unwrap(), int_key(i));
        assert_eq!(cursor.record().unwrap(), i.to_be_bytes());
        if i + 1 < count {
            cursor.move_to(burrow_db::CursorFlags::NEXT).unwrap();
        }
    }
    assert!(matches!(
        cursor.move_to(burrow_db::CursorFlags::NEXT),
        Err(Error::KeyNotFound)
    ));
    cursor.close();
    db.close().unwrap();
    env.close().unwrap();
}

#[test]
fn random_inserts_keep_the_tree_intact() {
    let dir = setup();
    let (env, db) = create_simple(&dir);

    let mut rng = rand::thread_rng();
    let mut keys: Vec<u32> = (0..5000).collect();
    keys.shuffle(&mut rng);

    for k in &keys {
        db.insert(None, &int_key(*k), &k.to_le_bytes(), InsertFlags::empty())
            .unwrap();
    }
    db.check_integrity().unwrap();
    assert_eq!(db.key_count(None, false).unwrap(), keys.len() as u64);

    for k in &keys {
        assert_eq!(db.find(None, &int_key(*k)).unwrap(), k.to_le_bytes());
    }
    db.close().unwrap();
    env.close().unwrap();
}

#[test]
fn duplicate_key_without_overwrite_fails() {
    let dir = setup();
    let (env, db) = create_simple(&dir);
    db.insert(None, b"k", b"one", InsertFlags::empty()).unwrap();
    assert!(matches!(
        db.insert(None, b"k", b"two", InsertFlags::empty()),
        Err(Error::DuplicateKey)
    ));
    // the original record is untouched
    assert_eq!(db.find(None, b"k").unwrap(), b"one");

    db.insert(None, b"k", b"two", InsertFlags::OVERWRITE).unwrap();
    assert_eq!(db.find(None, b"k").unwrap(), b"two");
    db.close().unwrap();
    env.close().unwrap();
}

#[test]
fn overwrite_shrinks_and_grows_records() {
    let dir = setup();
    let (env, db) = create_simple(&dir);
    db.insert(None, b"k", &[0xaa; 500], InsertFlags::empty()).unwrap();
    db.insert(None, b"k", b"tiny", InsertFlags::OVERWRITE).unwrap();
    assert_eq!(db.find(None, b"k").unwrap(), b"tiny");
    db.insert(None, b"k", &[0xbb; 9000], InsertFlags::OVERWRITE).unwrap();
    assert_eq!(db.find(None, b"k").unwrap(), vec![0xbb; 9000]);
    db.close().unwrap();
    env.close().unwrap();
}

#[test]
fn extended_keys_round_trip() {
    let dir = setup();
    let (env, db) = create_simple(&dir);

    // inline width is 32 bytes; these spill their tails into blobs
    let mut long_keys = Vec::new();
    for i in 0..200u32 {
        let mut key = vec![b'p'; 60];
        key.extend_from_slice(&int_key(i));
        long_keys.push(key);
    }
    for (i, key) in long_keys.iter().enumerate() {
        db.insert(None, key, &(i as u32).to_le_bytes(), InsertFlags::empty())
            .unwrap();
    }
    db.check_integrity().unwrap();
    for (i, key) in long_keys.iter().enumerate() {
        assert_eq!(db.find(None, key).unwrap(), (i as u32).to_le_bytes());
    }
    db.close().unwrap();
    env.close().unwrap();

    // the tails live in blobs and must survive a reopen
    let (env, db) = open_simple(&dir, EnvFlags::empty());
    for (i, key) in long_keys.iter().enumerate() {
        assert_eq!(db.find(None, key).unwrap(), (i as u32).to_le_bytes());
    }
    db.erase(None, &long_keys[17]).unwrap();
    assert!(matches!(db.find(None, &long_keys[17]), Err(Error::KeyNotFound)));
    db.check_integrity().unwrap();
    db.close().unwrap();
    env.close().unwrap();
}

#[test]
fn fixed_key_size_is_enforced() {
    let dir = setup();
    let env = Environment::create(db_path(&dir), EnvFlags::empty(), &EnvParams::default())
        .unwrap();
    let params = DbParams {
        key_size: 16,
        ..DbParams::default()
    };
    let db = env.create_db(1, DbFlags::empty(), &params).unwrap();

    db.insert(None, &[7u8; 16], b"v", InsertFlags::empty()).unwrap();
    assert!(matches!(
        db.insert(None, b"short", b"v", InsertFlags::empty()),
        Err(Error::InvKeySize)
    ));
    assert!(matches!(
        db.insert(None, &[7u8; 17], b"v", InsertFlags::empty()),
        Err(Error::InvKeySize)
    ));
    db.close().unwrap();
    env.close().unwrap();
}

#[test]
fn huge_fixed_keys_are_rejected_at_create() {
    let dir = setup();
    let params = EnvParams {
        page_size: 1024,
        ..EnvParams::default()
    };
    let env = Environment::create(db_path(&dir), EnvFlags::empty(), &params).unwrap();
    // two slots of this size cannot fit into a 1 KiB page
    let params = DbParams {
        key_size: 600,
        ..DbParams::default()
    };
    let result = env.create_db(1, DbFlags::empty(), &params);
    assert!(matches!(result, Err(Error::InvKeySize)));
    env.close().unwrap();
}

#[test]
fn fixed_record_size_is_enforced() {
    let dir = setup();
    let env = Environment::create(db_path(&dir), EnvFlags::empty(), &EnvParams::default())
        .unwrap();
    let params = DbParams {
        record_size: 4,
        ..DbParams::default()
    };
    let db = env.create_db(1, DbFlags::empty(), &params).unwrap();
    db.insert(None, b"k", b"1234", InsertFlags::empty()).unwrap();
    assert!(matches!(
        db.insert(None, b"x", b"12345", InsertFlags::empty()),
        Err(Error::InvalidParameter)
    ));
    db.close().unwrap();
    env.close().unwrap();

    // the fixed record size is persisted in the descriptor
    let (env, db) = open_simple(&dir, EnvFlags::empty());
    assert!(matches!(
        db.insert(None, b"x", b"123", InsertFlags::empty()),
        Err(Error::InvalidParameter)
    ));
    db.close().unwrap();
    env.close().unwrap();
}

#[test]
fn record_number_database_allocates_ids() {
    let dir = setup();
    let env = Environment::create(db_path(&dir), EnvFlags::empty(), &EnvParams::default())
        .unwrap();
    let db = env
        .create_db(1, DbFlags::RECORD_NUMBER, &DbParams::default())
        .unwrap();

    for i in 0..100u64 {
        let id = db.insert_recno(None, &i.to_le_bytes(), InsertFlags::empty()).unwrap();
        assert_eq!(id, i + 1);
    }
    assert_eq!(db.find(None, &5u64.to_be_bytes()).unwrap(), 4u64.to_le_bytes());
    db.close().unwrap();
    env.close().unwrap();

    // the id counter continues after a reopen
    let env = Environment::open(db_path(&dir), EnvFlags::empty(), &EnvParams::default())
        .unwrap();
    let db = env.open_db(1, DbFlags::empty()).unwrap();
    let id = db.insert_recno(None, b"more", InsertFlags::empty()).unwrap();
    assert_eq!(id, 101);
    db.close().unwrap();
    env.close().unwrap();
}

#[test]
fn append_hint_inserts_at_the_upper_end() {
    let dir = setup();
    let (env, db) = create_simple(&dir);
    for i in 0..2000u32 {
        db.insert(None, &int_key(i), b"v", InsertFlags::HINT_APPEND).unwrap();
    }
    db.check_integrity().unwrap();
    assert_eq!(db.key_count(None, false).unwrap(), 2000);
    // a hint that does not hold falls back to a regular insert
    db.insert(None, &int_key(0), b"w", InsertFlags::HINT_APPEND | InsertFlags::OVERWRITE)
        .unwrap();
    assert_eq!(db.find(None, &int_key(0)).unwrap(), b"w");
    db.close().unwrap();
    env.close().unwrap();
}
