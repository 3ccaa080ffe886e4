mod common;

use burrow_db::{
    DbFlags, DbParams, EnvFlags, EnvParams, Environment, Error, InsertFlags,
};
use common::*;
use log::info;

#[test]
fn create_close_reopen() {
    let dir = setup();
    {
        let (env, db) = create_simple(&dir);
        db.insert(None, b"alpha", b"1", InsertFlags::empty()).unwrap();
        db.insert(None, b"beta", b"2", InsertFlags::empty()).unwrap();
        db.close().unwrap();
        env.close().unwrap();
    }

    let (env, db) = open_simple(&dir, EnvFlags::empty());
    assert_eq!(db.find(None, b"alpha").unwrap(), b"1");
    assert_eq!(db.find(None, b"beta").unwrap(), b"2");
    assert_eq!(db.key_count(None, false).unwrap(), 2);
    db.close().unwrap();
    env.close().unwrap();
}

#[test]
fn open_rejects_bad_magic() {
    let dir = setup();
    let path = db_path(&dir);
    std::fs::write(&path, vec![0x42u8; 4096]).unwrap();

    let result = Environment::open(&path, EnvFlags::empty(), &EnvParams::default());
    assert!(matches!(result, Err(Error::InvFileHeader)));
    // no side effects: the file is untouched
    assert_eq!(std::fs::read(&path).unwrap(), vec![0x42u8; 4096]);
}

#[test]
fn create_rejects_small_page_size() {
    let dir = setup();
    let params = EnvParams {
        page_size: 512,
        ..EnvParams::default()
    };
    let result = Environment::create(db_path(&dir), EnvFlags::empty(), &params);
    assert!(matches!(result, Err(Error::InvPageSize)));
}

#[test]
fn create_rejects_odd_page_size() {
    let dir = setup();
    let params = EnvParams {
        page_size: 3000,
        ..EnvParams::default()
    };
    let result = Environment::create(db_path(&dir), EnvFlags::empty(), &params);
    assert!(matches!(result, Err(Error::InvPageSize)));
}

#[test]
fn page_size_is_persisted() {
    let dir = setup();
    let params = EnvParams {
        page_size: 1024,
        ..EnvParams::default()
    };
    {
        let env = Environment::create(db_path(&dir), EnvFlags::empty(), &params).unwrap();
        let db = env.create_db(1, DbFlags::empty(), &DbParams::default()).unwrap();
        db.insert(None, b"k", b"v", InsertFlags::empty()).unwrap();
        db.close().unwrap();
        env.close().unwrap();
    }
    // the persisted 1 KiB page size wins over the caller's default
    let (env, db) = open_simple(&dir, EnvFlags::empty());
    assert_eq!(db.find(None, b"k").unwrap(), b"v");
    db.close().unwrap();
    env.close().unwrap();
}

#[test]
fn database_names_and_rename() {
    let dir = setup();
    let env = Environment::create(db_path(&dir), EnvFlags::empty(), &EnvParams::default())
        .unwrap();
    env.create_db(3, DbFlags::empty(), &DbParams::default())
        .unwrap()
        .close()
        .unwrap();
    env.create_db(7, DbFlags::empty(), &DbParams::default())
        .unwrap()
        .close()
        .unwrap();

    let mut names = env.database_names();
    names.sort_unstable();
    assert_eq!(names, vec![3, 7]);

    // a taken name cannot be created or renamed onto
    assert!(matches!(
        env.create_db(3, DbFlags::empty(), &DbParams::default()),
        Err(Error::DuplicateKey)
    ));
    assert!(matches!(env.rename_db(7, 3), Err(Error::DuplicateKey)));
    assert!(matches!(env.rename_db(9, 4), Err(Error::KeyNotFound)));

    env.rename_db(7, 4).unwrap();
    let mut names = env.database_names();
    names.sort_unstable();
    assert_eq!(names, vec![3, 4]);
    env.close().unwrap();

    let env = Environment::open(db_path(&dir), EnvFlags::empty(), &EnvParams::default())
        .unwrap();
    let mut names = env.database_names();
    names.sort_unstable();
    assert_eq!(names, vec![3, 4]);
    env.close().unwrap();
}

#[test]
fn erase_db_frees_the_tree() {
    let dir = setup();
    let env = Environment::create(db_path(&dir), EnvFlags::empty(), &EnvParams::default())
        .unwrap();
    let db = env.create_db(1, DbFlags::empty(), &DbParams::default()).unwrap();
    for i in 0..1000u32 {
        db.insert(None, &int_key(i), &i.to_le_bytes(), InsertFlags::empty())
            .unwrap();
    }
    db.close().unwrap();
    env.erase_db(1).unwrap();
    assert!(env.database_names().is_empty());
    assert!(matches!(env.open_db(1, DbFlags::empty()), Err(Error::KeyNotFound)));

    // the freed pages are reused by the next database
    let db = env.create_db(2, DbFlags::empty(), &DbParams::default()).unwrap();
    for i in 0..1000u32 {
        db.insert(None, &int_key(i), &i.to_le_bytes(), InsertFlags::empty())
            .unwrap();
    }
    db.check_integrity().unwrap();
    db.close().unwrap();
    env.close().unwrap();
}

#[test]
fn second_writer_is_locked_out() {
    let dir = setup();
    let env = Environment::create(db_path(&dir), EnvFlags::empty(), &EnvParams::default())
        .unwrap();
    let second = Environment::open(db_path(&dir), EnvFlags::empty(), &EnvParams::default());
    assert!(matches!(second, Err(Error::WouldBlock)));
    env.close().unwrap();

    // the lock dies with the environment
    let env = Environment::open(db_path(&dir), EnvFlags::empty(), &EnvParams::default())
        .unwrap();
    env.close().unwrap();
}

#[test]
fn read_only_refuses_writes() {
    let dir = setup();
    {
        let (env, db) = create_simple(&dir);
        db.insert(None, b"k", b"v", InsertFlags::empty()).unwrap();
        db.close().unwrap();
        env.close().unwrap();
    }
    let (env, db) = open_simple(&dir, EnvFlags::READ_ONLY);
    assert_eq!(db.find(None, b"k").unwrap(), b"v");
    assert!(matches!(
        db.insert(None, b"x", b"y", InsertFlags::empty()),
        Err(Error::WriteProtected)
    ));
    assert!(matches!(db.erase(None, b"k"), Err(Error::WriteProtected)));
    db.close().unwrap();
    env.close().unwrap();
}

#[test]
fn in_memory_environment() {
    let dir = setup();
    let env = Environment::create(
        db_path(&dir),
        EnvFlags::IN_MEMORY,
        &EnvParams::default(),
    )
    .unwrap();
    let db = env.create_db(1, DbFlags::empty(), &DbParams::default()).unwrap();

    for i in 0..5000u32 {
        db.insert(None, &int_key(i), &i.to_le_bytes(), InsertFlags::empty())
            .unwrap();
    }
    info!("5000 keys live in memory");
    assert_eq!(db.key_count(None, false).unwrap(), 5000);
    db.erase(None, &int_key(42)).unwrap();
    assert!(matches!(db.find(None, &int_key(42)), Err(Error::KeyNotFound)));
    db.check_integrity().unwrap();
    db.close().unwrap();
    env.close().unwrap();

    // nothing was written next to the (unused) path
    assert!(!db_path(&dir).exists());
}

#[test]
fn in_memory_rejects_recovery() {
    let dir = setup();
    let result = Environment::create(
        db_path(&dir),
        EnvFlags::IN_MEMORY | EnvFlags::ENABLE_RECOVERY,
        &EnvParams::default(),
    );
    assert!(matches!(result, Err(Error::InvalidParameter)));
}

#[test]
fn mmap_can_be_disabled() {
    let dir = setup();
    {
        let (env, db) = create_simple(&dir);
        db.insert(None, b"k", b"v", InsertFlags::empty()).unwrap();
        db.close().unwrap();
        env.close().unwrap();
    }
    let env = Environment::open(
        db_path(&dir),
        EnvFlags::DISABLE_MMAP,
        &EnvParams::default(),
    )
    .unwrap();
    let db = env.open_db(1, DbFlags::empty()).unwrap();
    assert_eq!(db.find(None, b"k").unwrap(), b"v");
    db.close().unwrap();
    env.close().unwrap();
}
