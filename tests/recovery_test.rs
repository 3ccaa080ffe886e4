mod common;

use burrow_db::{DbFlags, EnvFlags, EnvParams, Environment, Error, InsertFlags};
use common::*;
use log::info;

fn log_path(dir: &tempfile::TempDir) -> std::path::PathBuf {
    let mut name = db_path(dir).file_name().unwrap().to_os_string();
    name.push(".log0");
    db_path(dir).with_file_name(name)
}

#[test]
fn clean_shutdown_leaves_an_empty_log() {
    let dir = setup();
    let env = Environment::create(
        db_path(&dir),
        EnvFlags::ENABLE_RECOVERY,
        &EnvParams::default(),
    )
    .unwrap();
    let db = env
        .create_db(1, DbFlags::empty(), &burrow_db::DbParams::default())
        .unwrap();
    for i in 0..100u32 {
        db.insert(None, &int_key(i), b"v", InsertFlags::empty()).unwrap();
    }
    db.close().unwrap();
    env.close().unwrap();

    // entries are truncated at every commit; only the header remains
    let log = std::fs::metadata(log_path(&dir)).unwrap();
    assert_eq!(log.len(), 16);

    let env = Environment::open(
        db_path(&dir),
        EnvFlags::ENABLE_RECOVERY,
        &EnvParams::default(),
    )
    .unwrap();
    let db = env.open_db(1, DbFlags::empty()).unwrap();
    assert_eq!(db.key_count(None, false).unwrap(), 100);
    db.close().unwrap();
    env.close().unwrap();
}

#[test]
fn crash_between_log_and_data_is_recovered() {
    let dir = setup();
    {
        let env = Environment::create(
            db_path(&dir),
            EnvFlags::ENABLE_RECOVERY,
            &EnvParams::default(),
        )
        .unwrap();
        let db = env
            .create_db(1, DbFlags::empty(), &burrow_db::DbParams::default())
            .unwrap();
        db.insert(None, b"committed", b"before", InsertFlags::empty()).unwrap();

        // from here on commits reach the log but never the data file
        env.crash_after_log_flush();
        for i in 0..100u32 {
            db.insert(None, &int_key(i), &i.to_le_bytes(), InsertFlags::empty())
                .unwrap();
        }
        info!("dropping the environment mid-crash");
        drop(db);
        drop(env);
    }

    // without auto-recovery the leftover log is refused
    let result = Environment::open(
        db_path(&dir),
        EnvFlags::ENABLE_RECOVERY,
        &EnvParams::default(),
    );
    assert!(matches!(result, Err(Error::NeedRecovery)));

    let env = Environment::open(
        db_path(&dir),
        EnvFlags::ENABLE_RECOVERY | EnvFlags::AUTO_RECOVERY,
        &EnvParams::default(),
    )
    .unwrap();
    let db = env.open_db(1, DbFlags::empty()).unwrap();
    assert_eq!(db.find(None, b"committed").unwrap(), b"before");
    for i in 0..100u32 {
        assert_eq!(db.find(None, &int_key(i)).unwrap(), i.to_le_bytes());
    }
    assert_eq!(db.key_count(None, false).unwrap(), 101);
    db.check_integrity().unwrap();
    db.close().unwrap();
    env.close().unwrap();
}

#[test]
fn torn_log_tail_is_ignored() {
    let dir = setup();
    {
        let env = Environment::create(
            db_path(&dir),
            EnvFlags::ENABLE_RECOVERY,
            &EnvParams::default(),
        )
        .unwrap();
        let db = env
            .create_db(1, DbFlags::empty(), &burrow_db::DbParams::default())
            .unwrap();
        db.insert(None, b"k", b"v", InsertFlags::empty()).unwrap();

        env.crash_after_log_flush();
        db.insert(None, b"lost", b"x", InsertFlags::empty()).unwrap();
        drop(db);
        drop(env);
    }

    // chop bytes off the end: the last change set loses its completion
    // marker and must be discarded as a torn write
    let path = log_path(&dir);
    let len = std::fs::metadata(&path).unwrap().len();
    let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
    file.set_len(len - 10).unwrap();
    drop(file);

    let env = Environment::open(
        db_path(&dir),
        EnvFlags::ENABLE_RECOVERY | EnvFlags::AUTO_RECOVERY,
        &EnvParams::default(),
    )
    .unwrap();
    let db = env.open_db(1, DbFlags::empty()).unwrap();
    assert_eq!(db.find(None, b"k").unwrap(), b"v");
    assert!(matches!(db.find(None, b"lost"), Err(Error::KeyNotFound)));
    db.close().unwrap();
    env.close().unwrap();
}

#[test]
fn corrupt_log_header_is_rejected() {
    let dir = setup();
    {
        let env = Environment::create(
            db_path(&dir),
            EnvFlags::ENABLE_RECOVERY,
            &EnvParams::default(),
        )
        .unwrap();
        env.close().unwrap();
    }
    std::fs::write(log_path(&dir), b"definitely not a log file").unwrap();

    let result = Environment::open(
        db_path(&dir),
        EnvFlags::ENABLE_RECOVERY | EnvFlags::AUTO_RECOVERY,
        &EnvParams::default(),
    );
    assert!(matches!(result, Err(Error::LogInvFileHeader)));
}
