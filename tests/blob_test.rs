mod common;

use burrow_db::{EnvFlags, Error, InsertFlags, Record};
use common::*;
use log::info;

#[test]
fn large_records_round_trip_and_reuse_their_space() {
    let dir = setup();
    let size = 1_000_000usize;
    {
        let (env, db) = create_simple(&dir);
        db.insert(None, b"big", &vec![0x55u8; size], InsertFlags::empty())
            .unwrap();
        db.close().unwrap();
        env.close().unwrap();
    }

    let (env, db) = open_simple(&dir, EnvFlags::empty());
    let record = db.find(None, b"big").unwrap();
    assert_eq!(record.len(), size);
    assert!(record.iter().all(|b| *b == 0x55));

    let filesize_before = std::fs::metadata(db_path(&dir)).unwrap().len();
    db.erase(None, b"big").unwrap();

    // the freed range is recycled for the next blob of the same size
    db.insert(None, b"big2", &vec![0xaau8; size], InsertFlags::empty())
        .unwrap();
    let filesize_after = std::fs::metadata(db_path(&dir)).unwrap().len();
    info!(
        "file size before: {}, after: {}",
        filesize_before, filesize_after
    );
    assert!(filesize_after <= filesize_before);

    let record = db.find(None, b"big2").unwrap();
    assert!(record.iter().all(|b| *b == 0xaa));
    db.close().unwrap();
    env.close().unwrap();
}

#[test]
fn record_size_classes_round_trip() {
    let dir = setup();
    let (env, db) = create_simple(&dir);

    // empty, tiny (< 8), small (== 8), and blob-backed records
    let cases: Vec<(&[u8], Vec<u8>)> = vec![
        (b"empty", Vec::new()),
        (b"tiny", b"abc".to_vec()),
        (b"small", b"12345678".to_vec()),
        (b"blob", vec![7u8; 300]),
    ];
    for (key, record) in &cases {
        db.insert(None, key, record, InsertFlags::empty()).unwrap();
    }
    for (key, record) in &cases {
        assert_eq!(&db.find(None, key).unwrap(), record);
    }

    // overwrite across the classes, both directions
    db.insert(None, b"tiny", &[9u8; 500], InsertFlags::OVERWRITE).unwrap();
    assert_eq!(db.find(None, b"tiny").unwrap(), vec![9u8; 500]);
    db.insert(None, b"blob", b"x", InsertFlags::OVERWRITE).unwrap();
    assert_eq!(db.find(None, b"blob").unwrap(), b"x");
    db.close().unwrap();
    env.close().unwrap();
}

#[test]
fn partial_write_zero_fills_the_rest() {
    let dir = setup();
    let (env, db) = create_simple(&dir);

    // bytes [100, 105) are supplied, everything else must read as zero
    let record = Record::partial(1000, 100, b"hello");
    db.insert_record(None, b"k", &record, InsertFlags::PARTIAL).unwrap();

    let full = db.find(None, b"k").unwrap();
    assert_eq!(full.len(), 1000);
    assert_eq!(&full[100..105], b"hello");
    assert!(full[..100].iter().all(|b| *b == 0));
    assert!(full[105..].iter().all(|b| *b == 0));
    db.close().unwrap();
    env.close().unwrap();
}

#[test]
fn partial_overwrite_preserves_the_rest() {
    let dir = setup();
    let (env, db) = create_simple(&dir);
    db.insert(None, b"k", &vec![0x11u8; 1000], InsertFlags::empty()).unwrap();

    let record = Record::partial(1000, 500, b"world");
    db.insert_record(
        None,
        b"k",
        &record,
        InsertFlags::OVERWRITE | InsertFlags::PARTIAL,
    )
    .unwrap();

    let full = db.find(None, b"k").unwrap();
    assert_eq!(full.len(), 1000);
    assert_eq!(&full[500..505], b"world");
    assert!(full[..500].iter().all(|b| *b == 0x11));
    assert!(full[505..].iter().all(|b| *b == 0x11));
    db.close().unwrap();
    env.close().unwrap();
}

#[test]
fn full_window_partial_is_a_plain_write() {
    let dir = setup();
    let (env, db) = create_simple(&dir);
    let record = Record::partial(5, 0, b"whole");
    db.insert_record(None, b"k", &record, InsertFlags::PARTIAL).unwrap();
    assert_eq!(db.find(None, b"k").unwrap(), b"whole");
    db.close().unwrap();
    env.close().unwrap();
}

#[test]
fn partial_window_must_fit_the_record() {
    let dir = setup();
    let (env, db) = create_simple(&dir);
    let record = Record::partial(10, 8, b"xyz");
    assert!(matches!(
        db.insert_record(None, b"k", &record, InsertFlags::PARTIAL),
        Err(Error::InvalidParameter)
    ));
    db.close().unwrap();
    env.close().unwrap();
}

#[test]
fn partial_read_returns_the_window() {
    let dir = setup();
    let (env, db) = create_simple(&dir);
    let mut data = vec![0u8; 600];
    for (i, b) in data.iter_mut().enumerate() {
        *b = (i % 251) as u8;
    }
    db.insert(None, b"k", &data, InsertFlags::empty()).unwrap();

    let window = db.find_partial(None, b"k", 200, 100).unwrap();
    assert_eq!(window, &data[200..300]);
    // a window past the end is clamped
    let window = db.find_partial(None, b"k", 550, 100).unwrap();
    assert_eq!(window, &data[550..600]);
    db.close().unwrap();
    env.close().unwrap();
}

#[test]
fn many_small_blobs_share_pages() {
    let dir = setup();
    let (env, db) = create_simple(&dir);
    for i in 0..500u32 {
        db.insert(None, &int_key(i), &vec![i as u8; 100], InsertFlags::empty())
            .unwrap();
    }
    for i in 0..500u32 {
        assert_eq!(db.find(None, &int_key(i)).unwrap(), vec![i as u8; 100]);
    }
    db.check_integrity().unwrap();
    db.close().unwrap();
    env.close().unwrap();
}
