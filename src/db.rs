//! A named database inside an environment: one B+-tree plus its runtime
//! state (slot layout, extended-key cache, record-number counter).

use std::{collections::HashMap, sync::Arc};

use log::debug;

use crate::{
    btree::{self, node::NodeLayout},
    config::{KEY_SIZE_UNLIMITED, RECORD_SIZE_UNLIMITED},
    cursor::{self, Cursor},
    dupe::DupePosition,
    env::{EnvCore, EnvState},
    error::Error,
    flags::{DbFlags, FindFlags, InsertFlags, Match},
    record::Record,
    txn::{Transaction, TxnOpKind},
    types::{DbResult, Pod, Result},
    utils::HandyRwLock,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KeyType {
    Binary,
    RecordNumber,
}

impl KeyType {
    pub fn to_tag(self) -> u32 {
        match self {
            KeyType::Binary => 0,
            KeyType::RecordNumber => 1,
        }
    }

    pub fn from_tag(tag: u32) -> Result<Self> {
        match tag {
            0 => Ok(KeyType::Binary),
            1 => Ok(KeyType::RecordNumber),
            _ => Err(Error::InvFileVersion),
        }
    }
}

pub(crate) struct DbState {
    pub name: u16,
    pub flags: DbFlags,
    pub key_type: KeyType,
    /// Configured key size; `KEY_SIZE_UNLIMITED` for variable keys.
    pub key_size: u32,
    /// Configured record size; `RECORD_SIZE_UNLIMITED` for variable
    /// records.
    pub record_size: u32,
    pub layout: NodeLayout,
    pub root_address: u64,
    /// Bumped on every mutation; cursors re-find their position when their
    /// snapshot is stale.
    pub generation: u64,
    /// blob id -> full key bytes for extended keys.
    pub extkey_cache: HashMap<u64, Vec<u8>>,
    pub cursor_count: u32,
    /// Next auto-allocated id of a record-number database.
    pub recno_next: u64,
    pub closed: bool,
}

impl DbState {
    pub fn is_record_number(&self) -> bool {
        self.key_type == KeyType::RecordNumber
    }
}

/// Handle to an open database. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Database {
    pub(crate) core: Arc<EnvCore>,
    pub(crate) state: Pod<DbState>,
}

impl Database {
    pub fn name(&self) -> u16 {
        self.state.rl().name
    }

    /// Insert a `(key, record)` pair.
    pub fn insert(
        &self,
        txn: Option<&Transaction>,
        key: &[u8],
        record: &[u8],
        flags: InsertFlags,
    ) -> DbResult {
        self.insert_record(txn, key, &Record::from_slice(record), flags)
    }

    /// Insert with full record control (partial windows).
    pub fn insert_record(
        &self,
        txn: Option<&Transaction>,
        key: &[u8],
        record: &Record,
        flags: InsertFlags,
    ) -> DbResult {
        let dup_pos = db_level_dup_position(flags)?;
        self.insert_positioned(txn, key, record, flags, dup_pos)
    }

    /// Append a record to a record-number database; returns the allocated
    /// id.
    pub fn insert_recno(
        &self,
        txn: Option<&Transaction>,
        record: &[u8],
        flags: InsertFlags,
    ) -> Result<u64> {
        let id = {
            let db = self.state.rl();
            if !db.is_record_number() {
                return Err(Error::InvalidParameter);
            }
            db.recno_next
        };
        let key = id.to_be_bytes();
        self.insert_record(txn, &key, &Record::from_slice(record), flags)?;
        self.state.wl().recno_next = id + 1;
        Ok(id)
    }

    pub(crate) fn insert_positioned(
        &self,
        txn: Option<&Transaction>,
        key: &[u8],
        record: &Record,
        flags: InsertFlags,
        dup_pos: Option<DupePosition>,
    ) -> DbResult {
        let mut db = self.state.wl();
        let mut env = self.core.state.wl();
        env.guard()?;
        if db.closed {
            return Err(Error::InvalidParameter);
        }
        if env.config.is_read_only() {
            return Err(Error::WriteProtected);
        }
        validate_key(&db, key)?;
        if db.record_size != RECORD_SIZE_UNLIMITED && record.size != db.record_size {
            return Err(Error::InvalidParameter);
        }
        if flags.contains(InsertFlags::PARTIAL) {
            record.validate_partial()?;
        }
        if flags.any_duplicate() && !db.flags.contains(DbFlags::ENABLE_DUPLICATE_KEYS) {
            return Err(Error::InvalidParameter);
        }
        if db.is_record_number() {
            let id = btree::recno_of(key);
            if id >= db.recno_next {
                db.recno_next = id + 1;
            }
        }

        match txn {
            Some(t) => {
                if t.is_read_only() {
                    return Err(Error::InvalidParameter);
                }
                env.claim(db.name, key, t.id)?;
                if !flags.contains(InsertFlags::OVERWRITE)
                    && !flags.any_duplicate()
                    && cursor::merged_contains(&mut env, &mut db, txn, key)?
                {
                    return Err(Error::DuplicateKey);
                }
                // partial windows are resolved now so commit can apply a
                // plain record
                let resolved = if flags.contains(InsertFlags::PARTIAL) {
                    resolve_partial(&mut env, &mut db, txn, key, record, flags)?
                } else {
                    record.clone()
                };
                t.state.wl().record_op(
                    db.name,
                    key.to_vec(),
                    TxnOpKind::Insert,
                    Some(resolved),
                    flags - InsertFlags::PARTIAL,
                    dup_pos,
                );
                db.generation += 1;
                Ok(())
            }
            None => {
                env.check_unclaimed(db.name, key)?;
                let result = btree::insert::insert(&mut env, &mut db, key, record, flags, dup_pos)
                    .and_then(|_| env.commit());
                self.finish_write(&mut env, &mut db, result)
            }
        }
    }

    /// Exact lookup; returns the record bytes.
    pub fn find(&self, txn: Option<&Transaction>, key: &[u8]) -> Result<Vec<u8>> {
        let (_, record, _) = self.find_record(txn, key, FindFlags::empty())?;
        Ok(record)
    }

    /// Lookup honoring the approximate-match flags. Returns the key the
    /// match landed on, the record, and the match sign.
    pub fn find_record(
        &self,
        txn: Option<&Transaction>,
        key: &[u8],
        flags: FindFlags,
    ) -> Result<(Vec<u8>, Vec<u8>, Match)> {
        let mut db = self.state.wl();
        let mut env = self.core.state.wl();
        env.guard()?;
        if db.closed {
            return Err(Error::InvalidParameter);
        }
        match txn {
            Some(t) => env.check_claim_for(db.name, key, t.id)?,
            None => env.check_unclaimed(db.name, key)?,
        }
        let (found, match_kind, cache) = cursor::locate(&mut env, &mut db, txn, key, flags)?;
        let record = cursor::line_record(&mut env, &mut db, &found, &cache[0], None)?;
        Ok((found, record, match_kind))
    }

    /// Read a window of a record without materializing the rest.
    pub fn find_partial(
        &self,
        txn: Option<&Transaction>,
        key: &[u8],
        offset: u32,
        size: u32,
    ) -> Result<Vec<u8>> {
        let mut db = self.state.wl();
        let mut env = self.core.state.wl();
        env.guard()?;
        match txn {
            Some(t) => env.check_claim_for(db.name, key, t.id)?,
            None => env.check_unclaimed(db.name, key)?,
        }
        let (found, _, cache) =
            cursor::locate(&mut env, &mut db, txn, key, FindFlags::empty())?;
        cursor::line_record(&mut env, &mut db, &found, &cache[0], Some((offset, size)))
    }

    /// Erase a key and every record it carries.
    pub fn erase(&self, txn: Option<&Transaction>, key: &[u8]) -> DbResult {
        let mut db = self.state.wl();
        let mut env = self.core.state.wl();
        env.guard()?;
        if db.closed {
            return Err(Error::InvalidParameter);
        }
        if env.config.is_read_only() {
            return Err(Error::WriteProtected);
        }
        validate_key(&db, key)?;

        match txn {
            Some(t) => {
                if t.is_read_only() {
                    return Err(Error::InvalidParameter);
                }
                env.claim(db.name, key, t.id)?;
                if !cursor::merged_contains(&mut env, &mut db, txn, key)? {
                    return Err(Error::KeyNotFound);
                }
                t.state.wl().record_op(
                    db.name,
                    key.to_vec(),
                    TxnOpKind::Erase,
                    None,
                    InsertFlags::empty(),
                    None,
                );
                db.generation += 1;
                Ok(())
            }
            None => {
                env.check_unclaimed(db.name, key)?;
                let result = btree::erase::erase(&mut env, &mut db, key, None)
                    .and_then(|_| env.commit());
                self.finish_write(&mut env, &mut db, result)
            }
        }
    }

    /// Number of keys; with `skip_duplicates` every key counts once.
    pub fn key_count(
        &self,
        txn: Option<&Transaction>,
        skip_duplicates: bool,
    ) -> Result<u64> {
        let mut db = self.state.wl();
        let mut env = self.core.state.wl();
        env.guard()?;

        let txn_touches_db = match txn {
            Some(t) => t.state.rl().tree(db.name).is_some(),
            None => false,
        };
        if !txn_touches_db {
            return btree::key_count(&mut env, &mut db, skip_duplicates);
        }

        // a transaction view exists; walk the merged keyspace
        let mut total = 0u64;
        let mut position: Option<Vec<u8>> = None;
        while let Some((key, cache)) =
            cursor::step(&mut env, &mut db, txn, position.as_deref(), true)?
        {
            total += if skip_duplicates {
                1
            } else {
                cache.len() as u64
            };
            position = Some(key);
        }
        Ok(total)
    }

    /// Open a cursor over this database.
    pub fn cursor<'t>(&self, txn: Option<&'t Transaction>) -> Result<Cursor<'t>> {
        {
            let mut db = self.state.wl();
            if db.closed {
                return Err(Error::InvalidParameter);
            }
            db.cursor_count += 1;
        }
        Ok(Cursor::new(self.clone(), txn))
    }

    /// Verify the structural invariants of the tree.
    pub fn check_integrity(&self) -> DbResult {
        let mut db = self.state.wl();
        let mut env = self.core.state.wl();
        env.guard()?;
        let result = btree::check::check_integrity(&mut env, &mut db);
        if let Err(e) = &result {
            if e.is_fatal() {
                env.fatal = true;
            }
        }
        result
    }

    /// Close the handle. Fails while cursors are open.
    pub fn close(&self) -> DbResult {
        let mut db = self.state.wl();
        if db.closed {
            return Ok(());
        }
        if db.cursor_count > 0 {
            return Err(Error::CursorStillOpen);
        }
        db.closed = true;
        debug!("closed database {}", db.name);
        self.core.databases.wl().remove(&db.name);
        Ok(())
    }

    /// Resolve a finished write: fatal errors poison the environment, all
    /// other failures roll the change set back and re-sync this database
    /// from the persisted descriptor.
    pub(crate) fn finish_write(
        &self,
        env: &mut EnvState,
        db: &mut DbState,
        result: DbResult,
    ) -> DbResult {
        let err = match result {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        if err.is_fatal() {
            env.fatal = true;
            return Err(err);
        }
        env.rollback();
        if let Some(desc) = env.header.descriptor(db.name) {
            db.root_address = desc.root_address;
        }
        db.extkey_cache.clear();
        db.generation += 1;
        Err(err)
    }
}

fn validate_key(db: &DbState, key: &[u8]) -> DbResult {
    if key.is_empty() {
        return Err(Error::InvalidParameter);
    }
    if db.is_record_number() {
        if key.len() != 8 {
            return Err(Error::InvKeySize);
        }
        return Ok(());
    }
    if db.key_size != KEY_SIZE_UNLIMITED && key.len() != db.key_size as usize {
        return Err(Error::InvKeySize);
    }
    Ok(())
}

/// Duplicate positions available without a cursor.
fn db_level_dup_position(flags: InsertFlags) -> Result<Option<DupePosition>> {
    if flags.intersects(
        InsertFlags::DUPLICATE_INSERT_BEFORE | InsertFlags::DUPLICATE_INSERT_AFTER,
    ) {
        // relative positions need a cursor
        return Err(Error::InvalidParameter);
    }
    if flags.contains(InsertFlags::DUPLICATE_INSERT_FIRST) {
        return Ok(Some(DupePosition::First));
    }
    if flags.any_duplicate() {
        return Ok(Some(DupePosition::Last));
    }
    Ok(None)
}

/// Resolve a partial write against the current merged record.
fn resolve_partial(
    env: &mut EnvState,
    db: &mut DbState,
    txn: Option<&Transaction>,
    key: &[u8],
    record: &Record,
    flags: InsertFlags,
) -> Result<Record> {
    let mut base = Vec::new();
    if flags.contains(InsertFlags::OVERWRITE) {
        if let Some(cache) = cursor::merged_cache(env, db, txn, key)? {
            base = cursor::line_record(env, db, key, &cache[0], None)?;
        }
    }
    base.resize(record.size as usize, 0);
    let at = record.partial_offset as usize;
    base[at..at + record.data.len()].copy_from_slice(&record.data);
    Ok(Record::from_slice(&base))
}

pub(crate) fn open_state(
    name: u16,
    flags: DbFlags,
    key_type: KeyType,
    key_size: u32,
    record_size: u32,
    layout: NodeLayout,
    root_address: u64,
) -> DbState {
    DbState {
        name,
        flags,
        key_type,
        key_size,
        record_size,
        layout,
        root_address,
        generation: 0,
        extkey_cache: HashMap::new(),
        cursor_count: 0,
        recno_next: 1,
        closed: false,
    }
}

/// Slot geometry for a database configuration.
pub(crate) fn layout_for(
    page_payload: usize,
    key_size: u32,
    key_type: KeyType,
) -> Result<NodeLayout> {
    let key_size_max = match key_type {
        KeyType::RecordNumber => 8,
        KeyType::Binary => {
            if key_size == KEY_SIZE_UNLIMITED {
                crate::config::DEFAULT_INLINE_KEY_SIZE
            } else if key_size > u16::MAX as u32 {
                return Err(Error::InvKeySize);
            } else {
                key_size as u16
            }
        }
    };
    NodeLayout::compute(page_payload, key_size_max)
}
