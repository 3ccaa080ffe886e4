//! Cursors couple a B-tree position with an optional transaction op view.
//!
//! The authoritative position is the current key plus an index into the
//! duplicate cache; the `(page, slot)` coupling is a pinned shortcut that
//! is dropped whenever the tree changes underneath. The duplicate cache is
//! the authoritative ordered view of a key's duplicates: the B-tree's
//! table merged with the transaction's duplicate ops.

use log::trace;

use crate::{
    btree::{self, find::FindResult, node},
    db::{Database, DbState},
    dupe::{self, DupePosition},
    env::EnvState,
    error::Error,
    flags::{CursorFlags, FindFlags, InsertFlags, Match},
    page_manager::FetchMode,
    record::{
        fetch_record, Record, KEY_FLAG_HAS_DUPLICATES, REC_FLAGS_MASK,
    },
    txn::{self, Transaction, TxnOp, TxnOpKind},
    types::{DbResult, Result},
    utils::HandyRwLock,
};

/// One entry of the merged duplicate list of the current key.
#[derive(Debug, Clone)]
pub(crate) enum DupeLine {
    /// Index into the B-tree side (duplicate table index, or 0 for the
    /// plain slot record).
    Btree { index: u32 },
    /// A record that only exists in the transaction.
    Txn { record: Record },
}

pub struct Cursor<'t> {
    db: Database,
    txn: Option<&'t Transaction>,
    /// Current key; `None` is the nil cursor.
    current_key: Option<Vec<u8>>,
    /// Cached leaf position, pinned in the cache while it is valid.
    coupled: Option<(u64, usize)>,
    generation: u64,
    dup_cache: Vec<DupeLine>,
    dup_index: usize,
}

impl<'t> Cursor<'t> {
    pub(crate) fn new(db: Database, txn: Option<&'t Transaction>) -> Self {
        Self {
            db,
            txn,
            current_key: None,
            coupled: None,
            generation: 0,
            dup_cache: Vec::new(),
            dup_index: 0,
        }
    }

    /// A clone continues at the same position.
    pub fn clone_cursor(&self) -> Cursor<'t> {
        self.db.state.wl().cursor_count += 1;
        Cursor {
            db: self.db.clone(),
            txn: self.txn,
            current_key: self.current_key.clone(),
            coupled: None,
            generation: 0,
            dup_cache: self.dup_cache.clone(),
            dup_index: self.dup_index,
        }
    }

    /// Position on `key` per the find flags. Returns the key the cursor
    /// ended up on (which differs for approximate matches) and its sign.
    pub fn find(&mut self, key: &[u8], flags: FindFlags) -> Result<(Vec<u8>, Match)> {
        let handle = self.db.clone();
        let mut db = handle.state.wl();
        let mut env = handle.core.state.wl();
        env.guard()?;
        self.set_nil_inner(&mut env);

        let located = locate(&mut env, &mut db, self.txn, key, flags)?;
        let (found, match_kind, cache) = located;
        self.current_key = Some(found.clone());
        self.dup_cache = cache;
        self.dup_index = 0;
        self.recouple(&mut env, &mut db, &found);
        Ok((found, match_kind))
    }

    pub fn move_to(&mut self, flags: CursorFlags) -> DbResult {
        let handle = self.db.clone();
        let mut db = handle.state.wl();
        let mut env = handle.core.state.wl();
        env.guard()?;

        if flags.contains(CursorFlags::FIRST) || flags.contains(CursorFlags::LAST) {
            let forward = flags.contains(CursorFlags::FIRST);
            let next = step(&mut env, &mut db, self.txn, None, forward)?
                .ok_or(Error::KeyNotFound)?;
            self.apply_step(&mut env, &mut db, next, forward);
            return Ok(());
        }

        let forward = flags.contains(CursorFlags::NEXT);
        if !forward && !flags.contains(CursorFlags::PREVIOUS) {
            return Err(Error::InvalidParameter);
        }
        let current = self.current_key.clone().ok_or(Error::CursorIsNil)?;

        if flags.contains(CursorFlags::ONLY_DUPLICATES) {
            return self.step_within_duplicates(forward);
        }

        // step through the remaining duplicates of the current key first
        if !flags.contains(CursorFlags::SKIP_DUPLICATES) {
            if forward && self.dup_index + 1 < self.dup_cache.len() {
                self.dup_index += 1;
                return Ok(());
            }
            if !forward && self.dup_index > 0 {
                self.dup_index -= 1;
                return Ok(());
            }
        }

        let next = step(&mut env, &mut db, self.txn, Some(&current), forward)?
            .ok_or(Error::KeyNotFound)?;
        self.apply_step(&mut env, &mut db, next, forward);
        Ok(())
    }

    fn step_within_duplicates(&mut self, forward: bool) -> DbResult {
        if self.current_key.is_none() {
            return Err(Error::CursorIsNil);
        }
        if forward {
            if self.dup_index + 1 < self.dup_cache.len() {
                self.dup_index += 1;
                return Ok(());
            }
        } else if self.dup_index > 0 {
            self.dup_index -= 1;
            return Ok(());
        }
        Err(Error::KeyNotFound)
    }

    fn apply_step(
        &mut self,
        env: &mut EnvState,
        db: &mut DbState,
        next: (Vec<u8>, Vec<DupeLine>),
        forward: bool,
    ) {
        let (key, cache) = next;
        self.set_nil_inner(env);
        self.dup_index = if forward || cache.is_empty() {
            0
        } else {
            cache.len() - 1
        };
        self.dup_cache = cache;
        self.recouple(env, db, &key);
        self.current_key = Some(key);
    }

    pub fn key(&self) -> Result<Vec<u8>> {
        self.current_key.clone().ok_or(Error::CursorIsNil)
    }

    pub fn record(&mut self) -> Result<Vec<u8>> {
        let key = self.current_key.clone().ok_or(Error::CursorIsNil)?;
        let line = self
            .dup_cache
            .get(self.dup_index)
            .cloned()
            .ok_or(Error::KeyNotFound)?;
        let handle = self.db.clone();
        let mut db = handle.state.wl();
        let mut env = handle.core.state.wl();
        env.guard()?;
        line_record(&mut env, &mut db, &key, &line, None)
    }

    pub fn duplicate_count(&mut self) -> Result<u32> {
        if self.current_key.is_none() {
            return Err(Error::CursorIsNil);
        }
        Ok(self.dup_cache.len() as u32)
    }

    /// Insert through the cursor; the cursor ends up on the new entry.
    /// Duplicate positioning (`DUPLICATE_INSERT_BEFORE` / `_AFTER`) is
    /// relative to the cursor's current duplicate.
    pub fn insert(&mut self, key: &[u8], record: &[u8], flags: InsertFlags) -> DbResult {
        let dup_pos = if flags.contains(InsertFlags::DUPLICATE_INSERT_BEFORE) {
            Some(DupePosition::Before(self.dup_index as u32))
        } else if flags.contains(InsertFlags::DUPLICATE_INSERT_AFTER) {
            Some(DupePosition::After(self.dup_index as u32))
        } else if flags.contains(InsertFlags::DUPLICATE_INSERT_FIRST) {
            Some(DupePosition::First)
        } else if flags.any_duplicate() {
            Some(DupePosition::Last)
        } else {
            None
        };
        self.db
            .insert_positioned(self.txn, key, &Record::from_slice(record), flags, dup_pos)?;
        // re-read the merged state so the duplicate cache is authoritative
        let (found, _) = self.find(key, FindFlags::empty())?;
        debug_assert_eq!(found, key);
        if flags.any_duplicate() && !self.dup_cache.is_empty() {
            let last = self.dup_cache.len() - 1;
            self.dup_index = match dup_pos {
                Some(DupePosition::First) => 0,
                Some(DupePosition::Before(i)) => std::cmp::min(i as usize, last),
                Some(DupePosition::After(i)) => std::cmp::min(i as usize + 1, last),
                Some(DupePosition::Last) | None => last,
            };
        }
        Ok(())
    }

    /// Replace the record of the current duplicate, leaving the position
    /// unchanged.
    pub fn overwrite(&mut self, record: &[u8]) -> DbResult {
        let key = self.current_key.clone().ok_or(Error::CursorIsNil)?;
        let line = self
            .dup_cache
            .get(self.dup_index)
            .cloned()
            .ok_or(Error::CursorIsNil)?;
        let dup_index = self.dup_index;

        let handle = self.db.clone();
        if let Some(t) = self.txn {
            if t.is_read_only() {
                return Err(Error::InvalidParameter);
            }
            let mut db = handle.state.wl();
            let mut env = handle.core.state.wl();
            env.guard()?;
            env.claim(db.name, &key, t.id)?;
            let mut ts = t.state.wl();
            if self.dup_cache.len() <= 1 {
                ts.record_op(
                    db.name,
                    key.clone(),
                    TxnOpKind::Insert,
                    Some(Record::from_slice(record)),
                    InsertFlags::OVERWRITE,
                    None,
                );
            } else {
                ts.record_op(
                    db.name,
                    key.clone(),
                    TxnOpKind::EraseDup(dup_index as u32),
                    None,
                    InsertFlags::empty(),
                    None,
                );
                ts.record_op(
                    db.name,
                    key.clone(),
                    TxnOpKind::Insert,
                    Some(Record::from_slice(record)),
                    InsertFlags::DUPLICATE,
                    Some(DupePosition::Before(dup_index as u32)),
                );
            }
            drop(ts);
            let cache = merged_cache(&mut env, &mut db, self.txn, &key)?
                .ok_or(Error::KeyNotFound)?;
            self.dup_cache = cache;
            return Ok(());
        }

        let mut db = handle.state.wl();
        let mut env = handle.core.state.wl();
        env.guard()?;
        env.check_unclaimed(db.name, &key)?;
        let result = overwrite_btree_line(&mut env, &mut db, &key, &line, record);
        let result = match result {
            Ok(()) => env.commit(),
            Err(e) => Err(e),
        };
        handle.finish_write(&mut env, &mut db, result)?;
        let cache = merged_cache(&mut env, &mut db, self.txn, &key)?
            .ok_or(Error::KeyNotFound)?;
        self.dup_cache = cache;
        Ok(())
    }

    /// Erase the current duplicate (or the whole key when it has just
    /// one record). The cursor becomes nil.
    pub fn erase(&mut self) -> DbResult {
        let key = self.current_key.clone().ok_or(Error::CursorIsNil)?;
        let dup_index = self.dup_index;
        let erase_whole = self.dup_cache.len() <= 1;
        let line = self
            .dup_cache
            .get(self.dup_index)
            .cloned()
            .ok_or(Error::CursorIsNil)?;

        let handle = self.db.clone();
        if let Some(t) = self.txn {
            if t.is_read_only() {
                return Err(Error::InvalidParameter);
            }
            let mut db = handle.state.wl();
            let mut env = handle.core.state.wl();
            env.guard()?;
            env.claim(db.name, &key, t.id)?;
            let kind = if erase_whole {
                TxnOpKind::Erase
            } else {
                TxnOpKind::EraseDup(dup_index as u32)
            };
            t.state.wl().record_op(
                db.name,
                key.clone(),
                kind,
                None,
                InsertFlags::empty(),
                None,
            );
            drop(env);
            drop(db);
            self.set_nil();
            return Ok(());
        }

        let mut db = handle.state.wl();
        let mut env = handle.core.state.wl();
        env.guard()?;
        env.check_unclaimed(db.name, &key)?;
        let dup = match line {
            DupeLine::Btree { index } if !erase_whole => Some(index),
            _ => None,
        };
        let result = btree::erase::erase(&mut env, &mut db, &key, dup);
        let result = match result {
            Ok(()) => env.commit(),
            Err(e) => Err(e),
        };
        handle.finish_write(&mut env, &mut db, result)?;
        drop(env);
        drop(db);
        self.set_nil();
        Ok(())
    }

    /// Detach from any position. Always safe, idempotent.
    pub fn set_nil(&mut self) {
        let core = self.db.core.clone();
        let mut env = core.state.wl();
        self.set_nil_inner(&mut env);
    }

    fn set_nil_inner(&mut self, env: &mut EnvState) {
        self.unpin(env);
        self.current_key = None;
        self.dup_cache.clear();
        self.dup_index = 0;
    }

    pub fn is_nil(&self) -> bool {
        self.current_key.is_none()
    }

    pub fn close(self) {}

    /// Pin the leaf holding `key`, if it is already cached.
    fn recouple(&mut self, env: &mut EnvState, db: &mut DbState, key: &[u8]) {
        self.unpin(env);
        if let Ok(leaf) = btree::find_leaf(env, db, key) {
            if let Ok(search) = btree::search_node(env, db, &leaf, key) {
                if search.exact {
                    let address = leaf.rl().address();
                    leaf.wl().acquire_cursor_ref();
                    self.coupled = Some((address, search.insert_at));
                    self.generation = db.generation;
                    trace!(
                        "cursor coupled to page 0x{:x} slot {}",
                        address,
                        search.insert_at
                    );
                }
            }
        }
    }

    fn unpin(&mut self, env: &mut EnvState) {
        if let Some((address, _)) = self.coupled.take() {
            if let Ok(Some(page)) = env.fetch(address, FetchMode::CacheOnly, false) {
                page.wl().release_cursor_ref();
            }
        }
    }
}

impl<'t> Drop for Cursor<'t> {
    fn drop(&mut self) {
        let core = self.db.core.clone();
        let mut env = core.state.wl();
        self.unpin(&mut env);
        drop(env);
        let state = self.db.state.clone();
        let mut db = state.wl();
        if db.cursor_count > 0 {
            db.cursor_count -= 1;
        }
    }
}

// ----------------------------------------------------------------------
// merged view of the B-tree and the transaction op tree
// ----------------------------------------------------------------------

/// Build the merged duplicate cache for `key`; `None` when the key is not
/// visible.
pub(crate) fn merged_cache(
    env: &mut EnvState,
    db: &mut DbState,
    txn: Option<&Transaction>,
    key: &[u8],
) -> Result<Option<Vec<DupeLine>>> {
    let mut lines: Vec<DupeLine> = Vec::new();

    match btree::find::find(env, db, key, FindFlags::empty()) {
        Ok(found) => {
            let page = btree::fetch_node(env, found.page)?;
            let (slot_flags, ptr) = {
                let pg = page.rl();
                (
                    node::slot_flags(&pg, &db.layout, found.slot),
                    node::slot_ptr(&pg, &db.layout, found.slot),
                )
            };
            if slot_flags & KEY_FLAG_HAS_DUPLICATES != 0 {
                let count = dupe::count(env, ptr)?;
                for i in 0..count {
                    lines.push(DupeLine::Btree { index: i });
                }
            } else {
                lines.push(DupeLine::Btree { index: 0 });
            }
        }
        Err(Error::KeyNotFound) => {}
        Err(e) => return Err(e),
    }

    if let Some(t) = txn {
        let ts = t.state.rl();
        if let Some(ops) = ts.tree(db.name).and_then(|tree| tree.ops_for(key)) {
            apply_ops_to_cache(&mut lines, ops);
        }
    }

    if lines.is_empty() {
        return Ok(None);
    }
    Ok(Some(lines))
}

/// Replay a key's ops, in order, over the duplicate cache.
fn apply_ops_to_cache(lines: &mut Vec<DupeLine>, ops: &[TxnOp]) {
    for op in ops {
        match &op.kind {
            TxnOpKind::Erase => lines.clear(),
            TxnOpKind::EraseDup(index) => {
                if (*index as usize) < lines.len() {
                    lines.remove(*index as usize);
                }
            }
            TxnOpKind::Insert => {
                let record = op.record.clone().unwrap_or_default();
                if op.flags.any_duplicate() {
                    let at = resolve_insert_index(op.dup_pos, lines.len());
                    lines.insert(at, DupeLine::Txn { record });
                } else {
                    // a plain insert or overwrite supersedes the list
                    lines.clear();
                    lines.push(DupeLine::Txn { record });
                }
            }
        }
    }
}

fn resolve_insert_index(pos: Option<DupePosition>, len: usize) -> usize {
    match pos {
        Some(DupePosition::First) => 0,
        Some(DupePosition::Before(i)) => std::cmp::min(i as usize, len),
        Some(DupePosition::After(i)) => std::cmp::min(i as usize + 1, len),
        Some(DupePosition::Last) | None => len,
    }
}

/// Materialize the record behind one cache line.
pub(crate) fn line_record(
    env: &mut EnvState,
    db: &mut DbState,
    key: &[u8],
    line: &DupeLine,
    window: Option<(u32, u32)>,
) -> Result<Vec<u8>> {
    match line {
        DupeLine::Txn { record } => {
            let mut data = record.data.clone();
            if let Some((offset, size)) = window {
                let start = std::cmp::min(offset as usize, data.len());
                let end = std::cmp::min(start + size as usize, data.len());
                data = data[start..end].to_vec();
            }
            Ok(data)
        }
        DupeLine::Btree { index } => {
            let found = btree::find::find(env, db, key, FindFlags::empty())?;
            let page = btree::fetch_node(env, found.page)?;
            let (slot_flags, ptr) = {
                let pg = page.rl();
                (
                    node::slot_flags(&pg, &db.layout, found.slot),
                    node::slot_ptr(&pg, &db.layout, found.slot),
                )
            };
            if slot_flags & KEY_FLAG_HAS_DUPLICATES != 0 {
                let entry = dupe::get(env, ptr, *index)?;
                fetch_record(env, entry.rid, entry.flags, window)
            } else {
                fetch_record(env, ptr, slot_flags & REC_FLAGS_MASK, window)
            }
        }
    }
}

/// Exact or approximate merged lookup; the cursor-level flavour of find.
pub(crate) fn locate(
    env: &mut EnvState,
    db: &mut DbState,
    txn: Option<&Transaction>,
    key: &[u8],
    flags: FindFlags,
) -> Result<(Vec<u8>, Match, Vec<DupeLine>)> {
    let exact_wanted = flags.contains(FindFlags::EXACT_MATCH) || !flags.is_approximate();
    if exact_wanted {
        if let Some(cache) = merged_cache(env, db, txn, key)? {
            return Ok((key.to_vec(), Match::Exact, cache));
        }
        if !flags.is_approximate() {
            return Err(Error::KeyNotFound);
        }
    }
    if flags.contains(FindFlags::LT_MATCH) {
        if let Some((found, cache)) = step(env, db, txn, Some(key), false)? {
            return Ok((found, Match::Less, cache));
        }
    }
    if flags.contains(FindFlags::GT_MATCH) {
        if let Some((found, cache)) = step(env, db, txn, Some(key), true)? {
            return Ok((found, Match::Greater, cache));
        }
    }
    Err(Error::KeyNotFound)
}

/// The next (or previous) visible key after `from`, with its duplicate
/// cache. `from = None` starts at the tree's edge. Keys whose merged
/// duplicate list ends up empty are stepped over.
pub(crate) fn step(
    env: &mut EnvState,
    db: &mut DbState,
    txn: Option<&Transaction>,
    from: Option<&[u8]>,
    forward: bool,
) -> Result<Option<(Vec<u8>, Vec<DupeLine>)>> {
    let mut anchor: Option<Vec<u8>> = from.map(|k| k.to_vec());
    loop {
        let btree_side = btree_neighbor(env, db, anchor.as_deref(), forward)?;
        let txn_side = txn_neighbor(db, txn, anchor.as_deref(), forward);

        let candidate = match (btree_side, txn_side) {
            (None, None) => return Ok(None),
            (Some(b), None) => b,
            (None, Some(t)) => t,
            (Some(b), Some(t)) => {
                // on a tie both sides describe the same key and the
                // transaction view wins during the merge anyway
                let pick_b = if forward {
                    btree::compare_keys(db, &b, &t) != std::cmp::Ordering::Greater
                } else {
                    btree::compare_keys(db, &b, &t) != std::cmp::Ordering::Less
                };
                if pick_b {
                    b
                } else {
                    t
                }
            }
        };

        if let Some(cache) = merged_cache(env, db, txn, &candidate)? {
            return Ok(Some((candidate, cache)));
        }
        // the candidate is erased in the transaction view; keep walking
        anchor = Some(candidate);
    }
}

fn btree_neighbor(
    env: &mut EnvState,
    db: &mut DbState,
    from: Option<&[u8]>,
    forward: bool,
) -> Result<Option<Vec<u8>>> {
    let result: Result<FindResult> = match from {
        Some(key) => {
            let flags = if forward {
                FindFlags::GT_MATCH
            } else {
                FindFlags::LT_MATCH
            };
            btree::find::find(env, db, key, flags)
        }
        None => {
            let slot = if forward {
                btree::first_slot(env, db)?
            } else {
                btree::last_slot(env, db)?
            };
            match slot {
                Some((page_address, slot)) => {
                    let page = btree::fetch_node(env, page_address)?;
                    let key = btree::materialize_key(env, db, &page, slot)?;
                    return Ok(Some(key));
                }
                None => return Ok(None),
            }
        }
    };
    match result {
        Ok(found) => Ok(Some(found.key)),
        Err(Error::KeyNotFound) => Ok(None),
        Err(e) => Err(e),
    }
}

fn txn_neighbor(
    db: &DbState,
    txn: Option<&Transaction>,
    from: Option<&[u8]>,
    forward: bool,
) -> Option<Vec<u8>> {
    let t = txn?;
    let ts = t.state.rl();
    let tree = ts.tree(db.name)?;
    let found = if forward {
        tree.next_key(from)
    } else {
        tree.prev_key(from)
    };
    found.map(|(key, _)| key.clone())
}

/// True when `key` is visible through the merged view.
pub(crate) fn merged_contains(
    env: &mut EnvState,
    db: &mut DbState,
    txn: Option<&Transaction>,
    key: &[u8],
) -> Result<bool> {
    if let Some(t) = txn {
        let ts = t.state.rl();
        if let Some(ops) = ts.tree(db.name).and_then(|tree| tree.ops_for(key)) {
            match txn::visibility(ops) {
                txn::Visibility::Erased => return Ok(false),
                txn::Visibility::Inserted(_) => return Ok(true),
                txn::Visibility::Untouched => {}
            }
        }
    }
    match btree::find::find(env, db, key, FindFlags::empty()) {
        Ok(_) => Ok(true),
        Err(Error::KeyNotFound) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Replace the record behind a B-tree cache line in place.
fn overwrite_btree_line(
    env: &mut EnvState,
    db: &mut DbState,
    key: &[u8],
    line: &DupeLine,
    record: &[u8],
) -> DbResult {
    let index = match line {
        DupeLine::Btree { index } => *index,
        DupeLine::Txn { .. } => return Err(Error::InvalidParameter),
    };
    let found = btree::find::find(env, db, key, FindFlags::empty())?;
    let page = btree::fetch_node(env, found.page)?;
    let address = found.page;
    let (slot_flags, ptr) = {
        let pg = page.rl();
        (
            node::slot_flags(&pg, &db.layout, found.slot),
            node::slot_ptr(&pg, &db.layout, found.slot),
        )
    };
    let rec = Record::from_slice(record);
    if slot_flags & KEY_FLAG_HAS_DUPLICATES != 0 {
        let old = dupe::get(env, ptr, index)?;
        let (rid, rflags) =
            crate::record::store_record(env, Some((old.rid, old.flags)), &rec, false)?;
        let table = dupe::overwrite_entry(
            env,
            ptr,
            index,
            crate::dupe::DupeEntry { rid, flags: rflags },
        )?;
        if table != ptr {
            let mut pg = page.wl();
            node::set_slot_ptr(&mut pg, &db.layout, found.slot, table);
        }
        env.track(&page, address);
        db.generation += 1;
        return Ok(());
    }
    let old = (ptr, slot_flags & REC_FLAGS_MASK);
    let (rid, rflags) = crate::record::store_record(env, Some(old), &rec, false)?;
    let mut pg = page.wl();
    node::set_slot_ptr(&mut pg, &db.layout, found.slot, rid);
    let kept = node::slot_flags(&pg, &db.layout, found.slot)
        & crate::record::KEY_FLAG_EXTENDED;
    node::set_slot_flags(&mut pg, &db.layout, found.slot, kept | rflags);
    drop(pg);
    env.track(&page, address);
    db.generation += 1;
    Ok(())
}
