//! Insert with node splits.
//!
//! Splits propagate upward through the recursive descent; when the root
//! itself splits a fresh root is installed and the database descriptor is
//! updated within the same change set.

use std::cmp::Ordering;

use log::{debug, trace};

use crate::{
    btree::{self, node},
    db::DbState,
    dupe::{self, DupeEntry, DupePosition},
    env::EnvState,
    error::Error,
    flags::{DbFlags, InsertFlags},
    page::{Page, PageType},
    record::{
        store_record, Record, KEY_FLAG_EXTENDED, KEY_FLAG_HAS_DUPLICATES, REC_FLAGS_MASK,
    },
    types::{DbResult, Pod, Result},
    utils::HandyRwLock,
};

enum UpAction {
    Done,
    /// The child at this level split; the parent gains `(pivot, right)`.
    Split(Vec<u8>, u64),
}

pub(crate) fn insert(
    state: &mut EnvState,
    db: &mut DbState,
    key: &[u8],
    record: &Record,
    flags: InsertFlags,
    dup_pos: Option<DupePosition>,
) -> DbResult {
    if flags.intersects(InsertFlags::HINT_APPEND | InsertFlags::HINT_PREPEND)
        && try_edge_insert(state, db, key, record, flags)?
    {
        db.generation += 1;
        return Ok(());
    }

    trace!("insert key {}", hex::encode(key));
    let root = db.root_address;
    match insert_recursive(state, db, root, key, record, flags, dup_pos)? {
        UpAction::Done => {}
        UpAction::Split(pivot, right) => {
            grow_root(state, db, pivot, right)?;
        }
    }
    db.generation += 1;
    Ok(())
}

fn insert_recursive(
    state: &mut EnvState,
    db: &mut DbState,
    page_address: u64,
    key: &[u8],
    record: &Record,
    flags: InsertFlags,
    dup_pos: Option<DupePosition>,
) -> Result<UpAction> {
    let page = btree::fetch_node(state, page_address)?;
    if node::is_leaf(&page.rl()) {
        return insert_into_leaf(state, db, &page, key, record, flags, dup_pos);
    }
    let child = btree::child_for(state, db, &page, key)?;
    match insert_recursive(state, db, child, key, record, flags, dup_pos)? {
        UpAction::Done => Ok(UpAction::Done),
        UpAction::Split(pivot, right) => add_to_internal(state, db, &page, &pivot, right),
    }
}

fn insert_into_leaf(
    state: &mut EnvState,
    db: &mut DbState,
    page: &Pod<Page>,
    key: &[u8],
    record: &Record,
    flags: InsertFlags,
    dup_pos: Option<DupePosition>,
) -> Result<UpAction> {
    let search = btree::search_node(state, db, page, key)?;
    if search.exact {
        overwrite_or_duplicate(state, db, page, search.insert_at, record, flags, dup_pos)?;
        return Ok(UpAction::Done);
    }

    let count = node::count(&page.rl());
    if count < db.layout.max_keys {
        fill_new_slot(state, db, page, search.insert_at, key, record, flags)?;
        return Ok(UpAction::Done);
    }
    split_leaf(state, db, page, search.insert_at, key, record, flags)
}

/// The key already exists: replace its record or extend its duplicate list.
fn overwrite_or_duplicate(
    state: &mut EnvState,
    db: &mut DbState,
    page: &Pod<Page>,
    slot: usize,
    record: &Record,
    flags: InsertFlags,
    dup_pos: Option<DupePosition>,
) -> DbResult {
    let address = page.rl().address();
    let (slot_flags, ptr) = {
        let pg = page.rl();
        (
            node::slot_flags(&pg, &db.layout, slot),
            node::slot_ptr(&pg, &db.layout, slot),
        )
    };
    let partial = flags.contains(InsertFlags::PARTIAL);

    if slot_flags & KEY_FLAG_HAS_DUPLICATES != 0 {
        if flags.any_duplicate() {
            let (rid, rflags) = store_record(state, None, record, partial)?;
            let position = dup_pos.unwrap_or(DupePosition::Last);
            let (table, index) =
                dupe::insert(state, ptr, position, DupeEntry { rid, flags: rflags })?;
            trace!("inserted duplicate at index {}", index);
            if table != ptr {
                let mut pg = page.wl();
                node::set_slot_ptr(&mut pg, &db.layout, slot, table);
            }
            state.track(page, address);
            return Ok(());
        }
        if flags.contains(InsertFlags::OVERWRITE) {
            // overwriting a duplicate key replaces its first record
            let old = dupe::get(state, ptr, 0)?;
            let (rid, rflags) =
                store_record(state, Some((old.rid, old.flags)), record, partial)?;
            let table =
                dupe::overwrite_entry(state, ptr, 0, DupeEntry { rid, flags: rflags })?;
            if table != ptr {
                let mut pg = page.wl();
                node::set_slot_ptr(&mut pg, &db.layout, slot, table);
            }
            state.track(page, address);
            return Ok(());
        }
        return Err(Error::DuplicateKey);
    }

    if flags.any_duplicate() {
        if !db.flags.contains(DbFlags::ENABLE_DUPLICATE_KEYS) {
            return Err(Error::InvalidParameter);
        }
        // second record for this key: move both into a duplicate table
        let old_entry = DupeEntry {
            rid: ptr,
            flags: slot_flags & REC_FLAGS_MASK,
        };
        let (rid, rflags) = store_record(state, None, record, partial)?;
        let new_entry = DupeEntry { rid, flags: rflags };
        let first_wanted = matches!(
            dup_pos,
            Some(DupePosition::First) | Some(DupePosition::Before(0))
        ) || flags.contains(InsertFlags::DUPLICATE_INSERT_FIRST);
        let table = if first_wanted {
            dupe::create_table(state, new_entry, old_entry)?
        } else {
            dupe::create_table(state, old_entry, new_entry)?
        };
        let mut pg = page.wl();
        node::set_slot_ptr(&mut pg, &db.layout, slot, table);
        let kept = node::slot_flags(&pg, &db.layout, slot) & KEY_FLAG_EXTENDED;
        node::set_slot_flags(&mut pg, &db.layout, slot, kept | KEY_FLAG_HAS_DUPLICATES);
        drop(pg);
        state.track(page, address);
        return Ok(());
    }

    if flags.contains(InsertFlags::OVERWRITE) {
        let old = (ptr, slot_flags & REC_FLAGS_MASK);
        let (rid, rflags) = store_record(state, Some(old), record, partial)?;
        let mut pg = page.wl();
        node::set_slot_ptr(&mut pg, &db.layout, slot, rid);
        let kept = node::slot_flags(&pg, &db.layout, slot) & KEY_FLAG_EXTENDED;
        node::set_slot_flags(&mut pg, &db.layout, slot, kept | rflags);
        drop(pg);
        state.track(page, address);
        return Ok(());
    }

    Err(Error::DuplicateKey)
}

/// Write a brand-new slot at `index`; the node must have room.
fn fill_new_slot(
    state: &mut EnvState,
    db: &mut DbState,
    page: &Pod<Page>,
    index: usize,
    key: &[u8],
    record: &Record,
    flags: InsertFlags,
) -> DbResult {
    let address = page.rl().address();
    let partial = flags.contains(InsertFlags::PARTIAL);
    let (rid, rflags) = store_record(state, None, record, partial)?;
    let (inline, key_size, kflags) = btree::encode_slot_key(state, db, key)?;

    let mut pg = page.wl();
    node::insert_slot(&mut pg, &db.layout, index);
    node::set_slot(
        &mut pg,
        &db.layout,
        index,
        rid,
        key_size,
        kflags | rflags,
        &inline,
    );
    drop(pg);
    state.track(page, address);
    Ok(())
}

fn split_leaf(
    state: &mut EnvState,
    db: &mut DbState,
    page: &Pod<Page>,
    insert_at: usize,
    key: &[u8],
    record: &Record,
    flags: InsertFlags,
) -> Result<UpAction> {
    let layout = db.layout;
    let count = layout.max_keys;
    let (old_address, old_right) = {
        let pg = page.rl();
        (pg.address(), node::right(&pg))
    };

    // appending to the tree's upper end leaves the old node full and the
    // new node nearly empty, which packs sequential inserts tightly
    let append = insert_at == count && old_right == 0;
    let pivot = if append {
        std::cmp::max(count - 2, 1)
    } else {
        count / 2
    };

    let new_page = state.alloc_page(PageType::BtreeIndex, false)?;
    let new_address = new_page.rl().address();
    {
        let mut new_pg = new_page.wl();
        node::init(&mut new_pg, true);
        let mut old_pg = page.wl();
        node::move_slots(&mut old_pg, &mut new_pg, &layout, pivot);
        node::set_left(&mut new_pg, old_address);
        node::set_right(&mut new_pg, old_right);
        node::set_right(&mut old_pg, new_address);
    }
    state.track(page, old_address);
    if old_right != 0 {
        let far = btree::fetch_node(state, old_right)?;
        let mut far_pg = far.wl();
        node::set_left(&mut far_pg, new_address);
        drop(far_pg);
        state.track(&far, old_right);
    }

    let pivot_key = btree::materialize_key(state, db, &new_page, 0)?;
    debug!(
        "split leaf 0x{:x} at pivot {}, new sibling 0x{:x}",
        old_address, pivot, new_address
    );

    // insert the pending key into whichever half owns it now
    let target = if btree::compare_keys(db, key, &pivot_key) == Ordering::Less {
        page
    } else {
        &new_page
    };
    let search = btree::search_node(state, db, target, key)?;
    fill_new_slot(state, db, target, search.insert_at, key, record, flags)?;

    Ok(UpAction::Split(pivot_key, new_address))
}

/// Plant a `(pivot, right-child)` slot into an internal node, splitting it
/// when it is full.
fn add_to_internal(
    state: &mut EnvState,
    db: &mut DbState,
    page: &Pod<Page>,
    pivot: &[u8],
    right: u64,
) -> Result<UpAction> {
    let layout = db.layout;
    let count = node::count(&page.rl());
    if count < layout.max_keys {
        internal_insert_at(state, db, page, pivot, right)?;
        return Ok(UpAction::Done);
    }

    // split this internal node; the middle key moves up instead of being
    // copied, and its child becomes the new node's ptr_left
    let pivot_idx = count / 2;
    let up_key = btree::materialize_key(state, db, page, pivot_idx)?;
    let old_address = page.rl().address();

    let new_page = state.alloc_page(PageType::BtreeIndex, false)?;
    let new_address = new_page.rl().address();

    btree::free_slot_key(state, db, page, pivot_idx)?;
    {
        let mut new_pg = new_page.wl();
        node::init(&mut new_pg, false);
        let mut old_pg = page.wl();
        let middle_child = node::slot_ptr(&old_pg, &layout, pivot_idx);
        node::set_ptr_left(&mut new_pg, middle_child);
        node::move_slots(&mut old_pg, &mut new_pg, &layout, pivot_idx + 1);
        // the middle slot moved up; drop it from the left half
        node::remove_slot(&mut old_pg, &layout, pivot_idx);
    }
    state.track(page, old_address);
    debug!(
        "split internal node 0x{:x}, new sibling 0x{:x}",
        old_address, new_address
    );

    let target = if btree::compare_keys(db, pivot, &up_key) == Ordering::Less {
        page
    } else {
        &new_page
    };
    internal_insert_at(state, db, target, pivot, right)?;

    Ok(UpAction::Split(up_key, new_address))
}

fn internal_insert_at(
    state: &mut EnvState,
    db: &mut DbState,
    page: &Pod<Page>,
    key: &[u8],
    child: u64,
) -> DbResult {
    let address = page.rl().address();
    let search = btree::search_node(state, db, page, key)?;
    debug_assert!(!search.exact);
    let (inline, key_size, kflags) = btree::encode_slot_key(state, db, key)?;
    let mut pg = page.wl();
    node::insert_slot(&mut pg, &db.layout, search.insert_at);
    node::set_slot(
        &mut pg,
        &db.layout,
        search.insert_at,
        child,
        key_size,
        kflags,
        &inline,
    );
    drop(pg);
    state.track(page, address);
    Ok(())
}

/// The root split: the old root becomes an inner node below a fresh root.
fn grow_root(state: &mut EnvState, db: &mut DbState, pivot: Vec<u8>, right: u64) -> DbResult {
    let old_root = db.root_address;
    let new_root = state.alloc_page(PageType::BtreeRoot, false)?;
    let new_address = new_root.rl().address();
    {
        let mut pg = new_root.wl();
        node::init(&mut pg, false);
        node::set_ptr_left(&mut pg, old_root);
    }
    internal_insert_at(state, db, &new_root, &pivot, right)?;

    let old = btree::fetch_node(state, old_root)?;
    old.wl().set_page_type(PageType::BtreeIndex);
    state.track(&old, old_root);

    db.root_address = new_address;
    crate::env::persist_root_address(state, db.name, new_address)?;
    debug!("new root 0x{:x} above 0x{:x}", new_address, old_root);
    Ok(())
}

/// `HINT_APPEND`/`HINT_PREPEND`: drop straight into the edge leaf when the
/// hint holds and the leaf has room; anything else falls back to a full
/// descent.
fn try_edge_insert(
    state: &mut EnvState,
    db: &mut DbState,
    key: &[u8],
    record: &Record,
    flags: InsertFlags,
) -> Result<bool> {
    let append = flags.contains(InsertFlags::HINT_APPEND);
    let leaf = if append {
        btree::rightmost_leaf(state, db)?
    } else {
        btree::leftmost_leaf(state, db)?
    };
    let count = node::count(&leaf.rl());
    if count == 0 || count >= db.layout.max_keys {
        return Ok(false);
    }
    let edge_slot = if append { count - 1 } else { 0 };
    let edge_key = btree::materialize_key(state, db, &leaf, edge_slot)?;
    let cmp = btree::compare_keys(db, key, &edge_key);
    let holds = if append {
        cmp == Ordering::Greater
    } else {
        cmp == Ordering::Less
    };
    if !holds {
        return Ok(false);
    }
    let index = if append { count } else { 0 };
    fill_new_slot(state, db, &leaf, index, key, record, flags)?;
    Ok(true)
}
