//! Erase keys and single duplicates.
//!
//! Leaves may underflow freely; the tree does not rebalance. A leaf that
//! becomes completely empty is unlinked from its siblings and removed from
//! its parent, and a root whose last child disappears shrinks back to an
//! empty leaf, so a fully erased database ends up with exactly one empty
//! root page.

use log::{debug, trace};

use crate::{
    btree::{self, node},
    db::DbState,
    dupe,
    env::EnvState,
    error::Error,
    page::Page,
    record::{free_record, KEY_FLAG_HAS_DUPLICATES, REC_FLAGS_MASK},
    types::{DbResult, Pod, Result},
    utils::HandyRwLock,
};

enum EraseAction {
    Done,
    /// The child page became empty and was freed; the parent must drop its
    /// reference.
    ChildRemoved,
}

/// Erase a key. With `dup_index` only that duplicate goes; otherwise the
/// key disappears with every record it carries.
pub(crate) fn erase(
    state: &mut EnvState,
    db: &mut DbState,
    key: &[u8],
    dup_index: Option<u32>,
) -> DbResult {
    trace!("erase key {}", hex::encode(key));
    let root = db.root_address;
    erase_recursive(state, db, root, key, dup_index, true)?;
    db.generation += 1;
    Ok(())
}

fn erase_recursive(
    state: &mut EnvState,
    db: &mut DbState,
    address: u64,
    key: &[u8],
    dup_index: Option<u32>,
    is_root: bool,
) -> Result<EraseAction> {
    let page = btree::fetch_node(state, address)?;
    if node::is_leaf(&page.rl()) {
        erase_in_leaf(state, db, &page, key, dup_index)?;
        if node::count(&page.rl()) == 0 && !is_root {
            unlink_leaf(state, &page)?;
            let config = state.config.clone();
            state.pm.free_page(&config, address);
            debug!("freed empty leaf 0x{:x}", address);
            return Ok(EraseAction::ChildRemoved);
        }
        return Ok(EraseAction::Done);
    }

    let search = btree::search_node(state, db, &page, key)?;
    let child_slot: i64 = if search.exact {
        search.insert_at as i64
    } else {
        search.insert_at as i64 - 1
    };
    let child = {
        let pg = page.rl();
        if child_slot < 0 {
            node::ptr_left(&pg)
        } else {
            node::slot_ptr(&pg, &db.layout, child_slot as usize)
        }
    };
    match erase_recursive(state, db, child, key, dup_index, false)? {
        EraseAction::Done => Ok(EraseAction::Done),
        EraseAction::ChildRemoved => {
            drop_child(state, db, &page, address, child_slot, is_root)
        }
    }
}

/// Remove a freed child's reference from an internal node, collapsing the
/// node itself when it runs out of children.
fn drop_child(
    state: &mut EnvState,
    db: &mut DbState,
    page: &Pod<Page>,
    address: u64,
    child_slot: i64,
    is_root: bool,
) -> Result<EraseAction> {
    if child_slot >= 0 {
        btree::free_slot_key(state, db, page, child_slot as usize)?;
        let mut pg = page.wl();
        node::remove_slot(&mut pg, &db.layout, child_slot as usize);
        drop(pg);
        state.track(page, address);
        return Ok(EraseAction::Done);
    }

    // the ptr_left child disappeared
    if node::count(&page.rl()) > 0 {
        // the first slot's child takes its place
        btree::free_slot_key(state, db, page, 0)?;
        let mut pg = page.wl();
        let new_left = node::slot_ptr(&pg, &db.layout, 0);
        node::set_ptr_left(&mut pg, new_left);
        node::remove_slot(&mut pg, &db.layout, 0);
        drop(pg);
        state.track(page, address);
        return Ok(EraseAction::Done);
    }

    if is_root {
        // the very last page of the tree: reset to an empty leaf
        let mut pg = page.wl();
        node::init(&mut pg, true);
        drop(pg);
        state.track(page, address);
        debug!("tree is empty, root 0x{:x} reset to a leaf", address);
        return Ok(EraseAction::Done);
    }

    let config = state.config.clone();
    state.pm.free_page(&config, address);
    Ok(EraseAction::ChildRemoved)
}

/// Take an empty leaf out of the sibling chain.
fn unlink_leaf(state: &mut EnvState, page: &Pod<Page>) -> DbResult {
    let (left, right) = {
        let pg = page.rl();
        (node::left(&pg), node::right(&pg))
    };
    if left != 0 {
        let sibling = btree::fetch_node(state, left)?;
        node::set_right(&mut sibling.wl(), right);
        state.track(&sibling, left);
    }
    if right != 0 {
        let sibling = btree::fetch_node(state, right)?;
        node::set_left(&mut sibling.wl(), left);
        state.track(&sibling, right);
    }
    Ok(())
}

fn erase_in_leaf(
    state: &mut EnvState,
    db: &mut DbState,
    leaf: &Pod<Page>,
    key: &[u8],
    dup_index: Option<u32>,
) -> DbResult {
    let search = btree::search_node(state, db, leaf, key)?;
    if !search.exact {
        return Err(Error::KeyNotFound);
    }
    let slot = search.insert_at;
    let (slot_flags, ptr) = {
        let pg = leaf.rl();
        (
            node::slot_flags(&pg, &db.layout, slot),
            node::slot_ptr(&pg, &db.layout, slot),
        )
    };

    if slot_flags & KEY_FLAG_HAS_DUPLICATES != 0 {
        match dup_index {
            Some(index) => {
                let (table, removed, remaining) = dupe::erase(state, ptr, index)?;
                free_record(state, removed.rid, removed.flags)?;
                trace!("erased duplicate {} of key, {} remain", index, remaining);
                if remaining == 0 {
                    dupe::free_table(state, table)?;
                    remove_slot_with_key(state, db, leaf, slot)?;
                } else if table != ptr {
                    let address = leaf.rl().address();
                    let mut pg = leaf.wl();
                    node::set_slot_ptr(&mut pg, &db.layout, slot, table);
                    drop(pg);
                    state.track(leaf, address);
                }
            }
            None => {
                for entry in dupe::entries(state, ptr)? {
                    free_record(state, entry.rid, entry.flags)?;
                }
                dupe::free_table(state, ptr)?;
                remove_slot_with_key(state, db, leaf, slot)?;
            }
        }
        return Ok(());
    }

    if let Some(index) = dup_index {
        // a plain key behaves like a one-entry duplicate list
        if index > 0 {
            return Err(Error::KeyNotFound);
        }
    }
    free_record(state, ptr, slot_flags & REC_FLAGS_MASK)?;
    remove_slot_with_key(state, db, leaf, slot)
}

/// Drop a slot including its extended-key blob.
fn remove_slot_with_key(
    state: &mut EnvState,
    db: &mut DbState,
    page: &Pod<Page>,
    slot: usize,
) -> DbResult {
    btree::free_slot_key(state, db, page, slot)?;
    let address = page.rl().address();
    let mut pg = page.wl();
    node::remove_slot(&mut pg, &db.layout, slot);
    drop(pg);
    state.track(page, address);
    Ok(())
}

/// Free every page, blob, and duplicate table of a database's tree. Used
/// when the database itself is erased.
pub(crate) fn free_tree(state: &mut EnvState, db: &mut DbState) -> DbResult {
    free_subtree(state, db, db.root_address)
}

fn free_subtree(state: &mut EnvState, db: &mut DbState, address: u64) -> DbResult {
    let page = btree::fetch_node(state, address)?;
    let (leaf, count, ptr_left) = {
        let pg = page.rl();
        (node::is_leaf(&pg), node::count(&pg), node::ptr_left(&pg))
    };

    if leaf {
        for i in 0..count {
            let (flags, ptr) = {
                let pg = page.rl();
                (
                    node::slot_flags(&pg, &db.layout, i),
                    node::slot_ptr(&pg, &db.layout, i),
                )
            };
            if flags & KEY_FLAG_HAS_DUPLICATES != 0 {
                for entry in dupe::entries(state, ptr)? {
                    free_record(state, entry.rid, entry.flags)?;
                }
                dupe::free_table(state, ptr)?;
            } else {
                free_record(state, ptr, flags & REC_FLAGS_MASK)?;
            }
            btree::free_slot_key(state, db, &page, i)?;
        }
    } else {
        free_subtree(state, db, ptr_left)?;
        for i in 0..count {
            let child = {
                let pg = page.rl();
                node::slot_ptr(&pg, &db.layout, i)
            };
            free_subtree(state, db, child)?;
            btree::free_slot_key(state, db, &page, i)?;
        }
    }

    let config = state.config.clone();
    state.pm.free_page(&config, address);
    Ok(())
}
