//! The ordered B+-tree over the page store.
//!
//! Internal nodes route through `ptr_left` and per-slot child pointers;
//! leaves carry the record references and are chained through `left`/
//! `right` sibling addresses. Erase tolerates underflow, so routing keys in
//! internal nodes may outlive the slots they once described.

pub(crate) mod check;
pub(crate) mod erase;
pub(crate) mod find;
pub(crate) mod insert;
pub(crate) mod node;

use std::cmp::Ordering;

use log::trace;

use crate::{
    blob,
    db::{DbState, KeyType},
    env::EnvState,
    error::Error,
    page::Page,
    page_manager::FetchMode,
    record::{Record, KEY_FLAG_EXTENDED},
    types::{DbResult, Pod, Result},
    utils::HandyRwLock,
};

/// Result of a binary search inside one node: the insertion point for the
/// key, and whether the slot at `insert_at` is an exact match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Search {
    pub insert_at: usize,
    pub exact: bool,
}

/// Compare two full keys with the database's comparator.
pub(crate) fn compare_keys(db: &DbState, lhs: &[u8], rhs: &[u8]) -> Ordering {
    match db.key_type {
        // lexicographic over the shorter length, tie-broken by length
        KeyType::Binary => lhs.cmp(rhs),
        // record numbers are 8-byte big-endian integers
        KeyType::RecordNumber => {
            let l = recno_of(lhs);
            let r = recno_of(rhs);
            l.cmp(&r)
        }
    }
}

pub(crate) fn recno_of(key: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    let n = std::cmp::min(key.len(), 8);
    buf[..n].copy_from_slice(&key[..n]);
    u64::from_be_bytes(buf)
}

/// Compare `key` against the key stored at `index`, fetching the extended
/// tail only when the inline prefix cannot decide.
pub(crate) fn compare_with_slot(
    state: &mut EnvState,
    db: &mut DbState,
    page: &Pod<Page>,
    index: usize,
    key: &[u8],
) -> Result<Ordering> {
    let layout = db.layout;
    let needs_full = {
        let pg = page.rl();
        let flags = node::slot_flags(&pg, &layout, index);
        if flags & KEY_FLAG_EXTENDED == 0 {
            let slot_key = node::slot_key_prefix(&pg, &layout, index);
            return Ok(compare_keys(db, key, slot_key));
        }
        // fast path on the inline prefix of the extended key
        let prefix = node::slot_key_prefix(&pg, &layout, index);
        let common = std::cmp::min(key.len(), prefix.len());
        match key[..common].cmp(&prefix[..common]) {
            Ordering::Equal => {
                if key.len() <= prefix.len() {
                    // the slot key is strictly longer
                    return Ok(Ordering::Less);
                }
                true
            }
            decided => return Ok(decided),
        }
    };
    debug_assert!(needs_full);
    let slot_key = materialize_key(state, db, page, index)?;
    Ok(compare_keys(db, key, &slot_key))
}

/// The full key bytes of a slot, going through the per-database
/// extended-key cache for spilled tails.
pub(crate) fn materialize_key(
    state: &mut EnvState,
    db: &mut DbState,
    page: &Pod<Page>,
    index: usize,
) -> Result<Vec<u8>> {
    let layout = db.layout;
    let (prefix, blob_id) = {
        let pg = page.rl();
        let flags = node::slot_flags(&pg, &layout, index);
        if flags & KEY_FLAG_EXTENDED == 0 {
            return Ok(node::slot_key_prefix(&pg, &layout, index).to_vec());
        }
        (
            node::slot_key_prefix(&pg, &layout, index).to_vec(),
            node::slot_extended_blob(&pg, &layout, index),
        )
    };
    if let Some(full) = db.extkey_cache.get(&blob_id) {
        return Ok(full.clone());
    }
    let tail = blob::read(state, blob_id, None)?;
    let mut full = prefix;
    full.extend_from_slice(&tail);
    db.extkey_cache.insert(blob_id, full.clone());
    Ok(full)
}

/// Binary search among the slots of one node.
pub(crate) fn search_node(
    state: &mut EnvState,
    db: &mut DbState,
    page: &Pod<Page>,
    key: &[u8],
) -> Result<Search> {
    let count = node::count(&page.rl());
    let mut lo = 0usize;
    let mut hi = count;
    while lo < hi {
        let mid = (lo + hi) / 2;
        match compare_with_slot(state, db, page, mid, key)? {
            Ordering::Less => hi = mid,
            Ordering::Greater => lo = mid + 1,
            Ordering::Equal => {
                return Ok(Search {
                    insert_at: mid,
                    exact: true,
                })
            }
        }
    }
    Ok(Search {
        insert_at: lo,
        exact: false,
    })
}

/// The child an internal node routes `key` to.
pub(crate) fn child_for(
    state: &mut EnvState,
    db: &mut DbState,
    page: &Pod<Page>,
    key: &[u8],
) -> Result<u64> {
    let search = search_node(state, db, page, key)?;
    let pg = page.rl();
    let layout = db.layout;
    if search.exact {
        return Ok(node::slot_ptr(&pg, &layout, search.insert_at));
    }
    if search.insert_at == 0 {
        Ok(node::ptr_left(&pg))
    } else {
        Ok(node::slot_ptr(&pg, &layout, search.insert_at - 1))
    }
}

pub(crate) fn fetch_node(state: &mut EnvState, address: u64) -> Result<Pod<Page>> {
    Ok(state
        .fetch(address, FetchMode::Normal, false)?
        .expect("normal fetch returns a page"))
}

/// Descend from the root to the leaf that owns `key`.
pub(crate) fn find_leaf(
    state: &mut EnvState,
    db: &mut DbState,
    key: &[u8],
) -> Result<Pod<Page>> {
    let mut page = fetch_node(state, db.root_address)?;
    loop {
        if node::is_leaf(&page.rl()) {
            return Ok(page);
        }
        let child = child_for(state, db, &page, key)?;
        if child == 0 {
            return Err(Error::IntegrityViolated(
                "internal node routes to page 0".into(),
            ));
        }
        page = fetch_node(state, child)?;
    }
}

/// Leftmost (smallest-keys) leaf of the tree.
pub(crate) fn leftmost_leaf(state: &mut EnvState, db: &DbState) -> Result<Pod<Page>> {
    let mut page = fetch_node(state, db.root_address)?;
    loop {
        if node::is_leaf(&page.rl()) {
            return Ok(page);
        }
        let child = node::ptr_left(&page.rl());
        page = fetch_node(state, child)?;
    }
}

/// Rightmost (largest-keys) leaf of the tree.
pub(crate) fn rightmost_leaf(state: &mut EnvState, db: &mut DbState) -> Result<Pod<Page>> {
    let mut page = fetch_node(state, db.root_address)?;
    loop {
        let (leaf, child) = {
            let pg = page.rl();
            if node::is_leaf(&pg) {
                (true, 0)
            } else {
                let n = node::count(&pg);
                let child = if n == 0 {
                    node::ptr_left(&pg)
                } else {
                    node::slot_ptr(&pg, &db.layout, n - 1)
                };
                (false, child)
            }
        };
        if leaf {
            return Ok(page);
        }
        page = fetch_node(state, child)?;
    }
}

/// The slot after `(page, slot)` in key order, crossing leaf siblings and
/// stepping over empty leaves.
pub(crate) fn next_slot(
    state: &mut EnvState,
    page_address: u64,
    slot: usize,
) -> Result<Option<(u64, usize)>> {
    let page = fetch_node(state, page_address)?;
    let (count, mut right) = {
        let pg = page.rl();
        (node::count(&pg), node::right(&pg))
    };
    if slot + 1 < count {
        return Ok(Some((page_address, slot + 1)));
    }
    while right != 0 {
        let sibling = fetch_node(state, right)?;
        let pg = sibling.rl();
        if node::count(&pg) > 0 {
            return Ok(Some((right, 0)));
        }
        right = node::right(&pg);
    }
    Ok(None)
}

/// The slot before `(page, slot)` in key order.
pub(crate) fn prev_slot(
    state: &mut EnvState,
    page_address: u64,
    slot: usize,
) -> Result<Option<(u64, usize)>> {
    if slot > 0 {
        return Ok(Some((page_address, slot - 1)));
    }
    let page = fetch_node(state, page_address)?;
    let mut left = node::left(&page.rl());
    while left != 0 {
        let sibling = fetch_node(state, left)?;
        let pg = sibling.rl();
        let count = node::count(&pg);
        if count > 0 {
            return Ok(Some((left, count - 1)));
        }
        left = node::left(&pg);
    }
    Ok(None)
}

/// First occupied slot of the tree, or `None` when it is empty.
pub(crate) fn first_slot(state: &mut EnvState, db: &DbState) -> Result<Option<(u64, usize)>> {
    let page = leftmost_leaf(state, db)?;
    let (address, count, right) = {
        let pg = page.rl();
        (pg.address(), node::count(&pg), node::right(&pg))
    };
    if count > 0 {
        return Ok(Some((address, 0)));
    }
    let mut right = right;
    while right != 0 {
        let sibling = fetch_node(state, right)?;
        let pg = sibling.rl();
        if node::count(&pg) > 0 {
            return Ok(Some((right, 0)));
        }
        right = node::right(&pg);
    }
    Ok(None)
}

/// Last occupied slot of the tree.
pub(crate) fn last_slot(
    state: &mut EnvState,
    db: &mut DbState,
) -> Result<Option<(u64, usize)>> {
    let page = rightmost_leaf(state, db)?;
    let (address, count, left) = {
        let pg = page.rl();
        (pg.address(), node::count(&pg), node::left(&pg))
    };
    if count > 0 {
        return Ok(Some((address, count - 1)));
    }
    let mut left = left;
    while left != 0 {
        let sibling = fetch_node(state, left)?;
        let pg = sibling.rl();
        let count = node::count(&pg);
        if count > 0 {
            return Ok(Some((left, count - 1)));
        }
        left = node::left(&pg);
    }
    Ok(None)
}

/// Encode a key for storage in a slot. Oversized keys spill their tail
/// into a blob and the id is planted in the last 8 inline bytes.
pub(crate) fn encode_slot_key(
    state: &mut EnvState,
    db: &mut DbState,
    key: &[u8],
) -> Result<(Vec<u8>, u16, u8)> {
    if key.len() > u16::MAX as usize {
        return Err(Error::InvKeySize);
    }
    let ksm = db.layout.key_size_max as usize;
    if key.len() <= ksm {
        return Ok((key.to_vec(), key.len() as u16, 0));
    }
    if !db.flags.contains(crate::flags::DbFlags::ENABLE_EXTENDED_KEYS) {
        return Err(Error::InvKeySize);
    }
    let split = ksm - 8;
    let tail = Record::from_slice(&key[split..]);
    let blob_id = blob::allocate(state, &tail, false)?;
    let mut inline = key[..split].to_vec();
    inline.extend_from_slice(&blob_id.to_le_bytes());
    db.extkey_cache.insert(blob_id, key.to_vec());
    trace!(
        "extended key of {} bytes, tail in blob 0x{:x}",
        key.len(),
        blob_id
    );
    Ok((inline, key.len() as u16, KEY_FLAG_EXTENDED))
}

/// Release the extended-key blob of a slot, if any.
pub(crate) fn free_slot_key(
    state: &mut EnvState,
    db: &mut DbState,
    page: &Pod<Page>,
    index: usize,
) -> DbResult {
    let layout = db.layout;
    let blob_id = {
        let pg = page.rl();
        if node::slot_flags(&pg, &layout, index) & KEY_FLAG_EXTENDED == 0 {
            return Ok(());
        }
        node::slot_extended_blob(&pg, &layout, index)
    };
    db.extkey_cache.remove(&blob_id);
    blob::free(state, blob_id)
}

/// Number of keys in the tree; with `distinct` every key counts once, no
/// matter how many duplicates it carries.
pub(crate) fn key_count(
    state: &mut EnvState,
    db: &mut DbState,
    distinct: bool,
) -> Result<u64> {
    let mut total = 0u64;
    let mut cursor = first_slot(state, db)?;
    while let Some((address, slot)) = cursor {
        let (flags, ptr) = {
            let page = fetch_node(state, address)?;
            let pg = page.rl();
            (
                node::slot_flags(&pg, &db.layout, slot),
                node::slot_ptr(&pg, &db.layout, slot),
            )
        };
        if !distinct && flags & crate::record::KEY_FLAG_HAS_DUPLICATES != 0 {
            total += crate::dupe::count(state, ptr)? as u64;
        } else {
            total += 1;
        }
        cursor = next_slot(state, address, slot)?;
    }
    Ok(total)
}
