//! Key lookup, including the approximate-match flavours that promote the
//! nearest neighbour when the key itself is absent.

use crate::{
    btree::{self, node},
    db::DbState,
    env::EnvState,
    error::Error,
    flags::{FindFlags, Match},
    types::Result,
    utils::HandyRwLock,
};

/// A located slot. `key` is the materialized full key of that slot, which
/// differs from the lookup key for approximate matches.
#[derive(Debug, Clone)]
pub(crate) struct FindResult {
    pub page: u64,
    pub slot: usize,
    pub key: Vec<u8>,
    pub match_kind: Match,
}

pub(crate) fn find(
    state: &mut EnvState,
    db: &mut DbState,
    key: &[u8],
    flags: FindFlags,
) -> Result<FindResult> {
    let leaf = btree::find_leaf(state, db, key)?;
    let address = leaf.rl().address();
    let search = btree::search_node(state, db, &leaf, key)?;

    if search.exact {
        let want_exact = flags.contains(FindFlags::EXACT_MATCH) || !flags.is_approximate();
        if want_exact {
            return result_at(state, db, address, search.insert_at, Match::Exact);
        }
        // strictly-less / strictly-greater lookups step off the exact hit
        if flags.contains(FindFlags::LT_MATCH) {
            if let Some((page, slot)) = btree::prev_slot(state, address, search.insert_at)? {
                return result_at(state, db, page, slot, Match::Less);
            }
            if flags.contains(FindFlags::GT_MATCH) {
                if let Some((page, slot)) =
                    btree::next_slot(state, address, search.insert_at)?
                {
                    return result_at(state, db, page, slot, Match::Greater);
                }
            }
            return Err(Error::KeyNotFound);
        }
        if let Some((page, slot)) = btree::next_slot(state, address, search.insert_at)? {
            return result_at(state, db, page, slot, Match::Greater);
        }
        return Err(Error::KeyNotFound);
    }

    if !flags.is_approximate() {
        return Err(Error::KeyNotFound);
    }

    // the nearest smaller key sits directly before the insertion point,
    // possibly in the left sibling; the nearest greater key at the
    // insertion point itself, possibly in the right sibling
    if flags.contains(FindFlags::LT_MATCH) {
        let candidate = if search.insert_at > 0 {
            Some((address, search.insert_at - 1))
        } else {
            btree::prev_slot(state, address, 0)?
        };
        if let Some((page, slot)) = candidate {
            return result_at(state, db, page, slot, Match::Less);
        }
        // fall through to the greater side when it is requested too
    }
    if flags.contains(FindFlags::GT_MATCH) {
        let count = {
            let page = btree::fetch_node(state, address)?;
            let n = node::count(&page.rl());
            n
        };
        let candidate = if search.insert_at < count {
            Some((address, search.insert_at))
        } else if count == 0 {
            btree::next_slot(state, address, 0)?
        } else {
            btree::next_slot(state, address, count - 1)?
        };
        if let Some((page, slot)) = candidate {
            return result_at(state, db, page, slot, Match::Greater);
        }
    }
    Err(Error::KeyNotFound)
}

fn result_at(
    state: &mut EnvState,
    db: &mut DbState,
    page_address: u64,
    slot: usize,
    match_kind: Match,
) -> Result<FindResult> {
    let page = btree::fetch_node(state, page_address)?;
    let key = btree::materialize_key(state, db, &page, slot)?;
    Ok(FindResult {
        page: page_address,
        slot,
        key,
        match_kind,
    })
}
