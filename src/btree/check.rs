//! Structural integrity check: key ordering inside every node, parent
//! bounds on every child, sibling ordering along the leaf chain, and
//! `ptr_left` discipline.

use std::cmp::Ordering;

use log::warn;

use crate::{
    btree::{self, node},
    db::DbState,
    env::EnvState,
    error::Error,
    types::DbResult,
    utils::HandyRwLock,
};

pub(crate) fn check_integrity(state: &mut EnvState, db: &mut DbState) -> DbResult {
    check_node(state, db, db.root_address, None, None)?;
    check_leaf_chain(state, db)
}

fn violation(message: String) -> crate::error::Error {
    warn!("integrity check failed: {}", message);
    Error::IntegrityViolated(message)
}

/// Every key in the subtree under `address` must fall into
/// `[lower, upper)`.
fn check_node(
    state: &mut EnvState,
    db: &mut DbState,
    address: u64,
    lower: Option<&[u8]>,
    upper: Option<&[u8]>,
) -> DbResult {
    let page = btree::fetch_node(state, address)?;
    let (count, leaf, ptr_left) = {
        let pg = page.rl();
        (node::count(&pg), node::is_leaf(&pg), node::ptr_left(&pg))
    };

    if leaf && ptr_left != 0 {
        return Err(violation(format!(
            "leaf 0x{:x} carries a ptr_left",
            address
        )));
    }
    if !leaf && ptr_left == 0 {
        return Err(violation(format!(
            "internal node 0x{:x} has no ptr_left",
            address
        )));
    }

    let mut keys = Vec::with_capacity(count);
    for i in 0..count {
        keys.push(btree::materialize_key(state, db, &page, i)?);
    }
    for i in 0..count {
        if i > 0 && btree::compare_keys(db, &keys[i - 1], &keys[i]) != Ordering::Less {
            return Err(violation(format!(
                "node 0x{:x}: keys {} and {} are out of order",
                address,
                i - 1,
                i
            )));
        }
        if let Some(lo) = lower {
            if btree::compare_keys(db, &keys[i], lo) == Ordering::Less {
                return Err(violation(format!(
                    "node 0x{:x}: key {} underruns its parent bound",
                    address, i
                )));
            }
        }
        if let Some(hi) = upper {
            if btree::compare_keys(db, &keys[i], hi) != Ordering::Less {
                return Err(violation(format!(
                    "node 0x{:x}: key {} overruns its parent bound",
                    address, i
                )));
            }
        }
    }

    if !leaf {
        // child i holds keys in [keys[i], keys[i+1])
        let children: Vec<u64> = {
            let pg = page.rl();
            (0..count)
                .map(|i| node::slot_ptr(&pg, &db.layout, i))
                .collect()
        };
        check_node(
            state,
            db,
            ptr_left,
            lower,
            keys.first().map(|k| k.as_slice()).or(upper),
        )?;
        for i in 0..count {
            let child_upper = if i + 1 < count {
                Some(keys[i + 1].as_slice())
            } else {
                upper
            };
            check_node(state, db, children[i], Some(&keys[i]), child_upper)?;
        }
    }
    Ok(())
}

/// The largest key of every leaf must sort strictly below the smallest key
/// of its right sibling, and the back pointers must mirror the chain.
fn check_leaf_chain(state: &mut EnvState, db: &mut DbState) -> DbResult {
    let mut page = btree::leftmost_leaf(state, db)?;
    let mut previous: Option<(u64, Vec<u8>)> = None;
    loop {
        let (address, count, right) = {
            let pg = page.rl();
            (pg.address(), node::count(&pg), node::right(&pg))
        };
        if count > 0 {
            let first = btree::materialize_key(state, db, &page, 0)?;
            if let Some((prev_address, prev_last)) = &previous {
                if btree::compare_keys(db, prev_last, &first) != Ordering::Less {
                    return Err(violation(format!(
                        "leaves 0x{:x} and 0x{:x} overlap",
                        prev_address, address
                    )));
                }
            }
            let last = btree::materialize_key(state, db, &page, count - 1)?;
            previous = Some((address, last));
        }
        if right == 0 {
            return Ok(());
        }
        let sibling = btree::fetch_node(state, right)?;
        if node::left(&sibling.rl()) != address {
            return Err(violation(format!(
                "leaf 0x{:x} does not point back at 0x{:x}",
                right, address
            )));
        }
        page = sibling;
    }
}
