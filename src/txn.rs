//! Transactions: operations buffered in an in-memory op tree per database,
//! applied through the B-tree at commit, discarded on abort.
//!
//! Keys touched by an uncommitted transaction are claimed; another
//! transaction (or a non-transactional operation) touching the same key
//! fails with `TxnConflict` until the claim is released.

use std::{
    collections::{BTreeMap, HashMap},
    ops::Bound,
    sync::RwLock,
};

use crate::{
    dupe::DupePosition,
    flags::{InsertFlags, TxnFlags},
    record::Record,
};

/// A transaction handle. Created by `Environment::txn_begin`, consumed by
/// `txn_commit` / `txn_abort`.
pub struct Transaction {
    pub(crate) id: u64,
    pub(crate) flags: TxnFlags,
    pub(crate) state: RwLock<TxnState>,
}

impl Transaction {
    pub(crate) fn new(id: u64, flags: TxnFlags) -> Self {
        Self {
            id,
            flags,
            state: RwLock::new(TxnState {
                next_seq: 0,
                dbs: HashMap::new(),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_read_only(&self) -> bool {
        self.flags.contains(TxnFlags::READ_ONLY)
    }
}

pub(crate) struct TxnState {
    next_seq: u64,
    /// Op trees keyed by database name.
    pub dbs: HashMap<u16, TxnTree>,
}

impl TxnState {
    pub fn record_op(
        &mut self,
        db_name: u16,
        key: Vec<u8>,
        kind: TxnOpKind,
        record: Option<Record>,
        flags: InsertFlags,
        dup_pos: Option<DupePosition>,
    ) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        let tree = self.dbs.entry(db_name).or_insert_with(TxnTree::new);
        tree.ops.entry(key).or_insert_with(Vec::new).push(TxnOp {
            seq,
            kind,
            record,
            flags,
            dup_pos,
        });
        seq
    }

    pub fn tree(&self, db_name: u16) -> Option<&TxnTree> {
        self.dbs.get(&db_name)
    }

    /// All ops of the transaction across databases, in chronological order.
    pub fn drain_ordered(&mut self) -> Vec<(u16, Vec<u8>, TxnOp)> {
        let mut all = Vec::new();
        for (name, tree) in self.dbs.drain() {
            for (key, ops) in tree.ops {
                for op in ops {
                    all.push((name, key.clone(), op));
                }
            }
        }
        all.sort_by_key(|(_, _, op)| op.seq);
        all
    }
}

/// Ordered op map of one database inside one transaction. Keys compare
/// bytewise, which matches both the binary comparator and the big-endian
/// record-number encoding.
pub(crate) struct TxnTree {
    pub ops: BTreeMap<Vec<u8>, Vec<TxnOp>>,
}

impl TxnTree {
    fn new() -> Self {
        Self {
            ops: BTreeMap::new(),
        }
    }

    pub fn ops_for(&self, key: &[u8]) -> Option<&Vec<TxnOp>> {
        self.ops.get(key)
    }

    /// Smallest op key strictly greater than `after` (or the smallest at
    /// all with `None`).
    pub fn next_key(&self, after: Option<&[u8]>) -> Option<(&Vec<u8>, &Vec<TxnOp>)> {
        let range = match after {
            Some(key) => self
                .ops
                .range::<[u8], _>((Bound::Excluded(key), Bound::Unbounded)),
            None => self.ops.range::<[u8], _>(..),
        };
        range.into_iter().next().map(|(k, v)| (k, v))
    }

    /// Largest op key strictly smaller than `before` (or the largest at
    /// all with `None`).
    pub fn prev_key(&self, before: Option<&[u8]>) -> Option<(&Vec<u8>, &Vec<TxnOp>)> {
        let range = match before {
            Some(key) => self
                .ops
                .range::<[u8], _>((Bound::Unbounded, Bound::Excluded(key))),
            None => self.ops.range::<[u8], _>(..),
        };
        range.into_iter().next_back().map(|(k, v)| (k, v))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TxnOpKind {
    Insert,
    Erase,
    /// Erase one entry of the key's merged duplicate list.
    EraseDup(u32),
}

#[derive(Debug, Clone)]
pub(crate) struct TxnOp {
    pub seq: u64,
    pub kind: TxnOpKind,
    pub record: Option<Record>,
    pub flags: InsertFlags,
    pub dup_pos: Option<DupePosition>,
}

/// How a key looks through a transaction's op list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Visibility {
    /// No op changes the key's existence.
    Untouched,
    /// The newest decisive op erased the key.
    Erased,
    /// The newest decisive op (re-)inserted the key; the index points into
    /// the op list.
    Inserted(usize),
}

/// Resolve the newest decisive op. Duplicate erases do not decide
/// existence by themselves; whether entries remain is the duplicate
/// cache's business.
pub(crate) fn visibility(ops: &[TxnOp]) -> Visibility {
    for (index, op) in ops.iter().enumerate().rev() {
        match op.kind {
            TxnOpKind::Erase => return Visibility::Erased,
            TxnOpKind::Insert => return Visibility::Inserted(index),
            TxnOpKind::EraseDup(_) => continue,
        }
    }
    Visibility::Untouched
}
