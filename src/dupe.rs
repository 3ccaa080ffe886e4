//! The duplicate store: when a key carries more than one record, the leaf
//! slot points at a duplicate table instead. The table is a blob holding a
//! counted array of record references with the same inline encoding as a
//! leaf slot.

use crate::{
    blob,
    env::EnvState,
    error::Error,
    io::{get_u32, get_u64, set_u32, set_u64},
    record::Record,
    types::{DbResult, Result},
};

pub(crate) const DUPE_ENTRY_SIZE: usize = 16;
const TABLE_HEADER_SIZE: usize = 8;
const INITIAL_CAPACITY: u32 = 8;

/// One record reference inside a duplicate table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DupeEntry {
    pub rid: u64,
    pub flags: u8,
}

/// Where a new duplicate lands relative to the existing list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DupePosition {
    First,
    Last,
    Before(u32),
    After(u32),
}

struct Table {
    count: u32,
    capacity: u32,
    entries: Vec<DupeEntry>,
}

impl Table {
    fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < TABLE_HEADER_SIZE {
            return Err(Error::IntegrityViolated(
                "duplicate table is truncated".into(),
            ));
        }
        let count = get_u32(bytes, 0);
        let capacity = get_u32(bytes, 4);
        if bytes.len() < TABLE_HEADER_SIZE + capacity as usize * DUPE_ENTRY_SIZE
            || count > capacity
        {
            return Err(Error::IntegrityViolated(
                "duplicate table is truncated".into(),
            ));
        }
        let mut entries = Vec::with_capacity(count as usize);
        for i in 0..count as usize {
            let at = TABLE_HEADER_SIZE + i * DUPE_ENTRY_SIZE;
            entries.push(DupeEntry {
                rid: get_u64(bytes, at),
                flags: bytes[at + 8],
            });
        }
        Ok(Self {
            count,
            capacity,
            entries,
        })
    }

    fn encode(&self) -> Vec<u8> {
        let mut bytes =
            vec![0u8; TABLE_HEADER_SIZE + self.capacity as usize * DUPE_ENTRY_SIZE];
        set_u32(&mut bytes, 0, self.count);
        set_u32(&mut bytes, 4, self.capacity);
        for (i, entry) in self.entries.iter().enumerate() {
            let at = TABLE_HEADER_SIZE + i * DUPE_ENTRY_SIZE;
            set_u64(&mut bytes, at, entry.rid);
            bytes[at + 8] = entry.flags;
        }
        bytes
    }
}

fn load(state: &mut EnvState, table_id: u64) -> Result<Table> {
    let bytes = blob::read(state, table_id, None)?;
    Table::decode(&bytes)
}

fn store(state: &mut EnvState, table_id: u64, table: &Table) -> Result<u64> {
    let bytes = table.encode();
    blob::overwrite(state, table_id, &Record::from_slice(&bytes), false)
}

/// Create a fresh table from the first two duplicates of a key.
pub(crate) fn create_table(
    state: &mut EnvState,
    first: DupeEntry,
    second: DupeEntry,
) -> Result<u64> {
    let table = Table {
        count: 2,
        capacity: INITIAL_CAPACITY,
        entries: vec![first, second],
    };
    let bytes = table.encode();
    blob::allocate(state, &Record::from_slice(&bytes), false)
}

/// Insert an entry. Returns the (possibly relocated) table id and the index
/// the entry landed at.
pub(crate) fn insert(
    state: &mut EnvState,
    table_id: u64,
    position: DupePosition,
    entry: DupeEntry,
) -> Result<(u64, u32)> {
    let mut table = load(state, table_id)?;
    let index = match position {
        DupePosition::First => 0,
        DupePosition::Last => table.count,
        DupePosition::Before(i) => std::cmp::min(i, table.count),
        DupePosition::After(i) => std::cmp::min(i + 1, table.count),
    };
    table.entries.insert(index as usize, entry);
    table.count += 1;
    if table.count > table.capacity {
        table.capacity *= 2;
    }
    let new_id = store(state, table_id, &table)?;
    Ok((new_id, index))
}

/// Remove the entry at `index` and return it together with the remaining
/// count. Freeing the removed record and, at count zero, the table itself
/// is the caller's business.
pub(crate) fn erase(
    state: &mut EnvState,
    table_id: u64,
    index: u32,
) -> Result<(u64, DupeEntry, u32)> {
    let mut table = load(state, table_id)?;
    if index >= table.count {
        return Err(Error::KeyNotFound);
    }
    let removed = table.entries.remove(index as usize);
    table.count -= 1;
    let remaining = table.count;
    let new_id = store(state, table_id, &table)?;
    Ok((new_id, removed, remaining))
}

pub(crate) fn count(state: &mut EnvState, table_id: u64) -> Result<u32> {
    Ok(load(state, table_id)?.count)
}

pub(crate) fn get(state: &mut EnvState, table_id: u64, index: u32) -> Result<DupeEntry> {
    let table = load(state, table_id)?;
    table
        .entries
        .get(index as usize)
        .copied()
        .ok_or(Error::KeyNotFound)
}

pub(crate) fn entries(state: &mut EnvState, table_id: u64) -> Result<Vec<DupeEntry>> {
    Ok(load(state, table_id)?.entries)
}

/// Replace the record reference at `index`.
pub(crate) fn overwrite_entry(
    state: &mut EnvState,
    table_id: u64,
    index: u32,
    entry: DupeEntry,
) -> Result<u64> {
    let mut table = load(state, table_id)?;
    if index >= table.count {
        return Err(Error::KeyNotFound);
    }
    table.entries[index as usize] = entry;
    store(state, table_id, &table)
}

/// Drop the table blob itself.
pub(crate) fn free_table(state: &mut EnvState, table_id: u64) -> DbResult {
    blob::free(state, table_id)
}
