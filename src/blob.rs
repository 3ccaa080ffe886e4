//! The blob store: records too large for a leaf slot live as chunked byte
//! streams behind a header, addressed by their starting file offset.
//!
//! In-memory environments keep blobs in an id-keyed buffer map instead;
//! the upper layers only ever see the 64-bit id.

use std::collections::HashMap;

use log::trace;

use crate::{
    config::CHUNK_SIZE,
    env::EnvState,
    error::Error,
    io::{get_u64, set_u64},
    page_manager::FetchMode,
    record::Record,
    types::{DbResult, Result},
    utils::{align_up, HandyRwLock},
};

pub(crate) const BLOB_HEADER_SIZE: u64 = 32;

/// `{u64 self; u64 alloc_size; u64 size; u32 flags; u32 reserved}`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BlobHeader {
    self_addr: u64,
    alloc_size: u64,
    size: u64,
}

impl BlobHeader {
    fn encode(&self) -> [u8; BLOB_HEADER_SIZE as usize] {
        let mut buf = [0u8; BLOB_HEADER_SIZE as usize];
        set_u64(&mut buf, 0, self.self_addr);
        set_u64(&mut buf, 8, self.alloc_size);
        set_u64(&mut buf, 16, self.size);
        buf
    }

    fn decode(buf: &[u8]) -> Self {
        Self {
            self_addr: get_u64(buf, 0),
            alloc_size: get_u64(buf, 8),
            size: get_u64(buf, 16),
        }
    }
}

/// Blob storage of an in-memory environment.
pub(crate) struct MemBlobStore {
    map: HashMap<u64, Vec<u8>>,
    next_id: u64,
}

impl MemBlobStore {
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
            next_id: 1,
        }
    }

    fn insert(&mut self, content: Vec<u8>) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.map.insert(id, content);
        id
    }
}

/// Store a record as a new blob and return its id.
pub(crate) fn allocate(state: &mut EnvState, record: &Record, partial: bool) -> Result<u64> {
    let content = fresh_content(record, partial);

    if state.config.is_in_memory() {
        return Ok(state.mem_blobs.insert(content));
    }

    let alloc_size = align_up(
        BLOB_HEADER_SIZE + record.size as u64,
        state.config.blob_alignment as u64,
    );
    let space = state.alloc_blob_space(alloc_size)?;
    let header = BlobHeader {
        self_addr: space.address,
        alloc_size: space.granted,
        size: record.size as u64,
    };
    trace!(
        "allocating blob of {} bytes at 0x{:x} ({} granted)",
        record.size,
        space.address,
        space.granted
    );
    let raw = space.address % state.config.page_size as u64 == 0;
    write_chunk(state, space.address, &header.encode(), raw)?;
    write_chunk(state, space.address + BLOB_HEADER_SIZE, &content, raw)?;
    Ok(space.address)
}

/// Read a blob's content, or a partial window of it.
pub(crate) fn read(
    state: &mut EnvState,
    blob_id: u64,
    window: Option<(u32, u32)>,
) -> Result<Vec<u8>> {
    if state.config.is_in_memory() {
        let content = state
            .mem_blobs
            .map
            .get(&blob_id)
            .ok_or(Error::BlobNotFound)?;
        return Ok(apply_window(content, window));
    }

    let header = read_header(state, blob_id)?;
    let (start, len) = match window {
        Some((offset, size)) => {
            let start = std::cmp::min(offset as u64, header.size);
            let len = std::cmp::min(size as u64, header.size - start);
            (start, len)
        }
        None => (0, header.size),
    };
    read_chunk(state, blob_id + BLOB_HEADER_SIZE + start, len as usize)
}


/// Overwrite a blob. The update happens in place when the new content fits
/// into the old allocation; otherwise a new blob is allocated and the old
/// one is freed. Returns the (possibly changed) blob id.
pub(crate) fn overwrite(
    state: &mut EnvState,
    old_id: u64,
    record: &Record,
    partial: bool,
) -> Result<u64> {
    if state.config.is_in_memory() {
        let old = state
            .mem_blobs
            .map
            .get_mut(&old_id)
            .ok_or(Error::BlobNotFound)?;
        if partial {
            old.resize(record.size as usize, 0);
            let at = record.partial_offset as usize;
            old[at..at + record.data.len()].copy_from_slice(&record.data);
        } else {
            *old = record.data.clone();
        }
        return Ok(old_id);
    }

    let old = read_header(state, old_id)?;
    let needed = align_up(
        BLOB_HEADER_SIZE + record.size as u64,
        state.config.blob_alignment as u64,
    );

    if needed <= old.alloc_size {
        let page_size = state.config.page_size as u64;
        let content = if partial {
            let mut old_content =
                read_chunk(state, old_id + BLOB_HEADER_SIZE, old.size as usize)?;
            old_content.resize(record.size as usize, 0);
            let at = record.partial_offset as usize;
            old_content[at..at + record.data.len()].copy_from_slice(&record.data);
            old_content
        } else {
            record.data.clone()
        };

        let mut alloc_size = old.alloc_size;
        // shrink the allocation; the tail goes back to the freelist
        if old_id % page_size == 0 {
            // page run: whole tail pages can be released
            let keep = (align_up(needed, page_size) / page_size) as usize;
            let have = (old.alloc_size / page_size) as usize;
            if keep < have {
                for i in keep..have {
                    state.pm.cache.remove(old_id + i as u64 * page_size);
                }
                state.pm.freelist.free_page_run(
                    old_id + keep as u64 * page_size,
                    have - keep,
                );
                alloc_size = keep as u64 * page_size;
            }
        } else {
            let surplus = old.alloc_size - needed;
            if surplus >= CHUNK_SIZE as u64 {
                state.pm.freelist.free_chunk(old_id + needed, surplus as u32);
                alloc_size = needed;
            }
        }

        let header = BlobHeader {
            self_addr: old_id,
            alloc_size,
            size: record.size as u64,
        };
        let raw = old_id % page_size == 0;
        write_chunk(state, old_id, &header.encode(), raw)?;
        write_chunk(state, old_id + BLOB_HEADER_SIZE, &content, raw)?;
        return Ok(old_id);
    }

    // does not fit: fresh blob, seeded with the old content when the
    // write is partial
    let new_id = if partial {
        let mut content = read_chunk(state, old_id + BLOB_HEADER_SIZE, old.size as usize)?;
        content.resize(record.size as usize, 0);
        let at = record.partial_offset as usize;
        content[at..at + record.data.len()].copy_from_slice(&record.data);
        allocate(state, &Record::from_slice(&content), false)?
    } else {
        allocate(state, record, false)?
    };
    free(state, old_id)?;
    Ok(new_id)
}

/// Release a blob's space back to the freelist.
pub(crate) fn free(state: &mut EnvState, blob_id: u64) -> DbResult {
    if state.config.is_in_memory() {
        state
            .mem_blobs
            .map
            .remove(&blob_id)
            .ok_or(Error::BlobNotFound)?;
        return Ok(());
    }
    let header = read_header(state, blob_id)?;
    trace!(
        "freeing blob at 0x{:x}, {} bytes allocated",
        blob_id,
        header.alloc_size
    );
    let config = state.config.clone();
    state.pm.free_blob(&config, blob_id, header.alloc_size);
    Ok(())
}

fn read_header(state: &mut EnvState, blob_id: u64) -> Result<BlobHeader> {
    let bytes = read_chunk(state, blob_id, BLOB_HEADER_SIZE as usize)?;
    let header = BlobHeader::decode(&bytes);
    // the self field guards against dangling and corrupt blob ids
    if header.self_addr != blob_id {
        return Err(Error::BlobNotFound);
    }
    Ok(header)
}

fn fresh_content(record: &Record, partial: bool) -> Vec<u8> {
    if !partial {
        return record.data.clone();
    }
    // gaps around the window of a fresh partial record read back as zeros
    let mut content = vec![0u8; record.size as usize];
    let at = record.partial_offset as usize;
    content[at..at + record.data.len()].copy_from_slice(&record.data);
    content
}

fn apply_window(content: &[u8], window: Option<(u32, u32)>) -> Vec<u8> {
    match window {
        Some((offset, size)) => {
            let start = std::cmp::min(offset as usize, content.len());
            let end = std::cmp::min(start + size as usize, content.len());
            content[start..end].to_vec()
        }
        None => content.to_vec(),
    }
}

/// Write a byte range, page by page. With recovery enabled every byte goes
/// through the cache so the change set and the log see it; without it the
/// bytes go straight to the device, touching the cache only for pages that
/// happen to be cached.
fn write_chunk(state: &mut EnvState, address: u64, data: &[u8], raw_run: bool) -> DbResult {
    let page_size = state.config.page_size as u64;
    let mut done = 0usize;
    while done < data.len() {
        let pos = address + done as u64;
        let page_addr = pos - pos % page_size;
        let in_page = (pos - page_addr) as usize;
        let n = std::cmp::min(data.len() - done, page_size as usize - in_page);

        let through_cache =
            state.config.recovery_enabled() || state.pm.cache.contains(page_addr);
        if through_cache {
            let page = state
                .fetch(page_addr, FetchMode::Normal, raw_run)?
                .expect("normal fetch returns a page");
            state.pm.changeset.put(&page, page_addr);
            let mut pg = page.wl();
            pg.raw_data_mut()[in_page..in_page + n]
                .copy_from_slice(&data[done..done + n]);
        } else {
            state.device.write(pos, &data[done..done + n])?;
        }
        done += n;
    }
    Ok(())
}

/// Read a byte range, honoring cached pages that are newer than the file.
fn read_chunk(state: &mut EnvState, address: u64, len: usize) -> Result<Vec<u8>> {
    let page_size = state.config.page_size as u64;
    let mut out = vec![0u8; len];
    let mut done = 0usize;
    while done < len {
        let pos = address + done as u64;
        let page_addr = pos - pos % page_size;
        let in_page = (pos - page_addr) as usize;
        let n = std::cmp::min(len - done, page_size as usize - in_page);

        if let Some(page) = state.fetch(page_addr, FetchMode::CacheOnly, false)? {
            let pg = page.rl();
            out[done..done + n].copy_from_slice(&pg.raw_data()[in_page..in_page + n]);
        } else {
            state.device.read(pos, &mut out[done..done + n])?;
        }
        done += n;
    }
    Ok(out)
}

