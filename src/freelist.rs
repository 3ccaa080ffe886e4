//! Tracks reusable byte ranges and whole pages inside the file.
//!
//! Sub-page extents are grouped in power-of-two size classes measured in
//! 32-byte chunks; whole pages live in a bitmap keyed by page index. Every
//! extent lies fully within one page's post-header region and extents never
//! overlap.

use bit_vec::BitVec;
use log::debug;

use crate::{
    config::CHUNK_SIZE,
    error::Error,
    io::{read_into, ByteWriter, Decodeable, Encodeable},
    page::PAGE_HEADER_SIZE,
    types::Result,
};

/// Number of power-of-two size classes. The topmost class also serves all
/// larger requests.
pub(crate) const SPREAD: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FreeExtent {
    address: u64,
    size: u32,
}

pub(crate) struct Freelist {
    page_size: u32,
    /// First usable chunk offset inside a page: the page header rounded up
    /// to the blob alignment. The sliver between the header and this
    /// offset belongs to no extent and is reclaimed when the page is
    /// promoted back to the bitmap.
    first_chunk_offset: u32,
    buckets: Vec<Vec<FreeExtent>>,
    /// Bit per page index; set means the whole page is free.
    page_bitmap: BitVec,
    dirty: bool,
}

fn bucket_index(size: u32) -> usize {
    let chunks = ((size + CHUNK_SIZE - 1) / CHUNK_SIZE).max(1);
    let class = (31 - chunks.leading_zeros()) as usize;
    class.min(SPREAD - 1)
}

impl Freelist {
    pub fn new(page_size: u32, blob_alignment: u32) -> Self {
        let first_chunk_offset =
            crate::utils::align_up(PAGE_HEADER_SIZE as u64, blob_alignment as u64) as u32;
        Self {
            page_size,
            first_chunk_offset,
            buckets: vec![Vec::new(); SPREAD],
            page_bitmap: BitVec::new(),
            dirty: false,
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    /// First-fit allocation of a sub-page byte range. Returns the address
    /// and the granted size: when the remainder after carving would be
    /// smaller than one chunk, the whole extent is taken.
    pub fn alloc_chunk(&mut self, size: u32) -> Option<(u64, u32)> {
        debug_assert!(size > 0 && size < self.page_size);
        for class in bucket_index(size)..SPREAD {
            // lowest address wins to keep the file compact
            let mut best: Option<usize> = None;
            for (i, ext) in self.buckets[class].iter().enumerate() {
                if ext.size >= size {
                    match best {
                        Some(b) if self.buckets[class][b].address <= ext.address => {}
                        _ => best = Some(i),
                    }
                }
            }
            if let Some(i) = best {
                let ext = self.buckets[class].swap_remove(i);
                self.dirty = true;
                let remainder = ext.size - size;
                if remainder < CHUNK_SIZE {
                    return Some((ext.address, ext.size));
                }
                self.insert_extent(FreeExtent {
                    address: ext.address + size as u64,
                    size: remainder,
                });
                return Some((ext.address, size));
            }
        }
        None
    }

    /// Return a sub-page byte range, coalescing with adjacent free extents
    /// within the same page. A range that grows to cover a page's entire
    /// post-header region is promoted to a whole free page.
    pub fn free_chunk(&mut self, address: u64, size: u32) {
        debug_assert!(size > 0);
        self.dirty = true;

        let page_size = self.page_size as u64;
        let mut merged = FreeExtent { address, size };
        let page_addr = address - address % page_size;

        loop {
            let mut changed = false;
            for bucket in self.buckets.iter_mut() {
                let mut i = 0;
                while i < bucket.len() {
                    let ext = bucket[i];
                    if ext.address - ext.address % page_size != page_addr {
                        i += 1;
                        continue;
                    }
                    if ext.address + ext.size as u64 == merged.address {
                        merged.address = ext.address;
                        merged.size += ext.size;
                        bucket.swap_remove(i);
                        changed = true;
                        continue;
                    }
                    if merged.address + merged.size as u64 == ext.address {
                        merged.size += ext.size;
                        bucket.swap_remove(i);
                        changed = true;
                        continue;
                    }
                    i += 1;
                }
            }
            if !changed {
                break;
            }
        }

        let first_start = page_addr + self.first_chunk_offset as u64;
        let usable = self.page_size - self.first_chunk_offset;
        if merged.address == first_start && merged.size == usable {
            // the page is empty again, reuse it as a whole
            self.free_page(page_addr);
            return;
        }
        self.insert_extent(merged);
    }

    /// Reuse one whole page.
    pub fn alloc_page(&mut self) -> Option<u64> {
        for index in 0..self.page_bitmap.len() {
            if self.page_bitmap[index] {
                self.page_bitmap.set(index, false);
                self.dirty = true;
                return Some(index as u64 * self.page_size as u64);
            }
        }
        None
    }

    /// Reuse `count` contiguous whole pages; returns the first address.
    pub fn alloc_page_run(&mut self, count: usize) -> Option<u64> {
        if count == 0 {
            return None;
        }
        let mut run = 0usize;
        for index in 0..self.page_bitmap.len() {
            if self.page_bitmap[index] {
                run += 1;
                if run == count {
                    let start = index + 1 - count;
                    for i in start..=index {
                        self.page_bitmap.set(i, false);
                    }
                    self.dirty = true;
                    return Some(start as u64 * self.page_size as u64);
                }
            } else {
                run = 0;
            }
        }
        None
    }

    pub fn free_page(&mut self, address: u64) {
        debug_assert!(address % self.page_size as u64 == 0);
        let index = (address / self.page_size as u64) as usize;
        if index >= self.page_bitmap.len() {
            self.page_bitmap.grow(index + 1 - self.page_bitmap.len(), false);
        }
        debug_assert!(!self.page_bitmap[index]);
        self.page_bitmap.set(index, true);
        self.dirty = true;
        debug!("freed page 0x{:x}", address);
    }

    /// Return an arbitrary page-aligned run of whole pages.
    pub fn free_page_run(&mut self, address: u64, count: usize) {
        for i in 0..count {
            self.free_page(address + i as u64 * self.page_size as u64);
        }
    }

    pub fn is_page_free(&self, address: u64) -> bool {
        let index = (address / self.page_size as u64) as usize;
        index < self.page_bitmap.len() && self.page_bitmap[index]
    }


    fn insert_extent(&mut self, ext: FreeExtent) {
        let class = bucket_index(ext.size);
        self.buckets[class].push(ext);
    }
}

/// # Format
///
/// - 4 bytes: page size (sanity check on load)
/// - bit vector: whole-page bitmap
/// - 4 bytes: extent count
/// - per extent: 8 bytes address, 4 bytes size
impl Encodeable for Freelist {
    fn encode_to(&self, buf: &mut Vec<u8>) {
        self.page_size.encode_to(buf);
        self.page_bitmap.encode_to(buf);
        let count: u32 = self.buckets.iter().map(|b| b.len() as u32).sum();
        count.encode_to(buf);
        for bucket in &self.buckets {
            for ext in bucket {
                ext.address.encode_to(buf);
                ext.size.encode_to(buf);
            }
        }
    }
}

impl Freelist {
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = ByteWriter::new();
        writer.write(self);
        writer.into_bytes()
    }

    pub fn decode(page_size: u32, blob_alignment: u32, bytes: &[u8]) -> Result<Self> {
        let mut reader = std::io::Cursor::new(bytes);
        let persisted_size: u32 = read_into(&mut reader)?;
        if persisted_size != page_size {
            return Err(Error::IntegrityViolated(format!(
                "freelist page size mismatch: {} != {}",
                persisted_size, page_size
            )));
        }
        let page_bitmap = BitVec::decode_from(&mut reader)?;
        let count: u32 = read_into(&mut reader)?;
        let mut list = Freelist::new(page_size, blob_alignment);
        list.page_bitmap = page_bitmap;
        for _ in 0..count {
            let address: u64 = read_into(&mut reader)?;
            let size: u32 = read_into(&mut reader)?;
            list.insert_extent(FreeExtent { address, size });
        }
        Ok(list)
    }
}
