//! The in-memory descriptor of one page-sized buffer.
//!
//! Pages reference each other by file address only; the cache hash is the
//! single structure resolving an address to an in-memory `Page`.

use crate::io::{get_u32, set_u32};

/// Bytes of persisted header at the start of every page: a type tag and two
/// reserved words.
pub(crate) const PAGE_HEADER_SIZE: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    Unknown,
    /// The environment header page at address 0.
    Header,
    /// Root node of a B-tree.
    BtreeRoot,
    /// Inner or leaf node of a B-tree.
    BtreeIndex,
    /// Freelist overflow page (reserved tag, the state lives in the
    /// page-manager chain).
    Freelist,
    /// First page of a blob.
    Blob,
    /// Serialized page-manager state (freelist image).
    PageManagerState,
}

impl PageType {
    pub(crate) fn to_tag(self) -> u32 {
        match self {
            PageType::Unknown => 0x0000_0000,
            PageType::Header => 0x1000_0000,
            PageType::BtreeRoot => 0x2000_0000,
            PageType::BtreeIndex => 0x3000_0000,
            PageType::Freelist => 0x4000_0000,
            PageType::Blob => 0x5000_0000,
            PageType::PageManagerState => 0x6000_0000,
        }
    }

    pub(crate) fn from_tag(tag: u32) -> PageType {
        match tag {
            0x1000_0000 => PageType::Header,
            0x2000_0000 => PageType::BtreeRoot,
            0x3000_0000 => PageType::BtreeIndex,
            0x4000_0000 => PageType::Freelist,
            0x5000_0000 => PageType::Blob,
            0x6000_0000 => PageType::PageManagerState,
            _ => PageType::Unknown,
        }
    }
}

pub struct Page {
    /// Byte offset of this page in the file; doubles as the page id.
    address: u64,

    /// The full page-sized buffer, including the persisted header.
    data: Vec<u8>,

    dirty: bool,

    /// Raw blob continuation pages carry no page header; the entire buffer
    /// is payload.
    no_header: bool,

    /// Number of cursors currently coupled to this page. A referenced page
    /// is never evicted.
    cursor_refs: u32,

    /// LSN of the last log entry written for this page. Used to avoid
    /// duplicate entries within one change-set flush.
    last_lsn: u64,
}

impl Page {
    /// A fresh zeroed page.
    pub(crate) fn new(address: u64, page_size: usize) -> Self {
        Self {
            address,
            data: vec![0u8; page_size],
            dirty: false,
            no_header: false,
            cursor_refs: 0,
            last_lsn: 0,
        }
    }

    pub(crate) fn from_bytes(address: u64, data: Vec<u8>) -> Self {
        Self {
            address,
            data,
            dirty: false,
            no_header: false,
            cursor_refs: 0,
            last_lsn: 0,
        }
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn page_type(&self) -> PageType {
        if self.no_header {
            return PageType::Unknown;
        }
        PageType::from_tag(get_u32(&self.data, 0))
    }

    pub(crate) fn set_page_type(&mut self, ptype: PageType) {
        debug_assert!(!self.no_header);
        set_u32(&mut self.data, 0, ptype.to_tag());
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub(crate) fn set_dirty(&mut self, dirty: bool) {
        self.dirty = dirty;
    }

    pub(crate) fn is_raw(&self) -> bool {
        self.no_header
    }

    pub(crate) fn set_raw(&mut self, raw: bool) {
        self.no_header = raw;
    }

    /// The usable byte region of the page: everything behind the header,
    /// or the full buffer for raw pages.
    pub(crate) fn payload(&self) -> &[u8] {
        if self.no_header {
            &self.data
        } else {
            &self.data[PAGE_HEADER_SIZE..]
        }
    }

    pub(crate) fn payload_mut(&mut self) -> &mut [u8] {
        self.dirty = true;
        if self.no_header {
            &mut self.data
        } else {
            &mut self.data[PAGE_HEADER_SIZE..]
        }
    }

    /// File offset where the payload starts.
    pub(crate) fn payload_address(&self) -> u64 {
        if self.no_header {
            self.address
        } else {
            self.address + PAGE_HEADER_SIZE as u64
        }
    }

    pub(crate) fn raw_data(&self) -> &[u8] {
        &self.data
    }

    pub(crate) fn raw_data_mut(&mut self) -> &mut [u8] {
        self.dirty = true;
        &mut self.data
    }

    pub(crate) fn acquire_cursor_ref(&mut self) {
        self.cursor_refs += 1;
    }

    pub(crate) fn release_cursor_ref(&mut self) {
        debug_assert!(self.cursor_refs > 0);
        self.cursor_refs -= 1;
    }

    pub(crate) fn has_cursor_refs(&self) -> bool {
        self.cursor_refs > 0
    }

    pub(crate) fn last_lsn(&self) -> u64 {
        self.last_lsn
    }

    pub(crate) fn set_last_lsn(&mut self, lsn: u64) {
        self.last_lsn = lsn;
    }
}
