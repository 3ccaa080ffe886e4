//! Page-level resource management: fetch and allocation against the cache
//! and freelist, blob space carving, and the atomic change-set commit
//! through the log.

use std::sync::{Arc, RwLock};

use log::{debug, trace};

use crate::{
    cache::PageCache,
    changeset::Changeset,
    config::EnvConfig,
    device::Device,
    freelist::Freelist,
    io::{get_u32, get_u64, set_u32, set_u64},
    page::{Page, PageType, PAGE_HEADER_SIZE},
    types::{DbResult, Pod, Result},
    utils::{align_up, HandyRwLock},
    wal::Wal,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FetchMode {
    /// Read from the device when the page is not cached.
    Normal,
    /// Return `None` when the page is not cached.
    CacheOnly,
}

/// A byte range serving a blob. Page-aligned ranges are raw page runs; all
/// other ranges live inside a single blob page's payload.
pub(crate) struct BlobSpace {
    pub address: u64,
    /// Actual capacity granted, >= the requested size.
    pub granted: u64,
}

pub(crate) struct PageManager {
    pub cache: PageCache,
    pub freelist: Freelist,
    pub changeset: Changeset,
    /// Addresses of the page-manager state chain; the head is always the
    /// page directly behind the environment header.
    state_pages: Vec<u64>,
}

impl PageManager {
    pub fn new(config: &EnvConfig) -> Self {
        let unlimited =
            config.flags.contains(crate::flags::EnvFlags::CACHE_UNLIMITED)
                || config.is_in_memory();
        let strict = config.flags.contains(crate::flags::EnvFlags::CACHE_STRICT);
        Self {
            cache: PageCache::new(
                config.cache_size,
                config.page_size as usize,
                unlimited,
                strict,
            ),
            freelist: Freelist::new(config.page_size, config.blob_alignment),
            changeset: Changeset::new(),
            state_pages: Vec::new(),
        }
    }

    pub fn state_head(config: &EnvConfig) -> u64 {
        config.page_size as u64
    }

    /// Fetch a page, reading through the device as needed.
    pub fn fetch_page(
        &mut self,
        device: &mut Device,
        config: &EnvConfig,
        address: u64,
        mode: FetchMode,
        raw: bool,
    ) -> Result<Option<Pod<Page>>> {
        if let Some(page) = self.cache.get(address) {
            return Ok(Some(page));
        }
        if mode == FetchMode::CacheOnly {
            return Ok(None);
        }
        self.cache.make_room(&self.changeset, device)?;

        let mut page = Page::new(address, config.page_size as usize);
        page.set_raw(raw);
        device.read_page(&mut page)?;
        trace!("fetched page 0x{:x}", address);
        let pod = Arc::new(RwLock::new(page));
        self.cache.insert(pod.clone());
        Ok(Some(pod))
    }

    /// Allocate a page of the requested type, preferring the freelist.
    pub fn alloc_page(
        &mut self,
        device: &mut Device,
        config: &EnvConfig,
        ptype: PageType,
        ignore_freelist: bool,
    ) -> Result<Pod<Page>> {
        self.cache.make_room(&self.changeset, device)?;

        let address = if ignore_freelist {
            None
        } else {
            self.freelist.alloc_page()
        };
        let address = match address {
            Some(a) => {
                // a reused page may still sit in the cache with stale bytes
                self.cache.remove(a);
                a
            }
            None => device.alloc_page()?,
        };

        let mut page = Page::new(address, config.page_size as usize);
        page.set_page_type(ptype);
        page.set_dirty(true);
        debug!("allocated page 0x{:x} as {:?}", address, ptype);

        let pod = Arc::new(RwLock::new(page));
        self.cache.insert(pod.clone());
        self.changeset.put(&pod, address);
        Ok(pod)
    }

    /// Serve an aligned byte range for a blob. Small requests are carved
    /// out of blob pages; requests that cannot fit into a single page's
    /// payload become raw whole-page runs.
    pub fn alloc_blob_space(
        &mut self,
        device: &mut Device,
        config: &EnvConfig,
        size: u64,
    ) -> Result<BlobSpace> {
        // chunks start behind the page header, rounded up to the blob
        // alignment, so every chunk address satisfies the alignment
        let first_chunk = align_up(PAGE_HEADER_SIZE as u64, config.blob_alignment as u64);
        let usable = config.page_size as u64 - first_chunk;
        if size <= usable {
            if let Some((address, granted)) = self.freelist.alloc_chunk(size as u32) {
                return Ok(BlobSpace {
                    address,
                    granted: granted as u64,
                });
            }
            // carve the request out of a fresh blob page; a remainder below
            // one chunk is absorbed into the grant
            let page = self.alloc_page(device, config, PageType::Blob, false)?;
            let address = page.rl().address() + first_chunk;
            let remainder = usable - size;
            let granted = if remainder >= crate::config::CHUNK_SIZE as u64 {
                self.freelist.free_chunk(address + size, remainder as u32);
                size
            } else {
                usable
            };
            return Ok(BlobSpace { address, granted });
        }

        // whole-page run, rounded up so the entire run can return to the
        // page bitmap when the blob is freed
        let total = align_up(size, config.page_size as u64);
        let count = (total / config.page_size as u64) as usize;
        let address = match self.freelist.alloc_page_run(count) {
            Some(a) => {
                for i in 0..count {
                    self.cache.remove(a + i as u64 * config.page_size as u64);
                }
                a
            }
            None => device.alloc_pages(count)?,
        };
        debug!("allocated blob run of {} pages at 0x{:x}", count, address);
        Ok(BlobSpace {
            address,
            granted: total,
        })
    }

    /// Return a page to the freelist. The cached copy is dropped.
    pub fn free_page(&mut self, config: &EnvConfig, address: u64) {
        debug_assert!(address % config.page_size as u64 == 0);
        self.cache.remove(address);
        self.freelist.free_page(address);
    }

    /// Return blob space to the freelist.
    pub fn free_blob(&mut self, config: &EnvConfig, address: u64, granted: u64) {
        let page_size = config.page_size as u64;
        if address % page_size == 0 {
            let count = (align_up(granted, page_size) / page_size) as usize;
            for i in 0..count {
                self.cache.remove(address + i as u64 * page_size);
            }
            self.freelist.free_page_run(address, count);
        } else {
            self.freelist.free_chunk(address, granted as u32);
        }
    }

    /// Write-through a single page and clear its dirty flag.
    pub fn flush_page(&mut self, device: &mut Device, page: &Pod<Page>) -> DbResult {
        let mut pg = page.wl();
        if pg.is_dirty() {
            device.write_page(&pg)?;
            pg.set_dirty(false);
        }
        Ok(())
    }

    /// Atomic flush of the current change set at the given lsn: log every
    /// page (the last entry closes the set), then write the pages through
    /// the device, then drop the log entries.
    ///
    /// `skip_data_flush` is the crash window used by the recovery tests:
    /// the log is written and synced, the data file is left untouched.
    pub fn commit_changeset(
        &mut self,
        device: &mut Device,
        wal: &mut Option<Wal>,
        lsn: u64,
        fsync: bool,
        skip_data_flush: bool,
    ) -> DbResult {
        if self.changeset.is_empty() {
            return Ok(());
        }
        let pages = self.changeset.take_ordered();

        if let Some(wal) = wal.as_mut() {
            let total = pages.len();
            for (i, page) in pages.iter().enumerate() {
                let mut pg = page.wl();
                wal.append_page(lsn, pg.address(), pg.raw_data(), i + 1 == total)?;
                pg.set_last_lsn(lsn);
            }
            wal.flush()?;
        }

        if skip_data_flush {
            return Ok(());
        }

        for page in &pages {
            self.flush_page(device, page)?;
        }
        if fsync {
            device.flush()?;
        }
        if let Some(wal) = wal.as_mut() {
            wal.checkpoint(lsn)?;
        }
        Ok(())
    }

    /// Throw away the current change set: uncommitted pages are dropped
    /// from the cache and the freelist is re-read from its last committed
    /// image.
    pub fn rollback_changeset(
        &mut self,
        device: &mut Device,
        config: &EnvConfig,
    ) -> DbResult {
        let pages = self.changeset.take_ordered();
        for page in pages {
            let address = page.rl().address();
            self.cache.remove(address);
        }
        self.load_state(device, config)
    }

    // ------------------------------------------------------------------
    // page-manager state chain
    // ------------------------------------------------------------------

    /// Create the state chain head on a fresh environment.
    pub fn init_state(&mut self, device: &mut Device, config: &EnvConfig) -> DbResult {
        let address = device.alloc_page()?;
        debug_assert_eq!(address, Self::state_head(config));
        let mut page = Page::new(address, config.page_size as usize);
        page.set_page_type(PageType::PageManagerState);
        page.set_dirty(true);
        let pod = Arc::new(RwLock::new(page));
        self.cache.insert(pod.clone());
        self.changeset.put(&pod, address);
        self.state_pages = vec![address];
        self.store_state(device, config)
    }

    /// Re-read the freelist from the state chain.
    pub fn load_state(&mut self, device: &mut Device, config: &EnvConfig) -> DbResult {
        let mut bytes = Vec::new();
        let mut chain = Vec::new();
        let mut address = Self::state_head(config);
        while address != 0 {
            chain.push(address);
            let page = self
                .fetch_page(device, config, address, FetchMode::Normal, false)?
                .expect("state chain page");
            let pg = page.rl();
            let payload = pg.payload();
            let next = get_u64(payload, 0);
            let len = get_u32(payload, 8) as usize;
            bytes.extend_from_slice(&payload[12..12 + len]);
            address = next;
        }
        self.freelist = Freelist::decode(config.page_size, config.blob_alignment, &bytes)?;
        self.freelist.clear_dirty();
        self.state_pages = chain;
        Ok(())
    }

    /// Serialize the freelist into the state chain, growing the chain from
    /// the end of the file when the image no longer fits.
    pub fn store_state(&mut self, device: &mut Device, config: &EnvConfig) -> DbResult {
        let bytes = self.freelist.encode();
        let capacity = config.page_payload() - 12;
        let pages_needed = std::cmp::max(1, (bytes.len() + capacity - 1) / capacity);

        // the chain only ever grows; allocation bypasses the freelist so
        // the image being written stays valid
        while self.state_pages.len() < pages_needed {
            let address = device.alloc_pages(1)?;
            let mut page = Page::new(address, config.page_size as usize);
            page.set_page_type(PageType::PageManagerState);
            page.set_dirty(true);
            let pod = Arc::new(RwLock::new(page));
            self.cache.insert(pod.clone());
            self.changeset.put(&pod, address);
            self.state_pages.push(address);
        }

        for (i, address) in self.state_pages.clone().iter().enumerate() {
            let page = self
                .fetch_page(device, config, *address, FetchMode::Normal, false)?
                .expect("state chain page");
            self.changeset.put(&page, *address);
            let mut pg = page.wl();
            let payload = pg.payload_mut();
            let next = if i + 1 < pages_needed {
                self.state_pages[i + 1]
            } else {
                0
            };
            set_u64(payload, 0, next);
            let start = i * capacity;
            let chunk = if start < bytes.len() {
                &bytes[start..std::cmp::min(start + capacity, bytes.len())]
            } else {
                &[]
            };
            set_u32(payload, 8, chunk.len() as u32);
            payload[12..12 + chunk.len()].copy_from_slice(chunk);
        }
        self.freelist.clear_dirty();
        Ok(())
    }

    /// Flush everything that is still dirty. Used on close.
    pub fn flush_all(&mut self, device: &mut Device) -> DbResult {
        self.cache.flush_all(device)
    }
}
