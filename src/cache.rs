//! Bounded page cache: a bucket hash for O(1) lookup plus an LRU queue for
//! eviction.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use log::debug;

use crate::{
    changeset::Changeset,
    device::Device,
    error::Error,
    page::Page,
    types::{DbResult, Pod},
    utils::HandyRwLock,
};

pub(crate) struct PageCache {
    map: HashMap<u64, Pod<Page>>,
    /// Least recently used first.
    lru: VecDeque<u64>,
    max_pages: usize,
    unlimited: bool,
    strict: bool,
}

impl PageCache {
    pub fn new(cache_size: usize, page_size: usize, unlimited: bool, strict: bool) -> Self {
        let max_pages = std::cmp::max(cache_size / page_size, 4);
        Self {
            map: HashMap::new(),
            lru: VecDeque::new(),
            max_pages,
            unlimited,
            strict,
        }
    }

    pub fn get(&mut self, address: u64) -> Option<Pod<Page>> {
        let page = self.map.get(&address).cloned();
        if page.is_some() {
            self.touch(address);
        }
        page
    }

    pub fn contains(&self, address: u64) -> bool {
        self.map.contains_key(&address)
    }

    /// Insert a page, evicting older entries when the cache is over its
    /// limit. The caller must have called `make_room` first when it wants
    /// strict-mode failures before the page is constructed.
    pub fn insert(&mut self, page: Pod<Page>) {
        let address = page.rl().address();
        if self.map.insert(address, page).is_none() {
            self.lru.push_back(address);
        } else {
            self.touch(address);
        }
    }

    pub fn remove(&mut self, address: u64) -> Option<Pod<Page>> {
        self.lru.retain(|a| *a != address);
        self.map.remove(&address)
    }

    /// Evict until there is room for one more page. A page is evictable if
    /// it is not the header page, carries no cursor references, is not part
    /// of the current change set, and no caller still holds a reference.
    /// Dirty pages are flushed before they are dropped.
    pub fn make_room(
        &mut self,
        changeset: &Changeset,
        device: &mut Device,
    ) -> DbResult {
        if self.unlimited {
            return Ok(());
        }
        while self.map.len() >= self.max_pages {
            match self.find_victim(changeset) {
                Some(address) => self.evict(address, device)?,
                None => {
                    if self.strict {
                        return Err(Error::CacheFull);
                    }
                    // nothing evictable; allow the cache to grow
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    fn find_victim(&self, changeset: &Changeset) -> Option<u64> {
        for address in self.lru.iter() {
            if *address == 0 {
                continue;
            }
            if changeset.contains(*address) {
                continue;
            }
            let page = self.map.get(address).expect("lru and map are in sync");
            if Arc::strong_count(page) > 1 {
                continue;
            }
            if page.rl().has_cursor_refs() {
                continue;
            }
            return Some(*address);
        }
        None
    }

    fn evict(&mut self, address: u64, device: &mut Device) -> DbResult {
        if let Some(page) = self.remove(address) {
            let mut pg = page.wl();
            if pg.is_dirty() {
                device.write_page(&pg)?;
                pg.set_dirty(false);
            }
            debug!(
                "evicted page 0x{:x} (last logged at lsn {})",
                address,
                pg.last_lsn()
            );
        }
        Ok(())
    }

    /// Flush every dirty page. Used on close.
    pub fn flush_all(&mut self, device: &mut Device) -> DbResult {
        for page in self.map.values() {
            let mut pg = page.wl();
            if pg.is_dirty() {
                device.write_page(&pg)?;
                pg.set_dirty(false);
            }
        }
        Ok(())
    }

    fn touch(&mut self, address: u64) {
        self.lru.retain(|a| *a != address);
        self.lru.push_back(address);
    }
}
