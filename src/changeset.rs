//! The ordered set of pages dirtied by one logical operation. The change
//! set is flushed atomically through the log at commit, or dropped from the
//! cache on rollback.
//!
//! Entries are keyed by page address so membership tests never take a page
//! lock; the type-based flush order is resolved at commit time.

use crate::{
    page::{Page, PageType},
    types::Pod,
    utils::HandyRwLock,
};

#[derive(Default)]
pub(crate) struct Changeset {
    entries: Vec<(u64, Pod<Page>)>,
}

impl Changeset {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a page. Inserting the same page twice is a no-op.
    pub fn put(&mut self, page: &Pod<Page>, address: u64) {
        if self.contains(address) {
            return;
        }
        self.entries.push((address, page.clone()));
    }

    pub fn contains(&self, address: u64) -> bool {
        self.entries.iter().any(|(a, _)| *a == address)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drain the set in flush order: index pages first, then page-manager
    /// state, then blobs, then the rest.
    pub fn take_ordered(&mut self) -> Vec<Pod<Page>> {
        let mut taken: Vec<(u64, Pod<Page>)> = std::mem::take(&mut self.entries);
        taken.sort_by_key(|(_, page)| Self::rank(&page.rl()));
        taken.into_iter().map(|(_, page)| page).collect()
    }

    fn rank(page: &Page) -> u8 {
        if page.is_raw() {
            return 2;
        }
        match page.page_type() {
            PageType::BtreeRoot | PageType::BtreeIndex => 0,
            PageType::PageManagerState | PageType::Freelist => 1,
            PageType::Blob => 2,
            _ => 3,
        }
    }
}
