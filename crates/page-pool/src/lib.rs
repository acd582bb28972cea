//! Per-client pool of physical pages.
//!
//! One [`PagePool`] is attached to each open kernel-mediated client, the
//! same way a page table is attached to an open file handle on a real
//! paging device. `PageId`s are indices into the pool's page array; the
//! array grows by doubling and never shrinks.

use log::warn;
use rewire_types::PAGE_SIZE;
pub use rewire_types::PageId;

/// Everything the pool stores about one physical page.
struct PhysicalPage {
    /// `None` until the slot has been allocated at least once.
    bytes: Option<Box<[u8; PAGE_SIZE]>>,
    /// Number of virtual slots across all mappings of this client that
    /// currently refer to this page.
    usage_count: u64,
}

impl PhysicalPage {
    const fn empty() -> Self {
        Self {
            bytes: None,
            usage_count: 0,
        }
    }

    fn is_valid(&self) -> bool {
        self.bytes.is_some()
    }
}

/// A per-client growable array of physical pages.
///
/// Pages are never freed on `usage_count` reaching zero: lifetime is tied
/// to the pool (i.e. to the owning client), not to references.
pub struct PagePool {
    pages: Vec<PhysicalPage>,
    /// Number of entries in `pages` that have actually been allocated via
    /// [`PagePool::alloc_new_page`]. `pages.len()` may be larger (the
    /// array grows in doubling steps ahead of demand).
    allocated: usize,
}

impl Default for PagePool {
    fn default() -> Self {
        Self::new()
    }
}

impl PagePool {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            pages: Vec::new(),
            allocated: 0,
        }
    }

    /// Number of physical pages currently allocated.
    #[must_use]
    pub fn allocated_count(&self) -> usize {
        self.allocated
    }

    /// Grows the backing array by doubling. Returns `Err(())` if the
    /// array cannot be grown (allocator reports failure via
    /// `try_reserve`), leaving the pool unchanged.
    fn grow(&mut self) -> Result<(), ()> {
        let new_len = if self.pages.is_empty() {
            1
        } else {
            self.pages.len() * 2
        };
        let additional = new_len - self.pages.len();
        self.pages.try_reserve(additional).map_err(|_| ())?;
        self.pages.resize_with(new_len, PhysicalPage::empty);
        Ok(())
    }

    /// Allocates a fresh, zeroed physical page and returns its id.
    ///
    /// Returns [`PageId::UNASSIGNED`] if the pool cannot grow its backing
    /// array (out of memory) — the caller must treat this as a fatal
    /// resource-exhaustion error, not retry.
    pub fn alloc_new_page(&mut self) -> PageId {
        if self.allocated == self.pages.len() && self.grow().is_err() {
            return PageId::UNASSIGNED;
        }
        let idx = self.allocated;
        self.pages[idx].bytes = Some(Box::new([0u8; PAGE_SIZE]));
        self.pages[idx].usage_count = 0;
        self.allocated += 1;
        PageId::new(u32::try_from(idx).expect("page index exceeds u32::MAX"))
    }

    fn slot(&self, id: PageId) -> Option<&PhysicalPage> {
        let idx = usize::try_from(id.raw()).ok()?;
        self.pages.get(idx).filter(|p| p.is_valid())
    }

    fn slot_mut(&mut self, id: PageId) -> Option<&mut PhysicalPage> {
        let idx = usize::try_from(id.raw()).ok()?;
        self.pages.get_mut(idx).filter(|p| p.is_valid())
    }

    /// Increments the usage count for `id`. Out-of-range or never-allocated
    /// ids are logged and ignored rather than panicking; the bounds check is
    /// strict (`idx >= allocated` rejects).
    pub fn inc_usage(&mut self, id: PageId) {
        match self.slot_mut(id) {
            Some(page) => page.usage_count += 1,
            None => warn!("page-pool: inc_usage on invalid page id {id:?}"),
        }
    }

    /// Decrements the usage count for `id`. See [`PagePool::inc_usage`].
    pub fn dec_usage(&mut self, id: PageId) {
        match self.slot_mut(id) {
            Some(page) => page.usage_count = page.usage_count.saturating_sub(1),
            None => warn!("page-pool: dec_usage on invalid page id {id:?}"),
        }
    }

    /// Current usage count for `id`, or `None` if `id` does not name an
    /// allocated page.
    #[must_use]
    pub fn usage_count(&self, id: PageId) -> Option<u64> {
        self.slot(id).map(|page| page.usage_count)
    }

    /// Bytes of the physical page named by `id`.
    #[must_use]
    pub fn page_bytes(&self, id: PageId) -> Option<&[u8; PAGE_SIZE]> {
        self.slot(id).map(|page| page.bytes.as_deref().unwrap())
    }

    /// Mutable bytes of the physical page named by `id`.
    pub fn page_bytes_mut(&mut self, id: PageId) -> Option<&mut [u8; PAGE_SIZE]> {
        self.slot_mut(id).map(|page| page.bytes.as_deref_mut().unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_grows_by_doubling() {
        let mut pool = PagePool::new();
        let ids: Vec<_> = (0..5).map(|_| pool.alloc_new_page()).collect();
        assert_eq!(pool.allocated_count(), 5);
        // capacity grew 1, 2, 4, 8 -> backing array is at least 8 long
        assert!(pool.pages.len() >= 8);
        for (i, id) in ids.iter().enumerate() {
            assert_eq!(id.raw(), i as u32);
        }
    }

    #[test]
    fn fresh_pages_are_zeroed() {
        let mut pool = PagePool::new();
        let id = pool.alloc_new_page();
        assert!(pool.page_bytes(id).unwrap().iter().all(|&b| b == 0));
    }

    #[test]
    fn usage_counts_ignore_invalid_ids() {
        let mut pool = PagePool::new();
        pool.inc_usage(PageId::new(9999));
        pool.dec_usage(PageId::UNASSIGNED);
        // no panic, no entries created
        assert_eq!(pool.allocated_count(), 0);
    }

    #[test]
    fn usage_count_tracks_inc_dec() {
        let mut pool = PagePool::new();
        let id = pool.alloc_new_page();
        pool.inc_usage(id);
        pool.inc_usage(id);
        pool.dec_usage(id);
        assert_eq!(pool.usage_count(id), Some(1));
    }
}
