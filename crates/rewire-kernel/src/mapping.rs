//! Per-mapping page-id table.

use page_pool::PagePool;
use rewire_types::PageId;

/// The virtual-to-physical index for one mapping: `page_ids[offset]`
/// names the physical page backing virtual page `offset`, or
/// [`PageId::UNASSIGNED`] if none has been faulted/assigned yet.
#[derive(Debug, Default)]
pub struct MappingTable {
    page_ids: Vec<PageId>,
}

impl MappingTable {
    #[must_use]
    pub fn new(num_pages: usize) -> Self {
        Self {
            page_ids: vec![PageId::UNASSIGNED; num_pages],
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.page_ids.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.page_ids.is_empty()
    }

    /// Grows or shrinks the table to `new_len` entries, preserving the
    /// surviving prefix and initializing any new slots to `UNASSIGNED`.
    ///
    /// This does not decrement usage counts for entries dropped by a
    /// shrink: region teardown drops all references at once, and a
    /// `resize` that shrinks a live mapping behaves the same way for the
    /// truncated suffix.
    pub fn resize(&mut self, new_len: usize) {
        self.page_ids.resize(new_len, PageId::UNASSIGNED);
    }

    /// Returns the page id at `offset`, or [`PageId::OFFSET_INVALID`] if
    /// out of range.
    #[must_use]
    pub fn get(&self, offset: usize) -> PageId {
        self.page_ids.get(offset).copied().unwrap_or(PageId::OFFSET_INVALID)
    }

    #[must_use]
    pub fn as_slice(&self) -> &[PageId] {
        &self.page_ids
    }

    /// Sets `page_ids[offset] = id`, adjusting `pool`'s usage counts for
    /// the previous and new occupant. A no-op if `offset` is out of range.
    pub fn set(&mut self, pool: &mut PagePool, offset: usize, id: PageId) {
        let Some(slot) = self.page_ids.get_mut(offset) else {
            return;
        };
        let previous = *slot;
        if previous.is_real() {
            pool.dec_usage(previous);
        }
        *slot = id;
        if id.is_real() {
            pool.inc_usage(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resize_preserves_prefix() {
        let mut pool = PagePool::new();
        let mut table = MappingTable::new(4);
        let id = pool.alloc_new_page();
        table.set(&mut pool, 0, id);

        table.resize(8);
        assert_eq!(table.get(0), id);
        assert_eq!(table.get(7), PageId::UNASSIGNED);

        table.resize(2);
        assert_eq!(table.get(0), id);
        assert_eq!(table.get(1), PageId::UNASSIGNED);
    }

    #[test]
    fn set_maintains_usage_counts() {
        let mut pool = PagePool::new();
        let mut table = MappingTable::new(2);
        let a = pool.alloc_new_page();
        let b = pool.alloc_new_page();

        table.set(&mut pool, 0, a);
        table.set(&mut pool, 1, a);
        assert_eq!(pool.usage_count(a), Some(2));

        table.set(&mut pool, 1, b);
        assert_eq!(pool.usage_count(a), Some(1));
        assert_eq!(pool.usage_count(b), Some(1));
    }

    #[test]
    fn out_of_range_offset_is_invalid() {
        let table = MappingTable::new(1);
        assert_eq!(table.get(1), PageId::OFFSET_INVALID);
    }
}
