//! Atomic multi-range remap composition.
//!
//! A single [`rewire_types::Backend::sync_to_pt`] call already makes one
//! range's remap visible atomically with respect to that range. Staging
//! builds on that to compose several ranges — possibly overlapping,
//! possibly swapping into each other — into one commit where no
//! intermediate state is ever observable: every `stage` call captures an
//! owned snapshot immediately (via `sync_from_pt`), so later stages can
//! never see an earlier stage's not-yet-committed write, and `commit`
//! only starts flipping page tables once every snapshot has already been
//! folded into the backend's local mirror.

use log::debug;

use rewire_types::{Backend, PageId, RewireError};

struct StagedEntry {
    dest: usize,
    snapshot: Vec<PageId>,
}

/// Queues remaps against a backend and applies them together.
///
/// Borrows the backend for as long as entries are queued; nothing else
/// may observe or mutate it until [`Self::commit`] (or the queue is
/// dropped, discarding anything staged but never committed).
pub struct StagedRewiring<'b, B: Backend + ?Sized> {
    backend: &'b mut B,
    staged: Vec<StagedEntry>,
}

impl<'b, B: Backend + ?Sized> StagedRewiring<'b, B> {
    pub fn new(backend: &'b mut B) -> Self {
        Self {
            backend,
            staged: Vec::new(),
        }
    }

    /// Captures page ids currently at `[source, source+len)` and queues
    /// them to land at `[dest, dest+len)` on the next [`Self::commit`].
    ///
    /// The snapshot is taken from the backend's *local* mirror after an
    /// explicit `sync_from_pt`, so it reflects whatever the fault handler
    /// (or a prior `sync_to_pt`) has actually installed, not just
    /// whatever a caller happened to leave in the mirror.
    pub fn stage(&mut self, dest: usize, source: usize, len: usize) -> Result<(), RewireError> {
        self.backend.sync_from_pt(source, len)?;
        let snapshot = self.backend.page_ids()[source..source + len].to_vec();
        debug!("rewire-staging: staged {len} pages from {source} to {dest}");
        self.staged.push(StagedEntry { dest, snapshot });
        Ok(())
    }

    /// Applies every staged entry, in staging order, and clears the
    /// queue. Entries are folded into the local mirror first, then
    /// pushed to the page table one range at a time — by the time any
    /// range becomes visible, every snapshot this commit depends on has
    /// already been taken, so composing several `stage` calls (e.g. two
    /// that swap each other's ranges) never exposes a half-applied state.
    pub fn commit(&mut self) -> Result<(), RewireError> {
        for entry in &self.staged {
            let end = entry.dest + entry.snapshot.len();
            self.backend.page_ids_mut()[entry.dest..end].copy_from_slice(&entry.snapshot);
        }
        for entry in &self.staged {
            self.backend.sync_to_pt(entry.dest, entry.snapshot.len())?;
        }
        debug!("rewire-staging: committed {} staged ranges", self.staged.len());
        self.staged.clear();
        Ok(())
    }

    /// Number of ranges staged but not yet committed.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.staged.len()
    }

    /// Discards every staged range without applying it.
    pub fn clear(&mut self) {
        self.staged.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeBackend {
        ids: Vec<PageId>,
    }

    impl Backend for FakeBackend {
        fn resize(&mut self, num_pages: usize) -> Result<(), RewireError> {
            self.ids.resize(num_pages, PageId::UNASSIGNED);
            Ok(())
        }
        fn mapping(&self) -> Option<std::ptr::NonNull<u8>> {
            None
        }
        fn num_pages(&self) -> usize {
            self.ids.len()
        }
        fn page_ids(&self) -> &[PageId] {
            &self.ids
        }
        fn page_ids_mut(&mut self) -> &mut [PageId] {
            &mut self.ids
        }
        fn sync_to_pt(&mut self, _start: usize, _len: usize) -> Result<(), RewireError> {
            Ok(())
        }
        fn sync_from_pt(&mut self, _start: usize, _len: usize) -> Result<(), RewireError> {
            Ok(())
        }
        fn create_new_page_ids(
            &mut self,
            _positions: &[usize],
            _out: &mut [PageId],
        ) -> Result<(), RewireError> {
            Ok(())
        }
    }

    fn backend_with(ids: &[u32]) -> FakeBackend {
        FakeBackend {
            ids: ids.iter().map(|&r| PageId::new(r)).collect(),
        }
    }

    #[test]
    fn swap_two_ranges_is_atomic() {
        let mut backend = backend_with(&[1, 2, 3, 4]);
        let mut staging = StagedRewiring::new(&mut backend);

        staging.stage(0, 2, 2).unwrap();
        staging.stage(2, 0, 2).unwrap();
        staging.commit().unwrap();

        assert_eq!(backend.page_ids(), &[PageId::new(3), PageId::new(4), PageId::new(1), PageId::new(2)]);
    }

    #[test]
    fn commit_clears_the_queue() {
        let mut backend = backend_with(&[1, 2]);
        let mut staging = StagedRewiring::new(&mut backend);
        staging.stage(0, 1, 1).unwrap();
        assert_eq!(staging.pending(), 1);
        staging.commit().unwrap();
        assert_eq!(staging.pending(), 0);
    }

    #[test]
    fn discarded_stage_never_applies() {
        let mut backend = backend_with(&[1, 2]);
        let mut staging = StagedRewiring::new(&mut backend);
        staging.stage(0, 1, 1).unwrap();
        staging.clear();
        drop(staging);
        assert_eq!(backend.page_ids(), &[PageId::new(1), PageId::new(2)]);
    }
}
