//! Portable rewiring backend: no kernel module, no `userfaultfd`, just a
//! `memfd`-backed file and `mmap(2)`.
//!
//! A single growable anonymous file plays the role the physical page
//! pool plays for the kernel-mediated backend: [`PageId`] *is* a
//! page-sized offset into that file, so there is no separate id-to-page
//! table to maintain and no `UNASSIGNED`/`OFFSET_INVALID` bookkeeping to
//! reconcile against a fault handler — every id the backend ever hands
//! out already names real, allocated backing storage.
//!
//! Rewiring a virtual page is then just `mmap(addr, PAGE_SIZE,
//! PROT_READ|PROT_WRITE, MAP_FIXED|MAP_SHARED, fd, id * PAGE_SIZE)`:
//! remapping the page table entry without touching the data it points
//! at. [`PortableBackend::sync_to_pt`] coalesces contiguous runs of
//! contiguous file offsets into a single `mmap` call each, since a
//! `MAP_FIXED` remap over an already-mapped range is exactly the "atomic
//! PTE swap" the kernel-mediated backend gets from its fault handler.

use std::ffi::CStr;
use std::num::NonZeroUsize;
use std::os::fd::{AsFd, OwnedFd};
use std::ptr::NonNull;

use log::warn;
use nix::sys::memfd::{memfd_create, MFdFlags};
use nix::sys::mman::{mmap, mmap_anonymous, munmap, MapFlags, ProtFlags};
use nix::unistd::ftruncate;

use rewire_types::{Backend, PageId, RewireError, PAGE_SIZE};

/// Size, in pages, the backing file is truncated to once at construction.
///
/// Truncated to a size larger than any plausible mapping (effectively
/// unbounded), so the client never has to manage file size. `memfd_create`
/// files live in tmpfs and are sparse: truncating to 64 GiB up front
/// allocates no real memory until a page within that range is actually
/// written.
const BACKING_FILE_PAGES: u64 = 1 << 24;

/// The portable backend: one `memfd`, truncated once to
/// [`BACKING_FILE_PAGES`] pages, plus whatever virtual region is
/// currently wired to some subset of it. A [`PageId`] here *is* a file
/// offset in pages, so every id the backend ever produces already names
/// real (if possibly still-zero) backing storage — there is no
/// `UNASSIGNED` bookkeeping to reconcile against a fault handler.
pub struct PortableBackend {
    file: OwnedFd,
    base: Option<NonNull<u8>>,
    local: Vec<PageId>,
}

// SAFETY: `base`, when present, is an mmap'd region exclusively owned by
// this struct; nothing else ever holds a pointer into it.
unsafe impl Send for PortableBackend {}

impl PortableBackend {
    /// Creates a backend with an empty (zero-page) mapping and a
    /// backing file already truncated to its full, effectively-unbounded
    /// size.
    pub fn new() -> Result<Self, RewireError> {
        let name = CStr::from_bytes_with_nul(b"rewire-portable\0").unwrap();
        let file = memfd_create(name, MFdFlags::MFD_CLOEXEC)
            .map_err(|e| RewireError::syscall_errno("memfd_create", e as i32))?;
        let len = i64::try_from(BACKING_FILE_PAGES * PAGE_SIZE as u64).expect("fits i64");
        ftruncate(&file, len).map_err(|e| RewireError::syscall_errno("ftruncate", e as i32))?;
        Ok(Self {
            file,
            base: None,
            local: Vec::new(),
        })
    }

    fn bounds_check(&self, start: usize, len: usize) -> Result<(), RewireError> {
        let num_pages = self.local.len();
        let end = start.checked_add(len).unwrap_or(usize::MAX);
        if end > num_pages {
            return Err(RewireError::OutOfBounds {
                start,
                end,
                num_pages,
            });
        }
        Ok(())
    }

    /// Casts a virtual page index to the identity [`PageId`] a `resize`
    /// assigns to freshly grown slots: each new slot starts identity-mapped
    /// to its own index.
    fn identity_page_id(index: usize) -> Result<PageId, RewireError> {
        u32::try_from(index)
            .map(PageId::new)
            .map_err(|_| RewireError::OutOfMemory)
    }

    fn page_addr(&self, offset: usize) -> NonZeroUsize {
        let base = self.base.expect("page_addr called on an empty mapping").as_ptr() as usize;
        NonZeroUsize::new(base + offset * PAGE_SIZE).expect("mmap base is never page 0")
    }

    /// Remaps `[start, start+len)` in one `mmap` call, either onto a
    /// contiguous run of real file offsets (`MAP_SHARED`) or onto fresh
    /// anonymous zero pages (`MAP_PRIVATE`) for a run of `UNASSIGNED`
    /// slots.
    fn remap_run(&self, start: usize, ids: &[PageId]) -> Result<(), RewireError> {
        if ids.is_empty() {
            return Ok(());
        }
        let addr = Some(self.page_addr(start));
        let len = NonZeroUsize::new(ids.len() * PAGE_SIZE).expect("non-empty run");

        if ids[0].is_real() {
            let file_offset = ids[0].raw() as i64 * PAGE_SIZE as i64;
            // SAFETY: `addr` lies within this backend's own region, sized
            // to exactly `len` bytes of remaining mapping; `self.file` is
            // sized to cover `file_offset..file_offset+len`.
            unsafe {
                mmap(
                    addr,
                    len,
                    ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                    MapFlags::MAP_FIXED | MapFlags::MAP_SHARED,
                    self.file.as_fd(),
                    file_offset,
                )
            }
            .map_err(|e| RewireError::syscall_errno("mmap", e as i32))?;
        } else {
            // SAFETY: as above, for the anonymous-zero-page case.
            unsafe {
                mmap_anonymous(addr, len, ProtFlags::PROT_READ | ProtFlags::PROT_WRITE, MapFlags::MAP_FIXED | MapFlags::MAP_PRIVATE)
            }
            .map_err(|e| RewireError::syscall_errno("mmap", e as i32))?;
        }
        Ok(())
    }
}

impl Backend for PortableBackend {
    /// Unmaps the old region (if any), reserves a fresh anonymous region
    /// of the new size, and re-establishes the surviving prefix's real
    /// mappings by pushing it through [`Self::sync_to_pt`] — resize never
    /// needs to preserve byte contents, only which file offset backs which
    /// virtual page. New slots beyond the preserved prefix are
    /// identity-mapped to their own index, not `UNASSIGNED`.
    fn resize(&mut self, num_pages: usize) -> Result<(), RewireError> {
        if num_pages as u64 > BACKING_FILE_PAGES {
            return Err(RewireError::OutOfMemory);
        }
        let preserved_len = num_pages.min(self.local.len());
        let preserved: Vec<PageId> = self.local[..preserved_len].to_vec();

        if let Some(base) = self.base.take() {
            if !self.local.is_empty() {
                // SAFETY: `base` is exactly the region this backend
                // mmap'd for the current `local.len()` pages.
                unsafe {
                    let _ = munmap(base, self.local.len() * PAGE_SIZE);
                }
            }
        }

        let mut local = Vec::with_capacity(num_pages);
        local.extend(preserved);
        for index in preserved_len..num_pages {
            local.push(Self::identity_page_id(index)?);
        }
        self.local = local;

        if num_pages == 0 {
            self.base = None;
            return Ok(());
        }

        // Map the memfd directly over the whole region at its identity
        // offsets: every slot this backend has ever handed out names real
        // backing storage, so the region must be file-backed from the
        // start, not anonymous memory that only becomes real once
        // `sync_to_pt` happens to touch it. The preserved prefix (whose
        // page ids may not be identity) is corrected immediately after by
        // overlaying it through `sync_to_pt`.
        //
        // SAFETY: reserving a fresh, exclusively-owned region backed by
        // this backend's own memfd, sized to exactly `num_pages` pages of
        // the file.
        let base = unsafe {
            mmap(
                None,
                NonZeroUsize::new(num_pages * PAGE_SIZE).unwrap(),
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                self.file.as_fd(),
                0,
            )
        }
        .map_err(|e| RewireError::syscall_errno("mmap", e as i32))?;
        self.base = Some(base);

        self.sync_to_pt(0, preserved_len)
    }

    fn mapping(&self) -> Option<NonNull<u8>> {
        self.base
    }

    fn num_pages(&self) -> usize {
        self.local.len()
    }

    fn page_ids(&self) -> &[PageId] {
        &self.local
    }

    fn page_ids_mut(&mut self) -> &mut [PageId] {
        &mut self.local
    }

    /// Coalesces `local[start..start+len]` into maximal contiguous runs —
    /// same offset-origin for real ids, or all-`UNASSIGNED` — and issues
    /// one `mmap(MAP_FIXED, ...)` per run.
    fn sync_to_pt(&mut self, start: usize, len: usize) -> Result<(), RewireError> {
        self.bounds_check(start, len)?;
        if len == 0 {
            return Ok(());
        }

        let slice = self.local[start..start + len].to_vec();
        let mut run_begin = 0;
        while run_begin < slice.len() {
            let mut run_end = run_begin + 1;
            while run_end < slice.len() {
                let contiguous = match (slice[run_begin].is_real(), slice[run_end].is_real()) {
                    (true, true) => {
                        slice[run_end].raw() == slice[run_begin].raw() + (run_end - run_begin) as u32
                    }
                    (false, false) => true,
                    _ => false,
                };
                if !contiguous {
                    break;
                }
                run_end += 1;
            }
            self.remap_run(start + run_begin, &slice[run_begin..run_end])?;
            run_begin = run_end;
        }
        Ok(())
    }

    /// The portable backend is its own authority: no separate kernel-side
    /// table exists for `local` to diverge from, so this is the identity
    /// operation — present only so callers can treat both backends
    /// uniformly through the [`Backend`] trait.
    fn sync_from_pt(&mut self, start: usize, len: usize) -> Result<(), RewireError> {
        self.bounds_check(start, len)?;
        Ok(())
    }

    /// Identity: `out[i] := positions[i]`. Page identities already *are*
    /// file offsets and the backing file is truncated to its full size up
    /// front, so there is nothing to allocate — the caller's choice of
    /// positions is the identity. This also makes the operation naturally
    /// idempotent: calling it twice with the same `positions` yields the
    /// same `out` both times.
    fn create_new_page_ids(
        &mut self,
        positions: &[usize],
        out: &mut [PageId],
    ) -> Result<(), RewireError> {
        if positions.len() != out.len() {
            return Err(RewireError::InvalidState {
                op: "create_new_page_ids: positions/out length mismatch",
                num_pages: self.local.len(),
            });
        }
        for (&pos, slot) in positions.iter().zip(out.iter_mut()) {
            let id = Self::identity_page_id(pos)?;
            *slot = id;
            if let Some(local_slot) = self.local.get_mut(pos) {
                *local_slot = id;
            } else {
                warn!("rewire-portable: create_new_page_ids position {pos} out of range");
            }
        }
        Ok(())
    }
}

impl Drop for PortableBackend {
    fn drop(&mut self) {
        if let Some(base) = self.base {
            if !self.local.is_empty() {
                // SAFETY: this backend's own region, about to be dropped.
                unsafe {
                    let _ = munmap(base, self.local.len() * PAGE_SIZE);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resize_grows_and_shrinks() {
        let mut backend = PortableBackend::new().expect("memfd_create");
        backend.resize(4).expect("resize to 4");
        assert_eq!(backend.num_pages(), 4);
        assert!(backend.mapping().is_some());
        // fresh slots are identity-mapped, not UNASSIGNED
        assert_eq!(backend.page_ids(), &[PageId::new(0), PageId::new(1), PageId::new(2), PageId::new(3)]);

        backend.resize(1).expect("resize to 1");
        assert_eq!(backend.num_pages(), 1);

        backend.resize(0).expect("resize to 0");
        assert_eq!(backend.num_pages(), 0);
        assert!(backend.mapping().is_none());
    }

    #[test]
    fn create_new_page_ids_is_identity_and_idempotent() {
        let mut backend = PortableBackend::new().expect("memfd_create");
        backend.resize(2).expect("resize to 2");

        let mut out = [PageId::UNASSIGNED; 2];
        backend
            .create_new_page_ids(&[5, 9], &mut out)
            .expect("identity ids");
        assert_eq!(out, [PageId::new(5), PageId::new(9)]);

        let mut out2 = [PageId::UNASSIGNED; 2];
        backend
            .create_new_page_ids(&[5, 9], &mut out2)
            .expect("identity ids again");
        assert_eq!(out, out2, "same positions always yield the same ids");
    }

    #[test]
    fn sync_to_pt_rejects_out_of_bounds_range() {
        let mut backend = PortableBackend::new().expect("memfd_create");
        backend.resize(2).expect("resize to 2");
        assert!(backend.sync_to_pt(1, 5).is_err());
    }
}
