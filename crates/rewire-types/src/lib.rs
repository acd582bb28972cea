//! Shared data model for the page rewiring engine.
//!
//! This crate has no backend-specific dependencies: both the kernel-mediated
//! backend (`rewire-kernel`) and the portable backend (`rewire-portable`)
//! depend on it, never on each other, so that no state is ever shared
//! across backends.

use std::ptr::NonNull;

mod error;

pub use error::RewireError;

/// Fixed page size assumed throughout the engine.
pub const PAGE_SIZE: usize = 4096;

/// An opaque identifier naming a physical backing page.
///
/// In the kernel-mediated backend this is an index into a client's
/// [`PagePool`](https://docs.rs/page-pool); in the portable backend it is
/// the raw file-offset-in-pages of the backing memory file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct PageId(pub u32);

impl PageId {
    /// A mapping slot with no physical backing yet (kernel-mediated only).
    ///
    /// Reads/writes to a slot holding this value fault lazily.
    pub const UNASSIGNED: Self = Self(0xFFFF_FFFF);

    /// Sentinel returned by an out-of-range lookup. Never stored in a
    /// mapping's page-id array.
    pub const OFFSET_INVALID: Self = Self(0xFFFF_FFFE);

    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn is_unassigned(self) -> bool {
        self.0 == Self::UNASSIGNED.0
    }

    #[must_use]
    pub const fn is_offset_invalid(self) -> bool {
        self.0 == Self::OFFSET_INVALID.0
    }

    /// `true` for a page id that names a real, allocated physical page.
    #[must_use]
    pub const fn is_real(self) -> bool {
        !self.is_unassigned() && !self.is_offset_invalid()
    }
}

impl From<u32> for PageId {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

/// Capability set shared by every rewiring backend.
///
/// A factory (`rewire::Factory`) returns one of these behind a trait
/// object; staged rewiring (`rewire-staging`) is generic over it. No
/// backend implementation may assume which concrete type sits behind the
/// trait.
pub trait Backend: Send {
    /// Grows or shrinks the mapping to `num_pages` pages, preserving
    /// `page_ids()[0..min(old, new))`. Reallocates the backing virtual
    /// region; any previously returned base address is invalidated.
    fn resize(&mut self, num_pages: usize) -> Result<(), RewireError>;

    /// Base address of the current virtual region, or `None` if the
    /// mapping has zero pages.
    fn mapping(&self) -> Option<NonNull<u8>>;

    /// Current page count `N`.
    fn num_pages(&self) -> usize;

    /// Read access to the page-id array; always `num_pages()` long.
    fn page_ids(&self) -> &[PageId];

    /// Read/write access to the page-id array.
    ///
    /// Mutating this array has no effect on the active mapping until the
    /// next [`Backend::sync_to_pt`] call over the touched range.
    fn page_ids_mut(&mut self) -> &mut [PageId];

    /// Pushes `page_ids()[start..start+len]` into the active mapping.
    /// Idempotent.
    fn sync_to_pt(&mut self, start: usize, len: usize) -> Result<(), RewireError>;

    /// Refreshes `page_ids()[start..start+len]` from the mapping's
    /// authoritative state. A no-op for the portable backend.
    fn sync_from_pt(&mut self, start: usize, len: usize) -> Result<(), RewireError>;

    /// Requests `positions.len()` fresh page identities, written to `out`.
    ///
    /// `positions` and `out` must be the same length. In the kernel-mediated
    /// backend `positions` is ignored and `out` receives newly allocated
    /// physical page ids; in the portable backend `out[i] = positions[i]`.
    fn create_new_page_ids(
        &mut self,
        positions: &[usize],
        out: &mut [PageId],
    ) -> Result<(), RewireError>;
}
