//! [`Backend`] implementation riding on [`Client`].

use std::ptr::NonNull;

use rewire_proto::Command;
use rewire_types::{Backend, PageId, RewireError};

use crate::client::Client;
use crate::dispatch;

/// The kernel-mediated backend: an open [`Client`], the id of its one
/// live mapping, and a local mirror of that mapping's page-id table.
///
/// The mirror exists because the [`Backend`] contract lets callers read
/// and write page ids directly (`page_ids`/`page_ids_mut`) without
/// immediately paying for a control-channel round trip; [`Self::sync_to_pt`]
/// and [`Self::sync_from_pt`] are the explicit points where the mirror and
/// the live mapping table are reconciled — the caller decides when local
/// edits become visible to the fault handler.
pub struct KernelBackend {
    client: Client,
    mapping: rewire_proto::MappingId,
    base: NonNull<u8>,
    local: Vec<PageId>,
}

impl KernelBackend {
    /// Opens a fresh client and an empty (zero-page) mapping.
    pub fn new() -> Result<Self, RewireError> {
        Self::with_client(Client::open())
    }

    /// Builds a backend against an existing, possibly shared, client.
    pub fn with_client(client: Client) -> Result<Self, RewireError> {
        let (mapping, base) = client.create_mapping(0)?;
        Ok(Self {
            client,
            mapping,
            base,
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
}

impl Backend for KernelBackend {
    /// Rebuilds the mapping at a new size, preserving the surviving
    /// prefix of page ids:
    /// 1. capture the live mapping's current state into the local mirror,
    ///    so a page assigned lazily by a fault (and never pulled back with
    ///    an explicit `sync_from_pt`) is not lost,
    /// 2. snapshot the surviving prefix of the now-current local mirror,
    /// 3. tear down the old virtual region and fault thread,
    /// 4. open a fresh mapping of the new size,
    /// 5. rebuild the local mirror (surviving prefix + `UNASSIGNED` tail),
    /// 6. push the rebuilt mirror to the new mapping's table so faults on
    ///    the surviving prefix resolve to their original physical pages.
    fn resize(&mut self, num_pages: usize) -> Result<(), RewireError> {
        if !self.local.is_empty() {
            self.sync_from_pt(0, self.local.len())?;
        }

        let preserved_len = num_pages.min(self.local.len());
        let preserved: Vec<PageId> = self.local[..preserved_len].to_vec();

        self.client.destroy_mapping(self.mapping);

        let (mapping, base) = self.client.create_mapping(num_pages)?;
        self.mapping = mapping;
        self.base = base;

        self.local = vec![PageId::UNASSIGNED; num_pages];
        self.local[..preserved_len].copy_from_slice(&preserved);

        if num_pages > 0 {
            self.sync_to_pt(0, num_pages)?;
        }
        Ok(())
    }

    fn mapping(&self) -> Option<NonNull<u8>> {
        if self.local.is_empty() {
            None
        } else {
            Some(self.base)
        }
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

    /// Pushes `local[start..start+len]` into the live mapping table, so
    /// the fault handler sees whatever the caller has staged locally.
    fn sync_to_pt(&mut self, start: usize, len: usize) -> Result<(), RewireError> {
        self.bounds_check(start, len)?;
        let ids = self.local[start..start + len].to_vec();
        let cmd = Command::set_page_ids(self.mapping, start, &ids);
        dispatch::handle_command(&self.client, cmd)
    }

    /// Pulls `[start, start+len)` from the live mapping table back into
    /// the local mirror, picking up ids the fault handler assigned lazily.
    fn sync_from_pt(&mut self, start: usize, len: usize) -> Result<(), RewireError> {
        self.bounds_check(start, len)?;
        let mut out = vec![PageId::UNASSIGNED; len];
        let cmd = Command::get_page_ids(self.mapping, start, &mut out);
        dispatch::handle_command(&self.client, cmd)?;
        self.local[start..start + len].copy_from_slice(&out);
        Ok(())
    }

    /// Allocates `out.len()` fresh physical pages from the client's pool
    /// (the mapping table is left untouched) and records them into the
    /// local mirror at `positions`. A later [`Self::sync_to_pt`] call is
    /// what makes them visible to the fault handler.
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
        let cmd = Command::create_page_ids(out);
        dispatch::handle_command(&self.client, cmd)?;
        for (&pos, &id) in positions.iter().zip(out.iter()) {
            if let Some(slot) = self.local.get_mut(pos) {
                *slot = id;
            }
        }
        Ok(())
    }
}

impl Drop for KernelBackend {
    fn drop(&mut self) {
        self.client.destroy_mapping(self.mapping);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    macro_rules! require_uffd {
        () => {
            if !crate::probe_available() {
                eprintln!("skipping: userfaultfd is not usable in this environment");
                return;
            }
        };
    }

    #[test]
    fn resize_preserves_prefix_after_rebuild() {
        require_uffd!();
        let mut backend = KernelBackend::new().expect("open client");
        backend.resize(4).expect("resize to 4 pages");
        backend.page_ids_mut()[0] = PageId::new(7);
        backend.sync_to_pt(0, 4).expect("push mirror to mapping");

        backend.resize(8).expect("grow to 8 pages");
        assert_eq!(backend.num_pages(), 8);
        assert_eq!(backend.page_ids()[0], PageId::new(7));
        assert_eq!(backend.page_ids()[7], PageId::UNASSIGNED);
    }

    #[test]
    fn resize_to_zero_clears_mapping() {
        require_uffd!();
        let mut backend = KernelBackend::new().expect("open client");
        backend.resize(2).expect("resize to 2 pages");
        backend.resize(0).expect("resize to 0 pages");
        assert_eq!(backend.num_pages(), 0);
        assert!(backend.mapping().is_none());
    }

    #[test]
    fn sync_to_pt_rejects_out_of_bounds_range() {
        require_uffd!();
        let mut backend = KernelBackend::new().expect("open client");
        backend.resize(2).expect("resize to 2 pages");
        assert!(backend.sync_to_pt(1, 2).is_err());
    }
}
