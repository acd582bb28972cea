//! Client state: one open handle against the rewiring engine. Opening a
//! client attaches a fresh page pool to it.

use std::collections::HashMap;
use std::os::fd::OwnedFd;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use log::{error, warn};
use nix::poll::{PollFd, PollFlags, PollTimeout};
use nix::sys::eventfd::{EfdFlags, EventFd};
use nix::sys::mman::{mmap_anonymous, munmap, MapFlags, ProtFlags};

use page_pool::PagePool;
use rewire_proto::MappingId;
use rewire_types::{PageId, RewireError, PAGE_SIZE};

use crate::mapping::MappingTable;
use crate::uffd;

/// One live virtual region plus everything needed to resolve its faults.
struct MappingRegion {
    table: MappingTable,
    base: NonNull<u8>,
    len_bytes: usize,
    uffd: Arc<OwnedFd>,
    stop: Arc<AtomicBool>,
    wake: Arc<EventFd>,
    fault_thread: Option<JoinHandle<()>>,
}

// SAFETY: `NonNull<u8>` here always refers to an mmap'd region owned by
// this struct; it is never aliased outside the client's mutex.
unsafe impl Send for MappingRegion {}

pub(crate) struct ClientInner {
    pool: PagePool,
    mappings: HashMap<MappingId, MappingRegion>,
    next_id: u64,
    /// Set when a fault handler hit resource exhaustion it could not
    /// recover from; every subsequent control call fails fast instead of
    /// touching a pool that may be in an inconsistent state.
    poisoned: bool,
}

/// One open handle against the rewiring engine, analogous to an open file
/// descriptor on a kernel-mediated paging device. Owns exactly one
/// [`PagePool`] and zero or more mappings, all guarded by one mutex that
/// serializes fault handling and control commands for this client.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Mutex<ClientInner>>,
}

impl Client {
    /// Opens a fresh client with an empty page pool.
    #[must_use]
    pub fn open() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ClientInner {
                pool: PagePool::new(),
                mappings: HashMap::new(),
                next_id: 0,
                poisoned: false,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ClientInner> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn check_poisoned(&self) -> Result<(), RewireError> {
        if self.lock().poisoned {
            return Err(RewireError::InvalidState {
                op: "client is poisoned after an unrecoverable fault",
                num_pages: 0,
            });
        }
        Ok(())
    }

    /// Creates a fresh mapping of `num_pages` pages, all slots
    /// `UNASSIGNED`. Returns its id and base address.
    pub fn create_mapping(&self, num_pages: usize) -> Result<(MappingId, NonNull<u8>), RewireError> {
        self.check_poisoned()?;
        let len_bytes = num_pages * PAGE_SIZE;

        let base = if len_bytes == 0 {
            // A zero-length mapping has no virtual region at all: `resize(0)`
            // is legal, and the returned base address may be dangling.
            let mut inner = self.lock();
            let id = MappingId::from_raw(inner.next_id);
            inner.next_id += 1;
            inner.mappings.insert(
                id,
                MappingRegion {
                    table: MappingTable::new(0),
                    base: NonNull::dangling(),
                    len_bytes: 0,
                    uffd: Arc::new(dummy_fd()?),
                    stop: Arc::new(AtomicBool::new(true)),
                    wake: Arc::new(EventFd::from_value_and_flags(0, EfdFlags::EFD_CLOEXEC)
                        .map_err(|e| RewireError::syscall_errno("eventfd", e as i32))?),
                    fault_thread: None,
                },
            );
            return Ok((id, NonNull::dangling()));
        } else {
            // SAFETY: length is a positive multiple of the page size;
            // we own the returned mapping exclusively.
            unsafe {
                mmap_anonymous(
                    None,
                    std::num::NonZeroUsize::new(len_bytes).unwrap(),
                    ProtFlags::PROT_NONE,
                    MapFlags::MAP_PRIVATE,
                )
            }
            .map_err(|e| RewireError::syscall_errno("mmap", e as i32))?
        };

        let uffd = uffd::open().map_err(|e| RewireError::Syscall {
            call: "userfaultfd",
            source: e,
        })?;
        uffd::register(&uffd, base.as_ptr() as usize, len_bytes).map_err(|e| {
            RewireError::Syscall {
                call: "UFFDIO_REGISTER",
                source: e,
            }
        })?;

        let uffd = Arc::new(uffd);
        let stop = Arc::new(AtomicBool::new(false));
        let wake = Arc::new(
            EventFd::from_value_and_flags(0, EfdFlags::EFD_CLOEXEC)
                .map_err(|e| RewireError::syscall_errno("eventfd", e as i32))?,
        );

        let mut inner = self.lock();
        let id = MappingId::from_raw(inner.next_id);
        inner.next_id += 1;
        inner.mappings.insert(
            id,
            MappingRegion {
                table: MappingTable::new(num_pages),
                base,
                len_bytes,
                uffd: Arc::clone(&uffd),
                stop: Arc::clone(&stop),
                wake: Arc::clone(&wake),
                fault_thread: None,
            },
        );
        drop(inner);

        let handle = spawn_fault_thread(self.clone(), id, uffd, stop, wake);
        self.lock().mappings.get_mut(&id).unwrap().fault_thread = Some(handle);

        Ok((id, base))
    }

    /// Tears down a mapping: unregisters its uffd range, stops its fault
    /// thread, unmaps its virtual region, and drops its page-id table. The
    /// mapping is always torn down before the pool it references could be
    /// freed, since the pool lives in the same `Client` and is only freed
    /// on `Client::drop`.
    pub fn destroy_mapping(&self, id: MappingId) {
        let Some(mut region) = self.lock().mappings.remove(&id) else {
            return;
        };
        region.stop.store(true, Ordering::SeqCst);
        let _ = region.wake.write(1);
        if let Some(handle) = region.fault_thread.take() {
            let _ = handle.join();
        }
        if region.len_bytes > 0 {
            let _ = uffd::unregister(&region.uffd, region.base.as_ptr() as usize, region.len_bytes);
            // SAFETY: `base`/`len_bytes` describe exactly the region this
            // client mmap'd in `create_mapping`, and the fault thread has
            // already joined.
            unsafe {
                let _ = munmap(region.base, region.len_bytes);
            }
        }
    }

    pub(crate) fn with_mapping_mut<R>(
        &self,
        id: MappingId,
        f: impl FnOnce(&mut MappingTable, &mut PagePool) -> R,
    ) -> Option<R> {
        let mut inner = self.lock();
        let ClientInner { pool, mappings, .. } = &mut *inner;
        mappings.get_mut(&id).map(|region| f(&mut region.table, pool))
    }

    /// `SET_PAGE_IDS`: installs `ids` into the mapping table starting at
    /// `start`, then repopulates PTEs for `[start, start+len)` so that
    /// subsequent accesses use the new mapping instead of whatever
    /// `userfaultfd` may have already resolved for a previously-touched
    /// page. Returns `None` if `id` names no live mapping.
    ///
    /// Everything happens under one acquisition of the client's mutex:
    /// first zap PTEs over the affected range, then install a PTE for
    /// every real page id, leaving `UNASSIGNED` offsets to fault lazily —
    /// done here with `MADV_DONTNEED` (the userspace substitute for
    /// zapping a PTE directly) followed by an eager `UFFDIO_COPY` per real
    /// page id.
    pub(crate) fn set_page_ids(
        &self,
        id: MappingId,
        start: usize,
        ids: &[PageId],
    ) -> Option<Result<(), RewireError>> {
        let mut inner = self.lock();
        let ClientInner { pool, mappings, .. } = &mut *inner;
        let region = mappings.get_mut(&id)?;

        let num_pages = region.table.len();
        let end = start.checked_add(ids.len()).unwrap_or(usize::MAX);
        if end > num_pages {
            return Some(Err(RewireError::OutOfBounds {
                start,
                end,
                num_pages,
            }));
        }

        for (i, &page_id) in ids.iter().enumerate() {
            region.table.set(pool, start + i, page_id);
        }

        if region.len_bytes > 0 && !ids.is_empty() {
            let base = region.base.as_ptr() as usize;
            let addr_start = base + start * PAGE_SIZE;
            // SAFETY: `[addr_start, addr_start + ids.len()*PAGE_SIZE)` lies
            // entirely within this region's own mmap'd range.
            let ret = unsafe {
                libc::madvise(
                    addr_start as *mut libc::c_void,
                    ids.len() * PAGE_SIZE,
                    libc::MADV_DONTNEED,
                )
            };
            if ret != 0 {
                let err = std::io::Error::last_os_error();
                error!("rewire-kernel: madvise(MADV_DONTNEED) failed during SET_PAGE_IDS: {err}");
                return Some(Err(RewireError::Syscall {
                    call: "madvise(MADV_DONTNEED)",
                    source: err,
                }));
            }
            for offset in start..start + ids.len() {
                let page_id = region.table.get(offset);
                if !page_id.is_real() {
                    continue;
                }
                let Some(bytes) = pool.page_bytes(page_id) else {
                    continue;
                };
                let fault_addr = base + offset * PAGE_SIZE;
                if let Err(e) = uffd::copy(&region.uffd, fault_addr, bytes.as_ptr(), PAGE_SIZE) {
                    error!("rewire-kernel: eager UFFDIO_COPY during SET_PAGE_IDS failed: {e}");
                    return Some(Err(RewireError::Syscall {
                        call: "UFFDIO_COPY",
                        source: e,
                    }));
                }
            }
        }

        Some(Ok(()))
    }

    pub(crate) fn with_pool_mut<R>(&self, f: impl FnOnce(&mut PagePool) -> R) -> R {
        f(&mut self.lock().pool)
    }

    fn poison(&self) {
        self.lock().poisoned = true;
    }
}

fn dummy_fd() -> Result<OwnedFd, RewireError> {
    // A zero-page mapping registers nothing with `userfaultfd`; this fd
    // exists only so `MappingRegion` does not need an `Option`.
    nix::unistd::pipe()
        .map(|(r, _w)| r)
        .map_err(|e| RewireError::syscall_errno("pipe", e as i32))
}

fn spawn_fault_thread(
    client: Client,
    id: MappingId,
    uffd: Arc<OwnedFd>,
    stop: Arc<AtomicBool>,
    wake: Arc<EventFd>,
) -> JoinHandle<()> {
    std::thread::spawn(move || fault_loop(client, id, &uffd, &stop, &wake))
}

/// The fault handler, adapted to `userfaultfd`: instead of a VMA
/// `fault()` callback installing a PTE under a mutex, a dedicated thread
/// per mapping blocks in `poll()` on the uffd and a wake eventfd, and
/// resolves each notification under the client's mutex. A fault
/// resolves in five steps: 1. lock, 2. bounds check (vestigial here —
/// `userfaultfd` only reports addresses inside the registered range),
/// 3. lazy alloc on UNASSIGNED, 4. install (here: `UFFDIO_COPY`),
/// 5. unlock.
fn fault_loop(
    client: Client,
    id: MappingId,
    uffd: &OwnedFd,
    stop: &AtomicBool,
    wake: &EventFd,
) {
    use std::os::fd::AsFd;

    loop {
        if stop.load(Ordering::SeqCst) {
            return;
        }

        let mut fds = [
            PollFd::new(uffd.as_fd(), PollFlags::POLLIN),
            PollFd::new(wake.as_fd(), PollFlags::POLLIN),
        ];
        match nix::poll::poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => {
                error!("rewire-kernel: poll failed: {e}");
                return;
            }
        }

        if stop.load(Ordering::SeqCst) {
            return;
        }
        let Some(revents) = fds[0].revents() else {
            continue;
        };
        if !revents.contains(PollFlags::POLLIN) {
            continue;
        }

        let msg = match uffd::read_fault(uffd) {
            Ok(Some(msg)) => msg,
            Ok(None) => return,
            Err(e) => {
                error!("rewire-kernel: reading uffd event failed: {e}");
                return;
            }
        };
        if msg.event != uffd::UFFD_EVENT_PAGEFAULT {
            continue;
        }

        let fault_page = (msg.address as usize) & !(PAGE_SIZE - 1);
        resolve_fault(&client, id, uffd, fault_page);
    }
}

fn resolve_fault(client: &Client, id: MappingId, uffd: &OwnedFd, fault_page: usize) {
    let Some(base) = client.lock().mappings.get(&id).map(|r| r.base.as_ptr() as usize) else {
        return;
    };
    let offset = (fault_page - base) / PAGE_SIZE;

    let resolved = client.with_mapping_mut(id, |table, pool| {
        let mut page_id = table.get(offset);
        if page_id.is_offset_invalid() {
            warn!("rewire-kernel: fault at invalid offset {offset}");
            return None;
        }
        if page_id.is_unassigned() {
            page_id = pool.alloc_new_page();
            if page_id.is_unassigned() {
                error!("rewire-kernel: out of memory resolving fault at offset {offset}");
                return Some(None);
            }
            table.set(pool, offset, page_id);
        }
        Some(Some(*pool.page_bytes(page_id).expect("just-resolved page id is valid")))
    });

    match resolved {
        Some(Some(bytes)) => {
            if let Err(e) = uffd::copy(uffd, fault_page, bytes.as_ptr(), PAGE_SIZE) {
                error!("rewire-kernel: UFFDIO_COPY failed: {e}");
            }
        }
        Some(None) => {
            // Resource exhaustion: unblock the faulting thread with a
            // static zero page so it does not hang forever, and poison
            // the client so every subsequent control call fails fast.
            static ZERO_PAGE: [u8; PAGE_SIZE] = [0; PAGE_SIZE];
            let _ = uffd::copy(uffd, fault_page, ZERO_PAGE.as_ptr(), PAGE_SIZE);
            client.poison();
        }
        None => {}
    }
}
