//! End-to-end scenarios against the kernel-mediated backend. These need
//! `userfaultfd(2)` to be usable in the current process (root,
//! `CAP_SYS_PTRACE`, or `vm.unprivileged_userfaultfd=1`); when it is not,
//! the tests skip themselves rather than fail, the same way the rest of
//! this workspace treats environment it cannot assume.

use rewire::{Backend, BackendKind, Factory, PageId, StagedRewiring, PAGE_SIZE};

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

macro_rules! require_uffd {
    () => {
        if !rewire_kernel::probe_available() {
            eprintln!("skipping: userfaultfd is not usable in this environment");
            return;
        }
    };
}

/// Reading a page that has never been given a real page id lazily
/// allocates one through the fault handler, and the result reads back as
/// a zeroed page.
#[test]
fn fault_in_allocates_lazily() {
    init();
    require_uffd!();

    let mut backend = Factory::open_kind(BackendKind::Kernel).expect("open kernel backend");
    backend.resize(1).expect("resize to 1 page");
    assert_eq!(backend.page_ids()[0], PageId::UNASSIGNED);

    let base = backend.mapping().expect("non-empty mapping has a base").as_ptr();
    // SAFETY: `base` is a single registered page; touching it resolves
    // the fault synchronously before the access completes.
    let first_byte = unsafe { base.read_volatile() };
    assert_eq!(first_byte, 0, "a lazily faulted page starts zeroed");

    backend.sync_from_pt(0, 1).expect("pull the fault handler's assignment");
    assert_ne!(backend.page_ids()[0], PageId::UNASSIGNED, "the fault must have assigned a real page");
}

/// Two aliases onto the same physical page still observe each other's
/// writes when the backing page was assigned lazily via a fault rather
/// than an explicit `SET_PAGE_IDS`.
#[test]
fn lazily_faulted_page_can_be_aliased() {
    init();
    require_uffd!();

    let mut backend = Factory::open_kind(BackendKind::Kernel).expect("open kernel backend");
    backend.resize(2).expect("resize to 2 pages");

    let base = backend.mapping().expect("non-empty mapping has a base").as_ptr();
    // SAFETY: touching page 0 resolves its fault before the write lands.
    unsafe {
        *base = 7;
    }
    backend.sync_from_pt(0, 1).expect("pull page 0's assigned id");
    let assigned = backend.page_ids()[0];

    backend.page_ids_mut()[1] = assigned;
    backend.sync_to_pt(1, 1).expect("alias page 1 onto page 0's physical page");

    // SAFETY: page 1 is now backed by the same physical page as page 0.
    let aliased_byte = unsafe { base.add(PAGE_SIZE).read_volatile() };
    assert_eq!(aliased_byte, 7);
}

/// A page already resolved by one fault gets re-wired onto a
/// different physical page by `SET_PAGE_IDS`, and the new backing page
/// is what later reads observe — this is the scenario that requires
/// `SET_PAGE_IDS` to repopulate PTEs rather than rely on `userfaultfd`'s
/// one-shot fault resolution.
#[test]
fn set_page_ids_rewires_an_already_faulted_page() {
    init();
    require_uffd!();

    let mut backend = Factory::open_kind(BackendKind::Kernel).expect("open kernel backend");
    backend.resize(2).expect("resize to 2 pages");

    let base = backend.mapping().expect("non-empty mapping has a base").as_ptr();
    // SAFETY: touching page 0 resolves its fault, installing some fresh
    // physical page the fault handler chose.
    unsafe {
        *base = 1;
    }

    let mut shared = [PageId::UNASSIGNED];
    backend
        .create_new_page_ids(&[0], &mut shared)
        .expect("allocate a fresh page to alias onto, and install it at offset 0");
    backend.sync_to_pt(0, 1).expect("rewire page 0 onto the fresh page");

    // SAFETY: page 0's PTE must now reference the freshly allocated
    // page, which starts zeroed, not the page the earlier fault wrote 1 into.
    let rewired_byte = unsafe { base.read_volatile() };
    assert_eq!(rewired_byte, 0, "SET_PAGE_IDS must repopulate an already-resolved page");
}

/// Growing a kernel-mediated mapping preserves the surviving
/// prefix's page ids and leaves the new tail `UNASSIGNED`.
#[test]
fn prefix_preserving_resize() {
    init();
    require_uffd!();

    let mut backend = Factory::open_kind(BackendKind::Kernel).expect("open kernel backend");
    backend.resize(2).expect("resize to 2 pages");

    let mut fresh = [PageId::UNASSIGNED, PageId::UNASSIGNED];
    backend
        .create_new_page_ids(&[0, 1], &mut fresh)
        .expect("allocate fresh pages");
    backend.sync_to_pt(0, 2).expect("push to page table");

    backend.resize(4).expect("grow to 4 pages");
    assert_eq!(backend.num_pages(), 4);
    assert_eq!(backend.page_ids()[0], fresh[0]);
    assert_eq!(backend.page_ids()[1], fresh[1]);
    assert_eq!(backend.page_ids()[2], PageId::UNASSIGNED);
}

/// Staging a swap of two ranges and committing produces the swap,
/// not a copy-then-overwrite, against the kernel-mediated backend too.
#[test]
fn staged_swap_of_two_ranges() {
    init();
    require_uffd!();

    let mut backend = Factory::open_kind(BackendKind::Kernel).expect("open kernel backend");
    backend.resize(4).expect("resize to 4 pages");

    let mut fresh = [PageId::UNASSIGNED; 4];
    backend
        .create_new_page_ids(&[0, 1, 2, 3], &mut fresh)
        .expect("allocate fresh pages");
    backend.sync_to_pt(0, 4).expect("push to page table");
    let (left, right) = (fresh[0..2].to_vec(), fresh[2..4].to_vec());

    {
        let mut staging = StagedRewiring::new(backend.as_mut());
        staging.stage(0, 2, 2).expect("stage right half into left half");
        staging.stage(2, 0, 2).expect("stage left half into right half");
        staging.commit().expect("commit the swap");
    }

    assert_eq!(&backend.page_ids()[0..2], right.as_slice());
    assert_eq!(&backend.page_ids()[2..4], left.as_slice());
}
