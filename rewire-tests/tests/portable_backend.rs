//! End-to-end scenarios against the portable backend, which needs no
//! special privileges and so always runs.

use rewire::{Backend, BackendKind, Factory, PageId, StagedRewiring, PAGE_SIZE};

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn open_portable() -> Box<dyn Backend> {
    Factory::open_kind(BackendKind::Portable).expect("open portable backend")
}

/// Many virtual pages aliased onto the same physical page. A write
/// through one alias must be visible through every other alias, since
/// they are literally the same backing page.
#[test]
fn all_to_one_aliasing() {
    init();
    let mut backend = open_portable();
    backend.resize(4).expect("resize to 4 pages");

    let mut fresh = [PageId::UNASSIGNED];
    backend
        .create_new_page_ids(&[0], &mut fresh)
        .expect("allocate one fresh page");
    let shared = fresh[0];

    for slot in backend.page_ids_mut() {
        *slot = shared;
    }
    backend.sync_to_pt(0, 4).expect("push aliasing to the page table");

    let base = backend.mapping().expect("non-empty mapping has a base").as_ptr();
    // SAFETY: `base` spans 4 freshly mapped, readable/writable pages.
    unsafe {
        *base = 0x42;
        for i in 0..4 {
            assert_eq!(*base.add(i * PAGE_SIZE), 0x42, "page {i} should alias page 0");
        }
    }
}

/// A freshly created page id round-trips through `sync_to_pt` /
/// `sync_from_pt` unchanged.
#[test]
fn identity_round_trip_through_sync() {
    init();
    let mut backend = open_portable();
    backend.resize(2).expect("resize to 2 pages");

    let mut fresh = [PageId::UNASSIGNED, PageId::UNASSIGNED];
    backend
        .create_new_page_ids(&[0, 1], &mut fresh)
        .expect("allocate fresh pages");
    backend.sync_to_pt(0, 2).expect("push to page table");

    backend.sync_from_pt(0, 2).expect("pull back from page table");
    assert_eq!(backend.page_ids(), &fresh);
}

/// Growing a mapping preserves the page ids of its surviving prefix
/// and leaves the new tail unassigned.
#[test]
fn prefix_preserving_resize() {
    init();
    let mut backend = open_portable();
    backend.resize(2).expect("resize to 2 pages");

    let mut fresh = [PageId::UNASSIGNED, PageId::UNASSIGNED];
    backend
        .create_new_page_ids(&[0, 1], &mut fresh)
        .expect("allocate fresh pages");
    backend.sync_to_pt(0, 2).expect("push to page table");

    backend.resize(5).expect("grow to 5 pages");
    assert_eq!(backend.num_pages(), 5);
    assert_eq!(backend.page_ids()[0], fresh[0]);
    assert_eq!(backend.page_ids()[1], fresh[1]);
    // new slots are identity-mapped to their own index, not UNASSIGNED
    assert_eq!(backend.page_ids()[2], PageId::new(2));

    backend.resize(1).expect("shrink to 1 page");
    assert_eq!(backend.num_pages(), 1);
    assert_eq!(backend.page_ids()[0], fresh[0]);
}

/// Staging two ranges that swap into each other and committing them
/// together must produce the swap, not a copy-then-overwrite.
#[test]
fn staged_swap_of_two_ranges() {
    init();
    let mut backend = open_portable();
    backend.resize(4).expect("resize to 4 pages");

    let mut fresh = [PageId::UNASSIGNED; 4];
    let positions = [0, 1, 2, 3];
    backend
        .create_new_page_ids(&positions, &mut fresh)
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

/// Shifting a range one slot to the left via a single staged remap.
#[test]
fn staged_shift_left() {
    init();
    let mut backend = open_portable();
    backend.resize(4).expect("resize to 4 pages");

    let mut fresh = [PageId::UNASSIGNED; 4];
    backend
        .create_new_page_ids(&[0, 1, 2, 3], &mut fresh)
        .expect("allocate fresh pages");
    backend.sync_to_pt(0, 4).expect("push to page table");

    {
        let mut staging = StagedRewiring::new(backend.as_mut());
        staging.stage(0, 1, 3).expect("shift pages 1..4 down to 0..3");
        staging.commit().expect("commit the shift");
    }

    assert_eq!(&backend.page_ids()[0..3], &fresh[1..4]);
}
