//! Page rewiring: remap individual virtual pages of a contiguous region
//! to arbitrary backing physical pages, far below the cost of `mmap`
//! or `mremap` over the whole region.
//!
//! This crate is the public façade: it re-exports the shared data model
//! ([`Backend`], [`PageId`], [`RewireError`]), the staged-commit
//! composition layer ([`StagedRewiring`]), and [`Factory`], which probes
//! which concrete backend is actually usable on this machine and opens
//! it.

pub use rewire_staging::StagedRewiring;
pub use rewire_types::{Backend, PageId, RewireError, PAGE_SIZE};

pub use rewire_kernel::KernelBackend;
pub use rewire_portable::PortableBackend;

mod factory;

pub use factory::{BackendKind, Factory};
