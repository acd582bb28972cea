//! Kernel-mediated rewiring backend.
//!
//! A kernel module realizing this contract would speak to userspace
//! through a character device's `ioctl` surface and a VMA fault handler.
//! Loading a kernel module is out of scope for this crate (OS packaging —
//! module loading, device node creation — is somebody else's job), so
//! this crate reproduces the same contract — a per-client page pool, a
//! per-mapping page-id table, a mutex-serialized control channel, and lazy
//! fault-driven allocation — entirely in userspace, using `userfaultfd(2)`
//! as the fault-resolution mechanism in place of a custom VMA `fault()`
//! callback.
//!
//! [`KernelBackend`] is the [`rewire_types::Backend`] implementation;
//! [`Client`] is the reusable piece underneath it, in case more than one
//! backend instance needs to share a page pool.

mod backend;
mod client;
mod dispatch;
mod mapping;
mod uffd;

pub use backend::KernelBackend;
pub use client::Client;

/// Probes whether `userfaultfd(2)` is usable in this process — either
/// because it is running as root, has `CAP_SYS_PTRACE`, or the
/// distribution has `vm.unprivileged_userfaultfd` enabled. Used by the
/// top-level factory to decide whether to offer this backend at all
/// before a caller ever tries to open one.
#[must_use]
pub fn probe_available() -> bool {
    uffd::open().is_ok()
}
