/// Error taxonomy for the page rewiring engine.
///
/// Every backend surfaces failures through this type. Nothing in this
/// crate attempts local recovery: commands are not retried, and a backend
/// that returns [`RewireError::Syscall`] must be dropped by its caller.
#[derive(Debug, thiserror::Error)]
pub enum RewireError {
    /// The kernel (or the process, for the portable backend) could not
    /// allocate a physical page, a temporary buffer, or grow an internal
    /// array. No partial mutation was committed.
    #[error("page allocation failed: out of memory")]
    OutOfMemory,

    /// A command's `start + len` exceeded the mapping's page count.
    #[error("range [{start}, {end}) is out of bounds for a mapping of {num_pages} pages")]
    OutOfBounds {
        start: usize,
        end: usize,
        num_pages: usize,
    },

    /// A page fault occurred on an offset outside the mapping.
    ///
    /// A real kernel module would deliver `SIGSEGV` to the faulting
    /// process; this library, having no kernel-level authority over the
    /// faulting process, surfaces it to whichever thread owns the mapping
    /// so the caller can decide how to fail.
    #[error("invalid offset {offset} in a mapping of {num_pages} pages")]
    InvalidOffset { offset: usize, num_pages: usize },

    /// A required OS primitive (mmap, munmap, ioctl, userfaultfd, ...)
    /// failed. The backend object that produced this error is left in an
    /// unspecified state and must be dropped.
    #[error("syscall {call} failed: {source}")]
    Syscall {
        call: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// The caller used a backend past the point where its state is
    /// defined (e.g. syncing a zero-page mapping).
    #[error("operation {op} is not valid on a mapping of {num_pages} pages")]
    InvalidState {
        op: &'static str,
        num_pages: usize,
    },
}

impl RewireError {
    #[must_use]
    pub fn syscall(call: &'static str) -> Self {
        Self::Syscall {
            call,
            source: std::io::Error::last_os_error(),
        }
    }

    /// Wraps an OS error code (e.g. from `nix::Error as i32`) as a syscall
    /// failure attributed to `call`.
    #[must_use]
    pub fn syscall_errno(call: &'static str, errno: i32) -> Self {
        Self::Syscall {
            call,
            source: std::io::Error::from_raw_os_error(errno),
        }
    }
}
