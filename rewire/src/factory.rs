//! Backend factory: probes for kernel-mediated rewiring availability,
//! returns whichever backend fits, and falls back to the portable backend
//! with a warning logging the OS `max_map_count` when it doesn't.
//!
//! There is no character device to probe here (see `rewire-kernel`'s
//! crate docs for why), so "probing availability" means asking whether
//! `userfaultfd(2)` itself is usable in this process.

use std::env;
use std::fmt;

use log::warn;

use rewire_types::{Backend, RewireError};

/// Which concrete backend a [`Factory`] chose or was told to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Kernel,
    Portable,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Kernel => "kernel",
            Self::Portable => "portable",
        })
    }
}

/// Opens the backend appropriate for the running machine and the
/// `REWIRE_BACKEND` environment variable (`auto` by default).
pub struct Factory;

impl Factory {
    /// Opens `REWIRE_BACKEND`'s choice, or probes for the best available
    /// backend under `auto` (the default when the variable is unset or
    /// unrecognized).
    pub fn open() -> Result<Box<dyn Backend>, RewireError> {
        let kind = match requested_backend() {
            Some(kind) => kind,
            None if rewire_kernel::probe_available() => BackendKind::Kernel,
            None => {
                warn!(
                    "rewire: userfaultfd unavailable, falling back to the portable backend \
                     (vm.max_map_count={})",
                    max_map_count()
                );
                BackendKind::Portable
            }
        };
        Self::open_kind(kind)
    }

    /// Opens a specific backend, bypassing availability probing.
    pub fn open_kind(kind: BackendKind) -> Result<Box<dyn Backend>, RewireError> {
        match kind {
            BackendKind::Kernel => Ok(Box::new(rewire_kernel::KernelBackend::new()?)),
            BackendKind::Portable => Ok(Box::new(rewire_portable::PortableBackend::new()?)),
        }
    }
}

fn requested_backend() -> Option<BackendKind> {
    parse_requested(env::var("REWIRE_BACKEND").ok().as_deref())
}

fn parse_requested(raw: Option<&str>) -> Option<BackendKind> {
    match raw {
        Some("kernel") => Some(BackendKind::Kernel),
        Some("portable") => Some(BackendKind::Portable),
        Some("auto") | None => None,
        Some(other) => {
            warn!("rewire: ignoring unrecognized REWIRE_BACKEND={other:?}, using auto");
            None
        }
    }
}

fn max_map_count() -> u64 {
    if let Some(n) = parse_max_map_count_override(env::var("REWIRE_MAX_MAP_COUNT").ok().as_deref())
    {
        return n;
    }
    std::fs::read_to_string("/proc/sys/vm/max_map_count")
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(65530)
}

fn parse_max_map_count_override(raw: Option<&str>) -> Option<u64> {
    raw.and_then(|s| s.parse().ok())
}
