//! Raw `userfaultfd(2)` bindings.
//!
//! `libc` does not expose the `UFFDIO_*` ioctls or the `uffd_msg` wire
//! layout (they live in `linux/userfaultfd.h`, not in glibc), so this
//! module defines them the way the small, focused crates in this
//! workspace define any kernel ABI they need directly (see
//! `rewire-proto`). Only what the fault handler and control channel
//! actually use is implemented: `REGISTER`, `COPY`, `UNREGISTER`.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd};

const UFFD_API: u64 = 0xAA;
const UFFDIO: u8 = 0xAA;

const IOC_NRBITS: u32 = 8;
const IOC_TYPEBITS: u32 = 8;
const IOC_SIZEBITS: u32 = 14;
const IOC_NRSHIFT: u32 = 0;
const IOC_TYPESHIFT: u32 = IOC_NRSHIFT + IOC_NRBITS;
const IOC_SIZESHIFT: u32 = IOC_TYPESHIFT + IOC_TYPEBITS;
const IOC_DIRSHIFT: u32 = IOC_SIZESHIFT + IOC_SIZEBITS;
const IOC_READ: u32 = 2;
const IOC_WRITE: u32 = 1;

const fn ioc(dir: u32, ty: u8, nr: u8, size: usize) -> u64 {
    ((dir << IOC_DIRSHIFT)
        | ((ty as u32) << IOC_TYPESHIFT)
        | ((nr as u32) << IOC_NRSHIFT)
        | ((size as u32) << IOC_SIZESHIFT)) as u64
}

const fn iowr(nr: u8, size: usize) -> u64 {
    ioc(IOC_READ | IOC_WRITE, UFFDIO, nr, size)
}

const UFFDIO_API: u8 = 0x3F;
const UFFDIO_REGISTER: u8 = 0x00;
const UFFDIO_UNREGISTER: u8 = 0x01;
const UFFDIO_COPY: u8 = 0x03;

pub const UFFD_EVENT_PAGEFAULT: u8 = 0x12;
pub const UFFDIO_REGISTER_MODE_MISSING: u64 = 1 << 0;

#[repr(C)]
struct UffdioApi {
    api: u64,
    features: u64,
    ioctls: u64,
}

#[repr(C)]
struct UffdioRange {
    start: u64,
    len: u64,
}

#[repr(C)]
struct UffdioRegister {
    range: UffdioRange,
    mode: u64,
    ioctls: u64,
}

#[repr(C)]
struct UffdioCopy {
    dst: u64,
    src: u64,
    len: u64,
    mode: u64,
    copy: i64,
}

/// Layout of `struct uffd_msg` (`linux/userfaultfd.h`), trimmed to the
/// `pagefault` arm of its union — the only event this engine handles.
#[repr(C)]
pub struct UffdMsg {
    pub event: u8,
    _reserved1: u8,
    _reserved2: u16,
    _reserved3: u32,
    pub flags: u64,
    pub address: u64,
    _feat_ptid: u32,
    _pad: [u8; 20],
}

fn check(ret: libc::c_long, call: &'static str) -> Result<libc::c_long, io::Error> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        let _ = call;
        Ok(ret)
    }
}

/// Opens a new userfaultfd with `O_CLOEXEC` and performs the `UFFDIO_API`
/// handshake.
pub fn open() -> io::Result<OwnedFd> {
    use std::os::fd::FromRawFd;

    // SAFETY: `userfaultfd(2)` has no memory-safety preconditions; it
    // returns a plain file descriptor or -1/errno.
    let raw = unsafe { libc::syscall(libc::SYS_userfaultfd, libc::O_CLOEXEC) };
    let raw = check(raw, "userfaultfd")?;
    // SAFETY: `raw` is a just-created, uniquely owned fd.
    let fd = unsafe { OwnedFd::from_raw_fd(raw as i32) };

    let mut api = UffdioApi {
        api: UFFD_API,
        features: 0,
        ioctls: 0,
    };
    // SAFETY: `api` is a valid, exclusively-borrowed `uffdio_api` and the
    // ioctl number/size match its layout.
    let ret = unsafe {
        libc::ioctl(
            fd.as_raw_fd(),
            iowr(UFFDIO_API, size_of::<UffdioApi>()) as _,
            std::ptr::addr_of_mut!(api),
        )
    };
    check(ret.into(), "UFFDIO_API")?;

    Ok(fd)
}

/// Registers `[addr, addr+len)` for missing-page notifications.
pub fn register(fd: &OwnedFd, addr: usize, len: usize) -> io::Result<()> {
    let mut reg = UffdioRegister {
        range: UffdioRange {
            start: addr as u64,
            len: len as u64,
        },
        mode: UFFDIO_REGISTER_MODE_MISSING,
        ioctls: 0,
    };
    // SAFETY: `reg` is valid for the duration of the call; the ioctl
    // number matches `struct uffdio_register`'s layout and size.
    let ret = unsafe {
        libc::ioctl(
            fd.as_raw_fd(),
            iowr(UFFDIO_REGISTER, size_of::<UffdioRegister>()) as _,
            std::ptr::addr_of_mut!(reg),
        )
    };
    check(ret.into(), "UFFDIO_REGISTER")?;
    Ok(())
}

/// Unregisters `[addr, addr+len)`.
pub fn unregister(fd: &OwnedFd, addr: usize, len: usize) -> io::Result<()> {
    let mut range = UffdioRange {
        start: addr as u64,
        len: len as u64,
    };
    let req = ioc(IOC_READ, UFFDIO, UFFDIO_UNREGISTER, size_of::<UffdioRange>());
    // SAFETY: `range` is valid for the duration of the call.
    let ret = unsafe { libc::ioctl(fd.as_raw_fd(), req as _, std::ptr::addr_of_mut!(range)) };
    check(ret.into(), "UFFDIO_UNREGISTER")?;
    Ok(())
}

/// Resolves a fault at `dst` by copying `PAGE_SIZE` bytes from `src` into
/// the faulting page. `src` must point at a page-sized buffer that stays
/// valid for the duration of the call.
pub fn copy(fd: &OwnedFd, dst: usize, src: *const u8, len: usize) -> io::Result<()> {
    let mut copy = UffdioCopy {
        dst: dst as u64,
        src: src as u64,
        len: len as u64,
        mode: 0,
        copy: 0,
    };
    // SAFETY: `src` is valid for `len` bytes per this function's contract;
    // `dst` names a page previously registered with this uffd.
    let ret = unsafe {
        libc::ioctl(
            fd.as_raw_fd(),
            iowr(UFFDIO_COPY, size_of::<UffdioCopy>()) as _,
            std::ptr::addr_of_mut!(copy),
        )
    };
    check(ret.into(), "UFFDIO_COPY")?;
    Ok(())
}

/// Blocking read of the next fault event, or `Ok(None)` if the fd was
/// closed from under us (`read` returning 0, which happens when the
/// owning mapping is torn down concurrently).
pub fn read_fault(fd: &OwnedFd) -> io::Result<Option<UffdMsg>> {
    let mut msg = UffdMsg {
        event: 0,
        _reserved1: 0,
        _reserved2: 0,
        _reserved3: 0,
        flags: 0,
        address: 0,
        _feat_ptid: 0,
        _pad: [0; 20],
    };
    // SAFETY: `msg` is sized exactly like `struct uffd_msg` and is a
    // valid write target for `read(2)`.
    let n = unsafe {
        libc::read(
            fd.as_raw_fd(),
            std::ptr::addr_of_mut!(msg).cast(),
            size_of::<UffdMsg>(),
        )
    };
    if n == 0 {
        return Ok(None);
    }
    if n < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(None);
        }
        return Err(err);
    }
    Ok(Some(msg))
}
