//! Mirrored virtual-memory mapping: two adjacent page ranges that alias
//! the same physical pages, so a ring buffer's wrap boundary never needs
//! a split read or write.
//!
//! Grounded on `vmap::os::unix::posix::map_ring`: reserve `2*len` bytes
//! of anonymous address space, then map a shared memory file descriptor
//! into each half at a fixed address.

use crate::error::{Error, Operation, Result};
use std::os::raw::c_int;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};

/// Reserves a `2 * len` byte mirror mapping and returns the base pointer.
///
/// # Safety
/// `len` must already be a multiple of the system page size.
pub unsafe fn map_ring(len: usize) -> Result<*mut u8> {
    let fd = open_backing_fd(len)?;
    let result = wrap_fd(len, fd);
    libc::close(fd);
    result
}

/// Releases a mapping previously returned by [`map_ring`].
///
/// # Safety
/// `ptr`/`len` must be the exact pair returned by a prior `map_ring` call
/// that has not already been unmapped.
pub unsafe fn unmap_ring(ptr: *mut u8, len: usize) -> Result<()> {
    if libc::munmap(ptr as *mut libc::c_void, len * 2) < 0 {
        Err(Error::last_os_error(Operation::RingAllocate))
    } else {
        Ok(())
    }
}

unsafe fn wrap_fd(len: usize, fd: c_int) -> Result<*mut u8> {
    let base = mmap_at(
        ptr::null_mut(),
        len * 2,
        libc::PROT_NONE,
        libc::MAP_PRIVATE | libc::MAP_ANON,
        -1,
        Operation::RingAllocate,
    )?;

    if let Err(err) = mmap_fixed(base, len, fd, Operation::RingRemapPrimary) {
        let _ = libc::munmap(base as *mut libc::c_void, len * 2);
        return Err(err);
    }
    if let Err(err) = mmap_fixed(base.add(len), len, fd, Operation::RingRemapSecondary) {
        let _ = libc::munmap(base as *mut libc::c_void, len * 2);
        return Err(err);
    }
    Ok(base)
}

unsafe fn mmap_fixed(addr: *mut u8, len: usize, fd: c_int, op: Operation) -> Result<()> {
    mmap_at(
        addr,
        len,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_SHARED | libc::MAP_FIXED,
        fd,
        op,
    )
    .map(|_| ())
}

unsafe fn mmap_at(
    addr: *mut u8,
    len: usize,
    prot: c_int,
    flags: c_int,
    fd: c_int,
    op: Operation,
) -> Result<*mut u8> {
    let p = libc::mmap(addr as *mut libc::c_void, len, prot, flags, fd, 0);
    if p == libc::MAP_FAILED {
        Err(Error::last_os_error(op))
    } else {
        Ok(p as *mut u8)
    }
}

/// Opens a shared-memory file descriptor truncated to `len` bytes. Uses
/// `memfd_create` on Linux; falls back to a named, immediately-unlinked
/// `shm_open` elsewhere (macOS has no `memfd_create`).
unsafe fn open_backing_fd(len: usize) -> Result<c_int> {
    let fd = backing_open()?;
    if libc::ftruncate(fd, len as libc::off_t) < 0 {
        let err = Error::last_os_error(Operation::RingMemoryFd);
        libc::close(fd);
        return Err(err);
    }
    Ok(fd)
}

#[cfg(any(target_os = "linux", target_os = "android"))]
unsafe fn backing_open() -> Result<c_int> {
    const NAME: &[u8] = b"nbsock-ring\0";
    let fd = libc::syscall(
        libc::SYS_memfd_create,
        NAME.as_ptr() as *const std::os::raw::c_char,
        libc::MFD_CLOEXEC,
    );
    if fd < 0 {
        Err(Error::last_os_error(Operation::RingMemoryFd))
    } else {
        Ok(fd as c_int)
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
unsafe fn backing_open() -> Result<c_int> {
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let oflags = libc::O_RDWR | libc::O_CREAT | libc::O_EXCL | libc::O_CLOEXEC;
    loop {
        let unique = COUNTER.fetch_add(1, Ordering::Relaxed);
        let name = format!("/nbsock-ring-{}-{}\0", libc::getpid(), unique);
        let fd = libc::shm_open(name.as_ptr() as *const std::os::raw::c_char, oflags, 0o600);
        if fd < 0 {
            let err = Error::last_os_error(Operation::RingMemoryFd);
            if err.raw_os_error() != Some(libc::EEXIST) {
                return Err(err);
            }
            continue;
        }
        libc::shm_unlink(name.as_ptr() as *const std::os::raw::c_char);
        return Ok(fd);
    }
}

/// Rounds `len` up to the nearest multiple of the system page size.
pub fn round_up_to_page(len: usize) -> usize {
    let page = page_size();
    let mask = page - 1;
    (len + mask) & !mask
}

pub fn page_size() -> usize {
    static CACHED: AtomicU64 = AtomicU64::new(0);
    let cached = CACHED.load(Ordering::Relaxed);
    if cached != 0 {
        return cached as usize;
    }
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as u64;
    CACHED.store(size, Ordering::Relaxed);
    size as usize
}
