//! Memory mapping and executable-memory allocation.
//!
//! This module abstracts the host OS's `mmap`/`VirtualAlloc`-equivalent
//! behind a single [`Mmap`] trait, exactly the way the teacher crate
//! abstracts memory mapping for ELF segment loading — here it backs the JIT
//! arena (§4.5, §4.6) and the compiled code segments (§4.4) instead of
//! `.so` segments.

use crate::Result;
use bitflags::bitflags;
use core::ffi::c_int;
use std::ptr::NonNull;

cfg_if::cfg_if! {
    if #[cfg(windows)] {
        mod windows;
        pub use windows::HostMmap;
    } else {
        mod unix;
        pub use unix::HostMmap;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    /// Memory protection flags for a mapped region.
    pub struct ProtFlags: c_int {
        const PROT_NONE = 0;
        const PROT_READ = 1;
        const PROT_WRITE = 2;
        const PROT_EXEC = 4;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    /// Mapping behaviour flags.
    pub struct MapFlags: c_int {
        const MAP_PRIVATE = 2;
        const MAP_FIXED = 16;
        const MAP_ANONYMOUS = 32;
    }
}

/// A uniform interface over the host's executable-memory allocator (§6 "Host
/// OS executable-memory allocator").
///
/// # Safety
/// All methods manipulate the process address space directly; callers must
/// keep `addr`/`len` consistent between `mmap`/`mprotect`/`munmap` calls.
pub trait Mmap {
    /// Allocates an anonymous region with the given initial protection.
    ///
    /// On platforms that require a JIT-memory flag at allocation time
    /// (Apple Silicon's `MAP_JIT`), implementations pass it here rather than
    /// at the later `mprotect` call.
    unsafe fn alloc_rwx(len: usize, prot: ProtFlags) -> Result<NonNull<u8>>;

    /// Changes the protection of a previously allocated region.
    unsafe fn protect(addr: NonNull<u8>, len: usize, prot: ProtFlags) -> Result<()>;

    /// Releases a region obtained from `alloc_rwx`.
    unsafe fn free(addr: NonNull<u8>, len: usize) -> Result<()>;

    /// Flushes the instruction cache for `[addr, addr+len)` after writing
    /// freshly generated code. A no-op on architectures with coherent I/D
    /// caches (x86-64); required on AArch64.
    unsafe fn flush_icache(addr: NonNull<u8>, len: usize);
}

/// Rounds `len` up to the next multiple of the host page size.
pub fn page_round_up(len: usize) -> usize {
    let page = page_size();
    (len + page - 1) & !(page - 1)
}

pub fn page_size() -> usize {
    cfg_if::cfg_if! {
        if #[cfg(windows)] {
            4096
        } else {
            // SAFETY: sysconf(_SC_PAGESIZE) has no preconditions.
            unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_round_up_is_idempotent() {
        let p = page_size();
        assert_eq!(page_round_up(1), p);
        assert_eq!(page_round_up(p), p);
        assert_eq!(page_round_up(p + 1), 2 * p);
    }
}
