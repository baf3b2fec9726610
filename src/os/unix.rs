//! Unix (Linux/macOS/BSD) memory mapping backend, grounded on the teacher's
//! `libc`-based `mmap`/`mprotect`/`munmap` wrappers.

use super::{Mmap, ProtFlags};
use crate::error::jit_alloc_error;
use crate::Result;
use std::ptr::NonNull;

pub struct HostMmap;

fn to_native_prot(prot: ProtFlags) -> i32 {
    let mut native = libc::PROT_NONE;
    if prot.contains(ProtFlags::PROT_READ) {
        native |= libc::PROT_READ;
    }
    if prot.contains(ProtFlags::PROT_WRITE) {
        native |= libc::PROT_WRITE;
    }
    if prot.contains(ProtFlags::PROT_EXEC) {
        native |= libc::PROT_EXEC;
    }
    native
}

#[cfg(target_os = "macos")]
fn jit_flag() -> i32 {
    // MAP_JIT is required on Apple Silicon to later toggle W^X with
    // pthread_jit_write_protect_np; harmless on Intel macOS.
    0x0800
}

#[cfg(not(target_os = "macos"))]
fn jit_flag() -> i32 {
    0
}

impl Mmap for HostMmap {
    unsafe fn alloc_rwx(len: usize, prot: ProtFlags) -> Result<NonNull<u8>> {
        let native_prot = to_native_prot(prot);
        let ptr = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                len,
                native_prot,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | jit_flag(),
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(jit_alloc_error(format!(
                "mmap({len} bytes) failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(NonNull::new(ptr.cast::<u8>()).expect("mmap returned null on success"))
    }

    unsafe fn protect(addr: NonNull<u8>, len: usize, prot: ProtFlags) -> Result<()> {
        let rc = unsafe { libc::mprotect(addr.as_ptr().cast(), len, to_native_prot(prot)) };
        if rc != 0 {
            return Err(jit_alloc_error(format!(
                "mprotect failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    unsafe fn free(addr: NonNull<u8>, len: usize) -> Result<()> {
        let rc = unsafe { libc::munmap(addr.as_ptr().cast(), len) };
        if rc != 0 {
            return Err(jit_alloc_error(format!(
                "munmap failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    unsafe fn flush_icache(addr: NonNull<u8>, len: usize) {
        #[cfg(target_arch = "aarch64")]
        unsafe {
            // `__builtin___clear_cache`-equivalent: there is no libc wrapper,
            // so emit the cache-maintenance instructions directly. Both
            // Linux and macOS aarch64 allow these from userspace.
            let start = addr.as_ptr() as usize;
            let end = start + len;
            let mut p = start & !63;
            while p < end {
                core::arch::asm!("dc cvau, {0}", in(reg) p);
                p += 64;
            }
            core::arch::asm!("dsb ish");
            p = start & !63;
            while p < end {
                core::arch::asm!("ic ivau, {0}", in(reg) p);
                p += 64;
            }
            core::arch::asm!("dsb ish");
            core::arch::asm!("isb");
        }
        #[cfg(not(target_arch = "aarch64"))]
        {
            let _ = (addr, len);
        }
    }
}
