//! Windows memory mapping backend: `VirtualAlloc`/`VirtualProtect`/`VirtualFree`.

use super::{Mmap, ProtFlags};
use crate::error::jit_alloc_error;
use crate::Result;
use std::ptr::NonNull;
use windows_sys::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, VirtualProtect, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE,
    PAGE_EXECUTE_READ, PAGE_EXECUTE_READWRITE, PAGE_NOACCESS, PAGE_PROTECTION_FLAGS,
    PAGE_READONLY, PAGE_READWRITE,
};

pub struct HostMmap;

fn to_native_prot(prot: ProtFlags) -> PAGE_PROTECTION_FLAGS {
    match (
        prot.contains(ProtFlags::PROT_READ),
        prot.contains(ProtFlags::PROT_WRITE),
        prot.contains(ProtFlags::PROT_EXEC),
    ) {
        (_, true, true) => PAGE_EXECUTE_READWRITE,
        (_, false, true) => PAGE_EXECUTE_READ,
        (true, true, false) => PAGE_READWRITE,
        (true, false, false) => PAGE_READONLY,
        (false, false, false) => PAGE_NOACCESS,
        (false, true, false) => PAGE_READWRITE,
    }
}

impl Mmap for HostMmap {
    unsafe fn alloc_rwx(len: usize, prot: ProtFlags) -> Result<NonNull<u8>> {
        let ptr = unsafe {
            VirtualAlloc(
                core::ptr::null(),
                len,
                MEM_COMMIT | MEM_RESERVE,
                to_native_prot(prot),
            )
        };
        if ptr.is_null() {
            return Err(jit_alloc_error(format!(
                "VirtualAlloc({len} bytes) failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(NonNull::new(ptr.cast::<u8>()).expect("VirtualAlloc returned null on success"))
    }

    unsafe fn protect(addr: NonNull<u8>, len: usize, prot: ProtFlags) -> Result<()> {
        let mut old = 0u32;
        let ok = unsafe {
            VirtualProtect(
                addr.as_ptr().cast(),
                len,
                to_native_prot(prot),
                &mut old,
            )
        };
        if ok == 0 {
            return Err(jit_alloc_error(format!(
                "VirtualProtect failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    unsafe fn free(addr: NonNull<u8>, _len: usize) -> Result<()> {
        let ok = unsafe { VirtualFree(addr.as_ptr().cast(), 0, MEM_RELEASE) };
        if ok == 0 {
            return Err(jit_alloc_error(format!(
                "VirtualFree failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    unsafe fn flush_icache(addr: NonNull<u8>, len: usize) {
        unsafe {
            windows_sys::Win32::System::Diagnostics::Debug::FlushInstructionCache(
                windows_sys::Win32::System::Threading::GetCurrentProcess(),
                addr.as_ptr().cast(),
                len,
            );
        }
    }
}
