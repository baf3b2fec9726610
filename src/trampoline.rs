//! Trampoline mint (§4.5): generates small, immortal, executable stubs that
//! bridge one calling convention or argument-passing scheme to another.
//!
//! Two flavours are implemented:
//! - the x86-64 SysV→Win64 ABI bridge, used when SysV-compiled JIT code
//!   calls into a Windows-ABI host routine;
//! - the AArch64 variadic bridge, used when a fixed-arity host symbol
//!   (`v`-prefixed, e.g. `vsnprintf`) must be called as if it were the
//!   variadic symbol the JIT code references (e.g. `snprintf`).
//!
//! Stubs are allocated from a process-wide RWX arena (§5 "Trampoline pages
//! are owned by the process") and are never freed; lookups are memoized so
//! `wrap` is idempotent (§8).

use crate::os::{HostMmap, Mmap, ProtFlags};
use crate::Result;
use hashbrown::HashMap;
use std::ptr::NonNull;
use std::sync::Mutex;

const STUB_SIZE: usize = 64;

/// A single page-backed arena of fixed-size stub slots, grown on demand.
struct StubArena {
    regions: Vec<(NonNull<u8>, usize)>,
    cursor: usize,
    region_len: usize,
}

// SAFETY: the arena only ever hands out disjoint byte ranges within pages it
// owns exclusively; the pointers themselves are never read/written
// concurrently with allocation because all access goes through the mutex in
// `TrampolineMint`.
unsafe impl Send for StubArena {}

impl StubArena {
    fn new() -> Self {
        StubArena {
            regions: Vec::new(),
            cursor: 0,
            region_len: 0,
        }
    }

    fn alloc_stub(&mut self) -> Result<NonNull<u8>> {
        if self.regions.is_empty() || self.cursor + STUB_SIZE > self.region_len {
            let len = crate::os::page_round_up(STUB_SIZE * 64);
            // SAFETY: len is page-aligned and nonzero.
            let base = unsafe { HostMmap::alloc_rwx(len, ProtFlags::PROT_READ | ProtFlags::PROT_WRITE) }?;
            self.regions.push((base, len));
            self.region_len = len;
            self.cursor = 0;
        }
        let (base, _) = *self.regions.last().unwrap();
        // SAFETY: base + cursor is within the region just ensured above.
        let ptr = unsafe { NonNull::new_unchecked(base.as_ptr().add(self.cursor)) };
        self.cursor += STUB_SIZE;
        Ok(ptr)
    }
}

/// Writes `code` into a freshly allocated stub slot, flips it to R-X, and
/// flushes the instruction cache — the allocate-rw → write → flip-to-rx →
/// flush sequence required on platforms without a JIT allocation flag (§6).
fn install_stub(arena: &mut StubArena, code: &[u8]) -> Result<usize> {
    debug_assert!(code.len() <= STUB_SIZE);
    let ptr = arena.alloc_stub()?;
    // SAFETY: ptr is writable (PROT_WRITE was requested at allocation) and
    // `code.len() <= STUB_SIZE`, which is within the slot.
    unsafe {
        std::ptr::copy_nonoverlapping(code.as_ptr(), ptr.as_ptr(), code.len());
        HostMmap::protect(ptr, STUB_SIZE, ProtFlags::PROT_READ | ProtFlags::PROT_EXEC)?;
        HostMmap::flush_icache(ptr, STUB_SIZE);
    }
    Ok(ptr.as_ptr() as usize)
}

/// Process-wide table of memoized trampolines, keyed by the original target
/// address. Immortal: entries are never removed (§3 "Trampoline entry").
pub struct TrampolineMint {
    arena: Mutex<StubArena>,
    table: Mutex<HashMap<usize, usize>>,
}

impl TrampolineMint {
    pub fn new() -> Self {
        TrampolineMint {
            arena: Mutex::new(StubArena::new()),
            table: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `address` unchanged if it is already a stub this mint issued
    /// (idempotence, §8: `wrap(wrap(addr)) == wrap(addr)`).
    fn already_a_stub(&self, address: usize) -> bool {
        self.table
            .lock()
            .unwrap()
            .values()
            .any(|&stub| stub == address)
    }

    fn memoized(&self, address: usize) -> Option<usize> {
        self.table.lock().unwrap().get(&address).copied()
    }

    fn memoize(&self, original: usize, stub: usize) {
        self.table.lock().unwrap().insert(original, stub);
    }

    /// Wraps `target` as a SysV→Win64 ABI bridge (x86-64 only). Returns the
    /// stub address; memoized per original target.
    #[cfg(target_arch = "x86_64")]
    pub fn wrap_sysv_to_win64(&self, target: usize) -> Result<usize> {
        if self.already_a_stub(target) {
            return Ok(target);
        }
        if let Some(stub) = self.memoized(target) {
            return Ok(stub);
        }
        let marshaller = self.marshaller_addr()?;
        let code = x86_64::sysv_to_win64_stub(target, marshaller);
        let stub = install_stub(&mut self.arena.lock().unwrap(), &code)?;
        self.memoize(target, stub);
        Ok(stub)
    }

    #[cfg(target_arch = "x86_64")]
    fn marshaller_addr(&self) -> Result<usize> {
        Ok(x86_64::sysv_to_win64_marshaller as usize)
    }

    /// Wraps `target`, a `v`-prefixed fixed-arity variant of a variadic
    /// function, as an AArch64 variadic bridge with `fixed_arity` leading
    /// non-variadic integer arguments (1, 2, or 3 per §4.5).
    #[cfg(target_arch = "aarch64")]
    pub fn wrap_variadic(&self, target: usize, fixed_arity: u8) -> Result<usize> {
        if self.already_a_stub(target) {
            return Ok(target);
        }
        if let Some(stub) = self.memoized(target) {
            return Ok(stub);
        }
        let code = aarch64::variadic_bridge_stub(target, fixed_arity);
        let stub = install_stub(&mut self.arena.lock().unwrap(), &code)?;
        self.memoize(target, stub);
        Ok(stub)
    }
}

impl Default for TrampolineMint {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_arch = "x86_64")]
mod x86_64 {
    /// Dynamically marshals SysV argument registers (`rdi, rsi, rdx, rcx,
    /// r8, r9`) into the Win64 convention (`rcx, rdx, r8, r9` plus 32 bytes
    /// of caller-allocated shadow space) and calls the address left in
    /// `rax` by the per-target stub.
    ///
    /// # Safety
    /// Only reachable by jumping from a stub generated by
    /// [`sysv_to_win64_stub`], which sets up `rax`/`r10` per this function's
    /// contract.
    #[unsafe(naked)]
    pub(super) unsafe extern "C" fn sysv_to_win64_marshaller() {
        core::arch::naked_asm!(
            "
            mov r10, rdx
            mov r11, rcx
            mov rcx, rdi
            mov rdx, rsi
            mov r8, r10
            mov r9, r11
            sub rsp, 32
            call rax
            add rsp, 32
            ret
            "
        )
    }

    /// Builds the per-target stub: `push rbp; mov rbp, rsp; movabs rax,
    /// <target>; movabs r10, <marshaller>; jmp r10` (§4.5).
    pub(super) fn sysv_to_win64_stub(target: usize, marshaller: usize) -> Vec<u8> {
        let mut code = Vec::with_capacity(32);
        code.extend_from_slice(&[0x55]); // push rbp
        code.extend_from_slice(&[0x48, 0x89, 0xe5]); // mov rbp, rsp
        code.extend_from_slice(&[0x48, 0xb8]); // movabs rax, imm64
        code.extend_from_slice(&(target as u64).to_le_bytes());
        code.extend_from_slice(&[0x49, 0xba]); // movabs r10, imm64
        code.extend_from_slice(&(marshaller as u64).to_le_bytes());
        code.extend_from_slice(&[0x41, 0xff, 0xe2]); // jmp r10
        code
    }
}

#[cfg(target_arch = "aarch64")]
mod aarch64 {
    /// Encodes `str xT, [sp, #imm]` (unsigned offset, scaled by 8).
    fn str_sp_imm(t: u32, imm: u32) -> u32 {
        0xF900_0000 | ((imm & 0xFFF) << 10) | (31 << 5) | t
    }

    /// Encodes `add xD, sp, #imm` (12-bit unsigned immediate).
    fn add_sp_imm(d: u32, imm: u32) -> u32 {
        0x9100_0000 | ((imm & 0xFFF) << 10) | (31 << 5) | d
    }

    /// Encodes `movz xD, #imm16, lsl #shift` (shift in {0,16,32,48}).
    fn movz(d: u32, imm16: u16, shift: u32) -> u32 {
        0xD280_0000 | ((shift / 16) << 21) | ((imm16 as u32) << 5) | d
    }

    /// Encodes `movk xD, #imm16, lsl #shift`.
    fn movk(d: u32, imm16: u16, shift: u32) -> u32 {
        0xF280_0000 | ((shift / 16) << 21) | ((imm16 as u32) << 5) | d
    }

    /// Encodes `br xN`.
    fn br(n: u32) -> u32 {
        0xD61F_0000 | (n << 5)
    }

    /// Builds the variadic bridge template: spills the integer argument
    /// registers starting at `fixed_arity` onto a reserved stack slab so a
    /// `va_list` can address them, materializes it in `x8` (a
    /// caller-saved scratch register, conventionally unused for argument
    /// passing past the eight GPR slots), loads the real target address
    /// into `x16` via a `movz`/`movk` sequence, and branches to it (§4.5).
    ///
    /// Unused spill instructions for argument registers before
    /// `fixed_arity` are omitted, matching "the template is patched at
    /// generation time by disabling unused spill instructions."
    pub(super) fn variadic_bridge_stub(target: usize, fixed_arity: u8) -> Vec<u8> {
        const VARARG_SLAB: u32 = 8 * 8; // room for x0..x7 worst case
        let mut words = Vec::with_capacity(19);

        // Reserve the spill slab.
        words.push(0xD100_0000 | (VARARG_SLAB << 10) | (31 << 5) | 31); // sub sp, sp, #VARARG_SLAB

        // Spill argument registers from `fixed_arity` through x7.
        for reg in fixed_arity..8 {
            let offset = (reg - fixed_arity) as u32;
            words.push(str_sp_imm(reg as u32, offset));
        }

        // x8 = &slab (the va_list base for this bridge's callee contract).
        words.push(add_sp_imm(8, 0));

        // x16 = target (movz/movk four-instruction 64-bit load).
        let t = target as u64;
        words.push(movz(16, (t & 0xFFFF) as u16, 0));
        words.push(movk(16, ((t >> 16) & 0xFFFF) as u16, 16));
        words.push(movk(16, ((t >> 32) & 0xFFFF) as u16, 32));
        words.push(movk(16, ((t >> 48) & 0xFFFF) as u16, 48));

        words.push(br(16));

        let mut bytes = Vec::with_capacity(words.len() * 4);
        for w in words {
            bytes.extend_from_slice(&w.to_le_bytes());
        }
        bytes
    }
}

/// Resolves `name` through the host's preferred libc/libm handles, and on
/// AArch64, if `variadic_fixed_arity` is `Some`, additionally looks up the
/// `v`-prefixed variant and wraps it through a variadic trampoline (§4.5
/// last paragraph).
pub fn resolve(
    mint: &TrampolineMint,
    libc: &crate::dynload::HostLibrary,
    name: &str,
    variadic_fixed_arity: Option<u8>,
) -> Option<usize> {
    #[cfg(target_arch = "aarch64")]
    if let Some(arity) = variadic_fixed_arity {
        let v_name = format!("v{name}");
        if let Some(addr) = libc.lookup(&v_name) {
            return mint.wrap_variadic(addr as usize, arity).ok();
        }
    }
    #[cfg(not(target_arch = "aarch64"))]
    let _ = variadic_fixed_arity;
    libc.lookup(name).map(|p| p as usize)
}

/// Wraps `addr` through the SysV→Win64 bridge when the host OS is Windows
/// (x86-64 only — that's the only cross-ABI boundary this system needs to
/// bridge on that architecture, §4.5). A no-op everywhere else.
#[cfg(target_arch = "x86_64")]
pub fn maybe_wrap_cross_abi(mint: &TrampolineMint, addr: usize, os: crate::platform::Os) -> Result<usize> {
    if os == crate::platform::Os::Windows {
        mint.wrap_sysv_to_win64(addr)
    } else {
        Ok(addr)
    }
}

#[cfg(not(target_arch = "x86_64"))]
pub fn maybe_wrap_cross_abi(_mint: &TrampolineMint, addr: usize, _os: crate::platform::Os) -> Result<usize> {
    Ok(addr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_size_is_below_slot_budget() {
        #[cfg(target_arch = "x86_64")]
        {
            let code = x86_64::sysv_to_win64_stub(0x1234_5678_9abc, 0xdead_beef_0000);
            assert!(code.len() <= STUB_SIZE);
            assert_eq!(code.len() % 1, 0);
        }
        #[cfg(target_arch = "aarch64")]
        {
            let code = aarch64::variadic_bridge_stub(0x1234_5678_9abc, 2);
            assert!(code.len() <= STUB_SIZE);
            assert_eq!(code.len() % 4, 0, "aarch64 stub must be word-aligned in length");
        }
    }

    #[test]
    fn wrap_is_idempotent() {
        let mint = TrampolineMint::new();
        #[cfg(target_arch = "x86_64")]
        {
            let target = 0x1000;
            let first = mint.wrap_sysv_to_win64(target).unwrap();
            let second = mint.wrap_sysv_to_win64(first).unwrap();
            assert_eq!(first, second);
        }
        #[cfg(target_arch = "aarch64")]
        {
            let target = 0x1000;
            let first = mint.wrap_variadic(target, 2).unwrap();
            let second = mint.wrap_variadic(first, 2).unwrap();
            assert_eq!(first, second);
        }
    }

    #[test]
    fn distinct_targets_get_distinct_stubs() {
        #[cfg(target_arch = "x86_64")]
        {
            let mint = TrampolineMint::new();
            let a = mint.wrap_sysv_to_win64(0x1000).unwrap();
            let b = mint.wrap_sysv_to_win64(0x2000).unwrap();
            assert_ne!(a, b);
        }
    }
}
