//! Per-architecture PLT stub byte templates (§4.6 PLT contents).

/// Fixed stub size shared by both supported architectures (§3 invariant).
pub const STUB_SIZE: usize = 16;

cfg_if::cfg_if! {
    if #[cfg(target_arch = "aarch64")] {
        mod aarch64;
        pub use aarch64::plt_stub;
    } else {
        mod x86_64;
        pub use x86_64::plt_stub;
    }
}
