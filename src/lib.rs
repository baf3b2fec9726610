//! A cross-platform, single-binary C JIT host and dynamic module loader.
//!
//! This crate owns the four subsystems that make in-process C compilation
//! practical on any of Linux, macOS, and Windows across x86-64 and AArch64:
//!
//! - [`symtab`] / [`dynload`]: layered symbol resolution over a builtin
//!   table, pre-opened host libraries, and the sources already queued in a
//!   compiler instance.
//! - [`relocation`]: detects PC-relative relocations that fall outside
//!   ±2 GiB and synthesizes a GOT/PLT pair reachable from the code section.
//! - [`trampoline`]: cross-ABI call stubs (SysV→Win64 on x86-64, variadic
//!   bridging on AArch64).
//! - [`cache`]: a compile-once, architecture-tagged object cache behind a
//!   small `import`/`sym`/`free` API.
//!
//! The actual C parser and code generator are an external collaborator —
//! see [`frontend::Frontend`] for the contract this crate drives.

pub mod cache;
pub mod driver;
pub mod dynload;
pub mod error;
pub mod frontend;
pub mod object;
pub mod os;
pub mod platform;
pub mod relocation;
pub mod symtab;
pub mod trampoline;

pub use error::{Error, ErrorKind, Result, Severity};

pub use cache::{import, HandleState, ModuleHandle};
pub use driver::{CompilerInstance, Options};
pub use frontend::{Frontend, OutputMode, TestFrontend};
