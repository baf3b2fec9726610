//! Host dynamic loader (§4.2): a uniform `open`/`lookup`/`close`/`last_error`
//! interface over the host OS's native dynamic linker, with the filename
//! retry policy (`lib` prefix, extension permutations) described in the
//! specification.

use crate::error::resolve_error;
use crate::platform::probe;
use crate::Result;
use std::ffi::{CString, OsStr};

/// Bitflags mirroring `dlopen`'s `RTLD_*` constants. `0` (`Self::DEFAULT`)
/// means "pick smart defaults" per §4.2: lazy binding everywhere, global
/// visibility where the OS supports it (never on Windows).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenFlags(pub i32);

impl OpenFlags {
    pub const DEFAULT: OpenFlags = OpenFlags(0);
}

/// Opaque handle to a host shared library.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LibHandle(usize);

/// A single pre-opened host library, tracked in registration order for
/// layer-2 symbol resolution (§4.3).
pub struct HostLibrary {
    pub name: String,
    handle: LibHandle,
}

impl HostLibrary {
    pub fn lookup(&self, name: &str) -> Option<*const ()> {
        lookup(self.handle, name)
    }
}

impl Drop for HostLibrary {
    fn drop(&mut self) {
        // Host-library handles are owned by the process and never closed
        // early (§5 "Shared-resource policy"); this only runs at process
        // teardown when the static table itself is dropped, which in
        // practice never happens since it lives in a `OnceLock`.
        let _ = close(self.handle);
    }
}

#[cfg(unix)]
mod imp {
    use super::*;
    use std::os::unix::ffi::OsStrExt;

    pub fn open(path: &OsStr, flags: OpenFlags) -> Option<LibHandle> {
        let c_path = CString::new(path.as_bytes()).ok()?;
        let native_flags = if flags.0 == 0 {
            libc::RTLD_LAZY | libc::RTLD_GLOBAL
        } else {
            flags.0
        };
        // SAFETY: c_path is NUL-terminated and valid for the call's duration.
        let handle = unsafe { libc::dlopen(c_path.as_ptr(), native_flags) };
        if handle.is_null() {
            None
        } else {
            Some(LibHandle(handle as usize))
        }
    }

    pub fn lookup(handle: LibHandle, name: &str) -> Option<*const ()> {
        let c_name = CString::new(name).ok()?;
        // SAFETY: handle came from a successful `dlopen`; c_name is valid.
        let addr = unsafe { libc::dlsym(handle.0 as *mut _, c_name.as_ptr()) };
        if addr.is_null() {
            None
        } else {
            Some(addr as *const ())
        }
    }

    pub fn close(handle: LibHandle) -> Result<()> {
        // SAFETY: handle came from a successful `dlopen`.
        let rc = unsafe { libc::dlclose(handle.0 as *mut _) };
        if rc == 0 {
            Ok(())
        } else {
            Err(resolve_error(last_error()))
        }
    }

    pub fn last_error() -> String {
        // SAFETY: dlerror has no preconditions; it may return null.
        let ptr = unsafe { libc::dlerror() };
        if ptr.is_null() {
            "no error".to_string()
        } else {
            // SAFETY: dlerror returns a NUL-terminated string valid until
            // the next dl* call on this thread.
            unsafe { std::ffi::CStr::from_ptr(ptr) }
                .to_string_lossy()
                .into_owned()
        }
    }
}

#[cfg(windows)]
mod imp {
    use super::*;
    use std::os::windows::ffi::OsStrExt;
    use windows_sys::Win32::Foundation::GetLastError;
    use windows_sys::Win32::System::LibraryLoader::{
        FreeLibrary, GetProcAddress, LoadLibraryExW, LOAD_LIBRARY_SEARCH_DEFAULT_DIRS,
    };

    pub fn open(path: &OsStr, _flags: OpenFlags) -> Option<LibHandle> {
        let mut wide: Vec<u16> = path.encode_wide().collect();
        wide.push(0);
        // SAFETY: wide is a valid NUL-terminated UTF-16 string.
        let handle = unsafe {
            LoadLibraryExW(wide.as_ptr(), std::ptr::null_mut(), LOAD_LIBRARY_SEARCH_DEFAULT_DIRS)
        };
        if handle.is_null() {
            None
        } else {
            Some(LibHandle(handle as usize))
        }
    }

    pub fn lookup(handle: LibHandle, name: &str) -> Option<*const ()> {
        let c_name = CString::new(name).ok()?;
        // SAFETY: handle came from a successful LoadLibraryExW.
        let addr = unsafe { GetProcAddress(handle.0 as _, c_name.as_ptr() as *const u8) };
        addr.map(|f| f as *const ())
    }

    pub fn close(handle: LibHandle) -> Result<()> {
        // SAFETY: handle came from a successful LoadLibraryExW.
        let ok = unsafe { FreeLibrary(handle.0 as _) };
        if ok != 0 {
            Ok(())
        } else {
            Err(resolve_error(last_error()))
        }
    }

    pub fn last_error() -> String {
        // SAFETY: GetLastError has no preconditions.
        format!("win32 error {}", unsafe { GetLastError() })
    }
}

/// Opens a shared library, retrying with host-appropriate `lib` prefix and
/// extension permutations if the literal path fails (§4.2).
pub fn open(path: &str, flags: OpenFlags) -> Result<LibHandle> {
    if let Some(h) = imp::open(OsStr::new(path), flags) {
        return Ok(h);
    }
    let platform = probe();
    let (dir, stem) = match path.rfind(['/', '\\']) {
        Some(idx) => (&path[..=idx], &path[idx + 1..]),
        None => ("", path),
    };
    for ext in platform.dylib_extensions() {
        let candidate = format!("{dir}{}{stem}{ext}", platform.dylib_prefix());
        if let Some(h) = imp::open(OsStr::new(&candidate), flags) {
            return Ok(h);
        }
        // Also try without the prefix, in case `stem` already has one.
        let candidate_noprefix = format!("{dir}{stem}{ext}");
        if let Some(h) = imp::open(OsStr::new(&candidate_noprefix), flags) {
            return Ok(h);
        }
    }
    Err(resolve_error(format!(
        "could not open host library '{path}': {}",
        imp::last_error()
    )))
}

pub fn lookup(handle: LibHandle, name: &str) -> Option<*const ()> {
    imp::lookup(handle, name)
}

pub fn close(handle: LibHandle) -> Result<()> {
    imp::close(handle)
}

pub fn last_error() -> String {
    imp::last_error()
}

/// Opens `path` and wraps the handle for registration in the layered
/// resolution table (§4.3 layer 2).
pub fn open_host_library(path: &str) -> Result<HostLibrary> {
    let handle = open(path, OpenFlags::DEFAULT)?;
    Ok(HostLibrary {
        name: path.to_string(),
        handle,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opening_a_nonexistent_library_fails_with_message() {
        let err = open("definitely-not-a-real-library-xyz", OpenFlags::DEFAULT).unwrap_err();
        assert!(!err.to_string().is_empty());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn opening_libm_by_bare_name_succeeds_via_retry() {
        // "m" alone is not openable; the retry logic should try "libm.so",
        // which (unlike libc.so) is reliably present as a real shared
        // object, not just a linker script, on glibc and musl alike.
        let result = open("m", OpenFlags::DEFAULT);
        assert!(result.is_ok(), "expected libm to resolve via retry: {result:?}");
    }
}
