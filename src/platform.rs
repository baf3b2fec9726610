//! Platform probe (§4.1).
//!
//! Detects the host OS and CPU once, caches the result behind a
//! [`std::sync::OnceLock`], and publishes it as the process-wide immutable
//! value the rest of the crate consults for path separators, library search
//! order, and default preprocessor macros.

use std::sync::OnceLock;

/// Host operating system, as distinguished by the loader/trampoline layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Os {
    Linux,
    MacOs,
    Windows,
    OtherBsd,
}

/// Host CPU architecture. The resolver/trampoline layers only implement
/// x86-64 and AArch64; other arches are detected but unsupported past the
/// probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cpu {
    X86_64,
    Aarch64,
    Other,
}

/// Immutable, process-wide platform facts.
#[derive(Debug, Clone, Copy)]
pub struct Platform {
    pub os: Os,
    pub cpu: Cpu,
}

impl Platform {
    /// Default dynamic-library filename prefix, e.g. `"lib"` on Unix, `""` on
    /// Windows.
    pub fn dylib_prefix(&self) -> &'static str {
        match self.os {
            Os::Windows => "",
            _ => "lib",
        }
    }

    /// Extensions tried in order when the literal path fails to open, per
    /// §4.2's "multi-extension filename retry."
    pub fn dylib_extensions(&self) -> &'static [&'static str] {
        match self.os {
            Os::Linux | Os::OtherBsd => &[".so"],
            Os::MacOs => &[".dylib", ".so"],
            Os::Windows => &[".dll"],
        }
    }

    /// Separator used to split `PATH`-like environment variables.
    pub fn path_separator(&self) -> char {
        match self.os {
            Os::Windows => ';',
            _ => ':',
        }
    }

    /// Preprocessor macros injected into every compile by the default
    /// options (§4.4), beyond `-D__COSMORUN__`.
    pub fn default_macros(&self) -> &'static [(&'static str, &'static str)] {
        match self.os {
            Os::Linux => &[("__linux__", "1"), ("__unix__", "1")],
            Os::MacOs => &[("__APPLE__", "1"), ("__unix__", "1")],
            Os::Windows => &[("_WIN32", "1")],
            Os::OtherBsd => &[("__unix__", "1"), ("BSD", "1")],
        }
    }

    /// Default system include/library search directories, best-effort: these
    /// are the conventional locations the frontend would otherwise need to be
    /// told about via `-I`/`-L`.
    pub fn default_include_dirs(&self) -> &'static [&'static str] {
        match self.os {
            Os::Windows => &[],
            _ => &["/usr/include", "/usr/local/include"],
        }
    }

    pub fn default_library_dirs(&self) -> &'static [&'static str] {
        match self.os {
            Os::Windows => &[],
            Os::MacOs => &["/usr/lib", "/usr/local/lib"],
            _ => &["/usr/lib", "/usr/lib64", "/usr/local/lib"],
        }
    }
}

fn detect_os() -> Os {
    cfg_if::cfg_if! {
        if #[cfg(target_os = "linux")] {
            Os::Linux
        } else if #[cfg(target_os = "macos")] {
            Os::MacOs
        } else if #[cfg(target_os = "windows")] {
            Os::Windows
        } else {
            Os::OtherBsd
        }
    }
}

fn detect_cpu() -> Cpu {
    cfg_if::cfg_if! {
        if #[cfg(target_arch = "x86_64")] {
            Cpu::X86_64
        } else if #[cfg(target_arch = "aarch64")] {
            Cpu::Aarch64
        } else {
            Cpu::Other
        }
    }
}

static PLATFORM: OnceLock<Platform> = OnceLock::new();

/// Returns the cached platform probe result, initializing it on first call.
/// Matches the "init is idempotent; reads need no synchronization afterward"
/// rule from §5.
pub fn probe() -> Platform {
    *PLATFORM.get_or_init(|| Platform {
        os: detect_os(),
        cpu: detect_cpu(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_is_idempotent() {
        let a = probe();
        let b = probe();
        assert_eq!(a.os, b.os);
        assert_eq!(a.cpu, b.cpu);
    }

    #[test]
    fn known_os_has_nonempty_prefix_table() {
        let p = probe();
        assert!(!p.dylib_extensions().is_empty());
    }
}
