//! Error taxonomy for the JIT host.
//!
//! Mirrors the kinds enumerated in the specification's error-handling design:
//! each kind carries its own default severity (warning vs fatal), and every
//! warning is also emitted through the `log` facade so an embedding host can
//! observe diagnostics without scraping stdout.

use std::fmt::{self, Display};

/// Severity assigned to an [`Error`] by [`ErrorKind::default_severity`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Logged and swallowed; the caller may proceed.
    Warning,
    /// Surfaced to the caller as a hard failure.
    Fatal,
}

/// Kind of failure, independent of the message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Config,
    Io,
    Parse,
    IncludeNotFound,
    SymbolNotFound,
    DuplicateSymbol,
    RelocationLayout,
    JitAlloc,
    ImportNotFound,
    Resolve,
    Relocate,
}

impl ErrorKind {
    /// The policy table from the specification's error-handling design.
    pub fn default_severity(self) -> Severity {
        match self {
            ErrorKind::IncludeNotFound => Severity::Warning,
            ErrorKind::SymbolNotFound => Severity::Warning,
            ErrorKind::DuplicateSymbol => Severity::Warning,
            ErrorKind::Config
            | ErrorKind::Io
            | ErrorKind::Parse
            | ErrorKind::RelocationLayout
            | ErrorKind::JitAlloc
            | ErrorKind::ImportNotFound
            | ErrorKind::Resolve
            | ErrorKind::Relocate => Severity::Fatal,
        }
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Config => "ConfigError",
            ErrorKind::Io => "IOError",
            ErrorKind::Parse => "ParseError",
            ErrorKind::IncludeNotFound => "IncludeNotFound",
            ErrorKind::SymbolNotFound => "SymbolNotFound",
            ErrorKind::DuplicateSymbol => "DuplicateSymbol",
            ErrorKind::RelocationLayout => "RelocationLayoutError",
            ErrorKind::JitAlloc => "JITAllocError",
            ErrorKind::ImportNotFound => "ImportNotFound",
            ErrorKind::Resolve => "ResolveError",
            ErrorKind::Relocate => "RelocationError",
        };
        f.write_str(s)
    }
}

/// A structured diagnostic. Never panics its way out of the core; every
/// fallible operation returns one of these instead.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    message: String,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        let err = Error {
            kind,
            message: message.into(),
        };
        match err.kind.default_severity() {
            Severity::Warning => log::warn!("{}: {}", err.kind, err.message),
            Severity::Fatal => log::error!("{}: {}", err.kind, err.message),
        }
        err
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn severity(&self) -> Severity {
        self.kind.default_severity()
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    #[cold]
    fn from(value: std::io::Error) -> Self {
        Error::new(ErrorKind::Io, value.to_string())
    }
}

pub type Result<T> = core::result::Result<T, Error>;

#[cold]
#[inline(never)]
pub(crate) fn config_error(msg: impl Into<String>) -> Error {
    Error::new(ErrorKind::Config, msg)
}

#[cold]
#[inline(never)]
pub(crate) fn layout_error(msg: impl Into<String>) -> Error {
    Error::new(ErrorKind::RelocationLayout, msg)
}

#[cold]
#[inline(never)]
pub(crate) fn symbol_not_found(msg: impl Into<String>) -> Error {
    Error::new(ErrorKind::SymbolNotFound, msg)
}

#[cold]
#[inline(never)]
pub(crate) fn resolve_error(msg: impl Into<String>) -> Error {
    Error::new(ErrorKind::Resolve, msg)
}

#[cold]
#[inline(never)]
pub(crate) fn jit_alloc_error(msg: impl Into<String>) -> Error {
    Error::new(ErrorKind::JitAlloc, msg)
}

#[cold]
#[inline(never)]
pub(crate) fn import_not_found(msg: impl Into<String>) -> Error {
    Error::new(ErrorKind::ImportNotFound, msg)
}
