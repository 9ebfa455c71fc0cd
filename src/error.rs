use alloc::borrow::Cow;
use alloc::string::ToString;
use core::fmt::{Debug, Display};

/// Error types used throughout the `elf_rtld` library.
///
/// These cover every failure the engine can report, from the initial image
/// mapping to runtime `dl_open`/`dl_sym` requests.
#[derive(Debug)]
pub enum Error {
    /// The requested file does not exist on any search path.
    NotFound { msg: Cow<'static, str> },
    /// An error occurred while opening or reading an ELF file.
    Io { msg: Cow<'static, str> },
    /// The ELF header or program headers are not structured the way the
    /// engine requires.
    Malformed { msg: Cow<'static, str> },
    /// The file is a valid ELF object but of a kind the engine does not
    /// load (wrong machine, wrong class, wrong e_type).
    Unsupported { msg: Cow<'static, str> },
    /// A memory mapping operation failed.
    MappingFailed { msg: Cow<'static, str> },
    /// A DT_NEEDED entry could not be resolved to a file.
    DependencyMissing { msg: Cow<'static, str> },
    /// A symbol lookup found no definition.
    SymbolNotFound { msg: Cow<'static, str> },
    /// A symbol was found but its version information did not satisfy the
    /// request.
    VersionMismatch { msg: Cow<'static, str> },
    /// A scope produced two or more equally acceptable versioned
    /// definitions for one name; binding to either would be arbitrary.
    ScopeAmbiguous { msg: Cow<'static, str> },
    /// An object with a static TLS block was opened after startup, when the
    /// static TLS area can no longer grow.
    StaticTlsAfterStartup { msg: Cow<'static, str> },
    /// The architecture backend does not know the relocation type.
    UnsupportedReloc { msg: Cow<'static, str> },
}

impl Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::NotFound { msg } => write!(f, "file not found: {msg}"),
            Error::Io { msg } => write!(f, "io error: {msg}"),
            Error::Malformed { msg } => write!(f, "malformed elf: {msg}"),
            Error::Unsupported { msg } => write!(f, "unsupported elf: {msg}"),
            Error::MappingFailed { msg } => write!(f, "mapping failed: {msg}"),
            Error::DependencyMissing { msg } => write!(f, "missing dependency: {msg}"),
            Error::SymbolNotFound { msg } => write!(f, "symbol not found: {msg}"),
            Error::VersionMismatch { msg } => write!(f, "version mismatch: {msg}"),
            Error::ScopeAmbiguous { msg } => {
                write!(f, "ambiguous symbol resolution: {msg}")
            }
            Error::StaticTlsAfterStartup { msg } => {
                write!(f, "static tls block after startup: {msg}")
            }
            Error::UnsupportedReloc { msg } => write!(f, "unsupported relocation: {msg}"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

#[cold]
#[inline(never)]
pub(crate) fn not_found_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::NotFound { msg: msg.into() }
}

#[cold]
#[inline(never)]
pub(crate) fn io_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::Io { msg: msg.into() }
}

#[cold]
#[inline(never)]
pub(crate) fn malformed_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::Malformed { msg: msg.into() }
}

#[cold]
#[inline(never)]
pub(crate) fn unsupported_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::Unsupported { msg: msg.into() }
}

#[cold]
#[inline(never)]
pub(crate) fn map_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::MappingFailed { msg: msg.into() }
}

#[cold]
#[inline(never)]
pub(crate) fn dependency_error(msg: impl ToString) -> Error {
    Error::DependencyMissing {
        msg: Cow::Owned(msg.to_string()),
    }
}

#[cold]
#[inline(never)]
pub(crate) fn find_symbol_error(msg: impl ToString) -> Error {
    Error::SymbolNotFound {
        msg: Cow::Owned(msg.to_string()),
    }
}

#[cold]
#[inline(never)]
pub(crate) fn scope_ambiguous_error(msg: impl ToString) -> Error {
    Error::ScopeAmbiguous {
        msg: Cow::Owned(msg.to_string()),
    }
}

#[cold]
#[inline(never)]
pub(crate) fn static_tls_error(msg: impl ToString) -> Error {
    Error::StaticTlsAfterStartup {
        msg: Cow::Owned(msg.to_string()),
    }
}

#[cold]
#[inline(never)]
pub(crate) fn reloc_error(msg: impl ToString) -> Error {
    Error::UnsupportedReloc {
        msg: Cow::Owned(msg.to_string()),
    }
}

pub type Result<T> = core::result::Result<T, Error>;
