//! Shared error type for the layer engine.

use camino::Utf8PathBuf;
use thiserror::Error;

/// The kind of identity a failed UID/GID mapping was attempting to resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdKind {
    Uid,
    Gid,
}

impl std::fmt::Display for IdKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IdKind::Uid => write!(f, "uid"),
            IdKind::Gid => write!(f, "gid"),
        }
    }
}

/// Errors surfaced by the layer engine (C1-C6). `XattrError` from the design
/// is deliberately absent here: it is a non-fatal class (`ENOTSUP`, rootless
/// `EPERM`) that callers downgrade to a log line rather than propagate.
#[derive(Debug, Error)]
pub enum Error {
    #[error("path `{path}` escapes the extraction root")]
    EscapesRoot { path: Utf8PathBuf },

    #[error("symlink loop resolving `{path}`")]
    SymlinkLoop { path: Utf8PathBuf },

    #[error("malicious archive entry `{path}`: {reason}")]
    MaliciousArchive {
        path: Utf8PathBuf,
        reason: &'static str,
    },

    #[error("unsupported tar typeflag {typeflag:#x} for `{path}`")]
    UnsupportedTypeflag { path: Utf8PathBuf, typeflag: u8 },

    #[error("short write for `{path}`: expected {expected} bytes, wrote {actual}")]
    ShortWrite {
        path: Utf8PathBuf,
        expected: u64,
        actual: u64,
    },

    #[error("{kind} {id} is not covered by any id mapping")]
    IdMapError { id: u32, kind: IdKind },

    #[error("i/o error on `{path}`")]
    Io {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    pub fn io(path: impl Into<Utf8PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
