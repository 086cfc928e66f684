//! Error type shared by the cache and the sub-FSAL contract.
//!
//! Sub-FSAL implementations return these errors directly; the cache
//! propagates them unchanged and adds its own kinds for cache-level
//! conditions (overflow, bad cookies, unexport races).

use thiserror::Error;

/// Result alias used throughout the crate.
pub type CacheResult<T> = Result<T, CacheError>;

/// Errors observed and propagated by the metadata cache.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// The object no longer resolves in the sub-FSAL, the current export
    /// is being removed, or a parent entry has been invalidated.
    #[error("stale object handle")]
    Stale,

    /// Name not found under a fully populated, trusted directory.
    #[error("no such entry")]
    NoEnt,

    /// Name collision on dirent insert. Some callers treat this as
    /// success, e.g. when a parallel populator already added the dirent.
    #[error("entry already exists")]
    Exist,

    /// Directory removal target still has entries.
    #[error("directory not empty")]
    NotEmpty,

    /// The directory exceeded the configured dirent ceiling; the caller
    /// enables bypass mode and retries without caching.
    #[error("directory dirent limit exceeded")]
    Overflow,

    /// Entry or dirent allocation failed.
    #[error("allocation failed")]
    NoMem,

    /// Programming error, such as a wrong object type or an empty key.
    #[error("invalid argument: {0}")]
    Inval(&'static str),

    /// Junction crossing reported by the protocol layer.
    #[error("crossed a filesystem boundary")]
    XDev,

    /// Readdir called with a cookie that is reserved or not locatable.
    #[error("bad readdir cookie {0}")]
    BadCookie(u64),

    /// Incomplete readdir that should be retried by the caller.
    #[error("operation should be retried")]
    Delay,

    /// The operation is not supported by the sub-FSAL.
    #[error("operation not supported")]
    NotSupp,

    /// An impossible state was reached.
    #[error("server fault: {0}")]
    ServerFault(&'static str),

    /// Transport or storage failure in the sub-FSAL, as a raw errno.
    #[error("I/O error (errno {0})")]
    Io(i32),
}

impl CacheError {
    /// Raw OS errno for this error, for protocol layers that speak errno.
    pub fn errno(&self) -> i32 {
        match self {
            CacheError::Stale => libc::ESTALE,
            CacheError::NoEnt => libc::ENOENT,
            CacheError::Exist => libc::EEXIST,
            CacheError::NotEmpty => libc::ENOTEMPTY,
            CacheError::Overflow => libc::EOVERFLOW,
            CacheError::NoMem => libc::ENOMEM,
            CacheError::Inval(_) => libc::EINVAL,
            CacheError::XDev => libc::EXDEV,
            CacheError::BadCookie(_) => libc::EBADF,
            CacheError::Delay => libc::EAGAIN,
            CacheError::NotSupp => libc::ENOTSUP,
            CacheError::ServerFault(_) => libc::EIO,
            CacheError::Io(errno) => *errno,
        }
    }

    /// True for the error kinds that lookup paths recover from by
    /// promoting to an uncached lookup.
    pub fn is_stale(&self) -> bool {
        matches!(self, CacheError::Stale)
    }
}
