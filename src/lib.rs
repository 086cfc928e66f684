//! Metadata cache for user-space network filesystem servers.
//!
//! This crate interposes between a protocol front-end (NFS, 9P, ...)
//! and a pluggable lower filesystem abstraction, the sub-FSAL. It
//! caches object handles, attributes and chunked directory listings so
//! repeated protocol operations avoid round-trips to the sub-FSAL,
//! with per-entry reader/writer locking, LRU eviction that respects
//! in-flight references, and export-aware invalidation.
//!
//! The cache is a library, not a service: implement [`SubFsal`] for
//! your storage backend, build a [`MetadataCache`] over it, and call
//! the handle operations with an explicit [`OpContext`].

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub use crate::attr::AccessMask;
pub use crate::attr::Acl;
pub use crate::attr::AttrMask;
pub use crate::attr::FileAttr;
pub use crate::attr::SetAttrs;
pub use crate::config::CacheConfig;
pub use crate::entry::CacheEntry;
pub use crate::entry::EntryFlags;
pub use crate::entry::EntryRef;
pub use crate::errors::CacheError;
pub use crate::errors::CacheResult;
pub use crate::export::Export;
pub use crate::export::ExportFlags;
pub use crate::export::ExportId;
pub use crate::fsal::FsalDirent;
pub use crate::fsal::FsalFeatures;
pub use crate::fsal::LockKind;
pub use crate::fsal::LockRequest;
pub use crate::fsal::OpenFlags;
pub use crate::fsal::ReaddirControl;
pub use crate::fsal::SubFsal;
pub use crate::fsal::Whence;
pub use crate::key::CacheKey;
pub use crate::lru::CacheStats;
pub use crate::op_context::Creds;
pub use crate::op_context::OpContext;
pub use crate::ops::MetadataCache;

mod attr;
mod chunk;
mod config;
mod dirent;
mod entry;
mod errors;
mod export;
mod fsal;
mod key;
mod lru;
mod op_context;
mod ops;
mod readdir;
mod table;

/// File types a cache entry can have.
///
/// The type is fixed at entry creation; a type change observed in the
/// sub-FSAL kills the cached entry.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum FileType {
    /// Named pipe (`S_IFIFO`)
    NamedPipe,
    /// Character device (`S_IFCHR`)
    CharDevice,
    /// Block device (`S_IFBLK`)
    BlockDevice,
    /// Directory (`S_IFDIR`)
    Directory,
    /// Regular file (`S_IFREG`)
    RegularFile,
    /// Symbolic link (`S_IFLNK`)
    Symlink,
    /// Unix domain socket (`S_IFSOCK`)
    Socket,
}
