//! The sub-FSAL contract.
//!
//! The metadata cache stacks on top of a lower filesystem abstraction that
//! performs the actual storage I/O. This module defines that abstraction as
//! the [`SubFsal`] trait, mirroring the shape of a low-level filesystem
//! interface: a set of synchronous operations on opaque object handles,
//! plus feature flags describing optional capabilities.
//!
//! Most operations have default bodies that return
//! [`CacheError::NotSupp`], so minimal sub-FSALs only implement what they
//! support.

use bitflags::bitflags;

use crate::attr::{AttrMask, FileAttr, SetAttrs};
use crate::errors::{CacheError, CacheResult};
use crate::op_context::OpContext;
use crate::FileType;

bitflags! {
    /// Optional capabilities a sub-FSAL may advertise.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FsalFeatures: u32 {
        /// `compute_readdir_cookie` returns real cookies; the cache keeps
        /// a sorted-by-cookie index and can place new dirents into chunks.
        const COMPUTE_READDIR_COOKIE = 1 << 0;
        /// `readdir` continuation expects the last seen name rather than
        /// an opaque cookie.
        const WHENCE_IS_NAME = 1 << 1;
        /// Renaming an object changes its key; cached handles for the
        /// renamed object become useless.
        const RENAME_CHANGES_KEY = 1 << 2;
    }
}

bitflags! {
    /// Open mode bits for the pass-through open operation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        /// Open for reading.
        const READ = 1 << 0;
        /// Open for writing.
        const WRITE = 1 << 1;
        /// Truncate on open.
        const TRUNCATE = 1 << 2;
    }
}

/// Where a readdir enumeration starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence<'a> {
    /// Start of the directory.
    Start,
    /// Continue after the dirent with this cookie.
    Cookie(u64),
    /// Continue after the dirent with this name, for sub-FSALs that
    /// advertise [`FsalFeatures::WHENCE_IS_NAME`].
    Name(&'a str),
}

/// Continue-or-stop decision returned by readdir callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaddirControl {
    /// Keep enumerating.
    Continue,
    /// Stop the enumeration early.
    Stop,
}

/// One directory entry produced by a sub-FSAL readdir.
#[derive(Debug)]
pub struct FsalDirent<H> {
    /// Entry name within the directory.
    pub name: String,
    /// Handle for the child object.
    pub handle: H,
    /// Attributes the sub-FSAL fetched alongside the entry.
    pub attrs: FileAttr,
    /// Position marker for resuming after this entry.
    pub cookie: u64,
}

/// Kind of byte-range lock operation to pass through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    /// Shared lock.
    Read,
    /// Exclusive lock.
    Write,
    /// Release a previously taken lock.
    Unlock,
}

/// A byte-range lock request forwarded to the sub-FSAL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockRequest {
    /// Requested operation.
    pub kind: LockKind,
    /// Start of the range.
    pub offset: u64,
    /// Length of the range; 0 means to end of file.
    pub length: u64,
    /// Opaque lock owner token from the protocol layer.
    pub owner: u64,
}

/// The lower filesystem abstraction the cache sits atop.
///
/// Handle release is the `Handle` type's `Drop` implementation; the cache
/// drops handles when entries are freed or lose a creation race.
#[allow(unused_variables)]
pub trait SubFsal: Send + Sync + 'static {
    /// Opaque reference to a filesystem object.
    type Handle: Send + Sync + 'static;
    /// Opaque open-state token. The cache stores it per entry but never
    /// interprets it.
    type State: Send + Sync + 'static;

    /// Identifier of this sub-FSAL, embedded in every cache key.
    fn fsal_id(&self) -> u16;

    /// Optional capabilities.
    fn features(&self) -> FsalFeatures {
        FsalFeatures::empty()
    }

    /// Look up a name in a directory.
    fn lookup(
        &self,
        ctx: &OpContext,
        dir: &Self::Handle,
        name: &str,
    ) -> CacheResult<(Self::Handle, FileAttr)>;

    /// Enumerate a directory from `whence`, invoking `cb` per entry.
    /// Returns whether end of directory was reached.
    fn readdir(
        &self,
        ctx: &OpContext,
        dir: &Self::Handle,
        whence: Whence<'_>,
        attr_mask: AttrMask,
        cb: &mut dyn FnMut(FsalDirent<Self::Handle>) -> CacheResult<ReaddirControl>,
    ) -> CacheResult<bool>;

    /// Fetch attributes for an object.
    fn getattrs(
        &self,
        ctx: &OpContext,
        obj: &Self::Handle,
        mask: AttrMask,
    ) -> CacheResult<FileAttr>;

    /// Apply attribute changes to an object.
    fn setattrs(
        &self,
        ctx: &OpContext,
        obj: &Self::Handle,
        attrs: &SetAttrs,
        state: Option<&Self::State>,
    ) -> CacheResult<()> {
        Err(CacheError::NotSupp)
    }

    /// Create and open a regular file.
    fn create(
        &self,
        ctx: &OpContext,
        dir: &Self::Handle,
        name: &str,
        attrs: &SetAttrs,
    ) -> CacheResult<(Self::Handle, FileAttr, Option<Self::State>)> {
        Err(CacheError::NotSupp)
    }

    /// Create a directory.
    fn mkdir(
        &self,
        ctx: &OpContext,
        dir: &Self::Handle,
        name: &str,
        attrs: &SetAttrs,
    ) -> CacheResult<(Self::Handle, FileAttr)> {
        Err(CacheError::NotSupp)
    }

    /// Create a special node (fifo, socket, block or character device).
    fn mknode(
        &self,
        ctx: &OpContext,
        dir: &Self::Handle,
        name: &str,
        kind: FileType,
        rawdev: u64,
        attrs: &SetAttrs,
    ) -> CacheResult<(Self::Handle, FileAttr)> {
        Err(CacheError::NotSupp)
    }

    /// Create a symbolic link.
    fn symlink(
        &self,
        ctx: &OpContext,
        dir: &Self::Handle,
        name: &str,
        target: &str,
        attrs: &SetAttrs,
    ) -> CacheResult<(Self::Handle, FileAttr)> {
        Err(CacheError::NotSupp)
    }

    /// Read the target of a symbolic link.
    fn readlink(&self, ctx: &OpContext, obj: &Self::Handle) -> CacheResult<String> {
        Err(CacheError::NotSupp)
    }

    /// Add a hard link to an existing object.
    fn link(
        &self,
        ctx: &OpContext,
        obj: &Self::Handle,
        dir: &Self::Handle,
        name: &str,
    ) -> CacheResult<()> {
        Err(CacheError::NotSupp)
    }

    /// Rename an object, possibly across directories.
    fn rename(
        &self,
        ctx: &OpContext,
        obj: &Self::Handle,
        old_dir: &Self::Handle,
        old_name: &str,
        new_dir: &Self::Handle,
        new_name: &str,
    ) -> CacheResult<()> {
        Err(CacheError::NotSupp)
    }

    /// Remove a name, and the object if this was the last link.
    fn unlink(
        &self,
        ctx: &OpContext,
        dir: &Self::Handle,
        name: &str,
        obj: &Self::Handle,
    ) -> CacheResult<()> {
        Err(CacheError::NotSupp)
    }

    /// Open an object, returning opaque open state.
    fn open(
        &self,
        ctx: &OpContext,
        obj: &Self::Handle,
        flags: OpenFlags,
    ) -> CacheResult<Self::State> {
        Err(CacheError::NotSupp)
    }

    /// Close previously opened state.
    fn close(&self, ctx: &OpContext, obj: &Self::Handle, state: Self::State) -> CacheResult<()> {
        Err(CacheError::NotSupp)
    }

    /// Read file data.
    fn read(
        &self,
        ctx: &OpContext,
        obj: &Self::Handle,
        state: Option<&Self::State>,
        offset: u64,
        buf: &mut [u8],
    ) -> CacheResult<usize> {
        Err(CacheError::NotSupp)
    }

    /// Write file data.
    fn write(
        &self,
        ctx: &OpContext,
        obj: &Self::Handle,
        state: Option<&Self::State>,
        offset: u64,
        data: &[u8],
    ) -> CacheResult<usize> {
        Err(CacheError::NotSupp)
    }

    /// Commit buffered writes to stable storage.
    fn commit(
        &self,
        ctx: &OpContext,
        obj: &Self::Handle,
        offset: u64,
        length: u64,
    ) -> CacheResult<()> {
        Err(CacheError::NotSupp)
    }

    /// Perform a byte-range lock operation.
    fn lock_op(
        &self,
        ctx: &OpContext,
        obj: &Self::Handle,
        state: Option<&Self::State>,
        request: &LockRequest,
    ) -> CacheResult<()> {
        Err(CacheError::NotSupp)
    }

    /// Fetch an extended attribute.
    fn getxattr(&self, ctx: &OpContext, obj: &Self::Handle, name: &str) -> CacheResult<Vec<u8>> {
        Err(CacheError::NotSupp)
    }

    /// Set an extended attribute.
    fn setxattr(
        &self,
        ctx: &OpContext,
        obj: &Self::Handle,
        name: &str,
        value: &[u8],
    ) -> CacheResult<()> {
        Err(CacheError::NotSupp)
    }

    /// List extended attribute names.
    fn listxattrs(&self, ctx: &OpContext, obj: &Self::Handle) -> CacheResult<Vec<String>> {
        Err(CacheError::NotSupp)
    }

    /// Remove an extended attribute.
    fn removexattr(&self, ctx: &OpContext, obj: &Self::Handle, name: &str) -> CacheResult<()> {
        Err(CacheError::NotSupp)
    }

    /// Opaque key bytes for a handle. Two handles for the same object must
    /// yield the same bytes.
    fn handle_to_key(&self, obj: &Self::Handle) -> CacheResult<Vec<u8>>;

    /// Serialize a handle for export to clients.
    fn handle_to_wire(&self, obj: &Self::Handle) -> CacheResult<Vec<u8>>;

    /// Rebuild a handle from its wire form.
    fn create_handle(
        &self,
        ctx: &OpContext,
        wire: &[u8],
    ) -> CacheResult<(Self::Handle, FileAttr)> {
        Err(CacheError::NotSupp)
    }

    /// Normalize raw client-supplied bytes into key bytes.
    fn host_to_key(&self, raw: &[u8]) -> CacheResult<Vec<u8>> {
        Ok(raw.to_vec())
    }

    /// Compute the readdir cookie a name would have in a directory.
    /// 0 means the sub-FSAL cannot compute cookies.
    fn compute_readdir_cookie(&self, dir: &Self::Handle, name: &str) -> u64 {
        0
    }

    /// Merge open state from a duplicate handle for the same object into
    /// the original. The duplicate is consumed and released.
    fn merge(&self, orig: &Self::Handle, dup: Self::Handle) -> CacheResult<()> {
        drop(dup);
        Ok(())
    }
}
