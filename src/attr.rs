//! Object attributes and attribute masks.

use std::sync::Arc;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use bitflags::bitflags;

use crate::FileType;

bitflags! {
    /// Which fields of a [`FileAttr`] are populated or requested.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AttrMask: u32 {
        /// Object type.
        const TYPE = 1 << 0;
        /// Owning user id.
        const OWNER = 1 << 1;
        /// Owning group id.
        const GROUP = 1 << 2;
        /// Permission bits.
        const MODE = 1 << 3;
        /// Logical size in bytes.
        const SIZE = 1 << 4;
        /// Allocated space in bytes.
        const SPACE_USED = 1 << 5;
        /// Hard link count.
        const NLINK = 1 << 6;
        /// Access time.
        const ATIME = 1 << 7;
        /// Modification time.
        const MTIME = 1 << 8;
        /// Attribute change time.
        const CTIME = 1 << 9;
        /// Change counter.
        const CHANGE = 1 << 10;
        /// Device number for block and character specials.
        const RAWDEV = 1 << 11;
        /// Access control list.
        const ACL = 1 << 12;
    }
}

impl AttrMask {
    /// The fields every cached entry keeps populated.
    pub const BASIC: AttrMask = AttrMask::TYPE
        .union(AttrMask::OWNER)
        .union(AttrMask::GROUP)
        .union(AttrMask::MODE)
        .union(AttrMask::SIZE)
        .union(AttrMask::SPACE_USED)
        .union(AttrMask::NLINK)
        .union(AttrMask::ATIME)
        .union(AttrMask::MTIME)
        .union(AttrMask::CTIME)
        .union(AttrMask::CHANGE)
        .union(AttrMask::RAWDEV);
}

bitflags! {
    /// Access kinds checked by `test_access`. Bit values line up with
    /// the mode permission triad.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccessMask: u32 {
        /// Read access.
        const READ = 4;
        /// Write access.
        const WRITE = 2;
        /// Execute or search access.
        const EXECUTE = 1;
    }
}

/// An opaque, reference-counted access control list blob.
///
/// The cache passes ACLs through without interpreting them; cloning is a
/// reference-count bump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acl(Arc<[u8]>);

impl Acl {
    /// Wrap raw ACL bytes produced by a sub-FSAL.
    pub fn new(bytes: impl Into<Arc<[u8]>>) -> Self {
        Acl(bytes.into())
    }

    /// The raw ACL bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Cached attributes of a filesystem object.
#[derive(Debug, Clone, PartialEq)]
pub struct FileAttr {
    /// Kind of object (directory, file, symlink, etc).
    pub kind: FileType,
    /// Owning user id.
    pub owner: u32,
    /// Owning group id.
    pub group: u32,
    /// Permission bits, `rwxrwxrwx` plus setuid/setgid/sticky.
    pub mode: u32,
    /// Logical size in bytes.
    pub size: u64,
    /// Allocated space in bytes.
    pub space_used: u64,
    /// Hard link count.
    pub nlink: u32,
    /// Time of last access.
    pub atime: SystemTime,
    /// Time of last data modification.
    pub mtime: SystemTime,
    /// Time of last attribute change.
    pub ctime: SystemTime,
    /// Monotonic change counter maintained by the sub-FSAL.
    pub change: u64,
    /// Raw device number, meaningful for block and character specials.
    pub rawdev: u64,
    /// Access control list, passed through without interpretation.
    pub acl: Option<Acl>,
}

impl FileAttr {
    /// A zeroed attribute set of the given kind, used while a freshly
    /// created entry waits for its first refresh.
    pub fn placeholder(kind: FileType) -> Self {
        FileAttr {
            kind,
            owner: 0,
            group: 0,
            mode: 0,
            size: 0,
            space_used: 0,
            nlink: if kind == FileType::Directory { 2 } else { 1 },
            atime: UNIX_EPOCH,
            mtime: UNIX_EPOCH,
            ctime: UNIX_EPOCH,
            change: 0,
            rawdev: 0,
            acl: None,
        }
    }
}

/// Attribute changes requested by a setattr or create operation.
///
/// Unset fields are left untouched by the sub-FSAL.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SetAttrs {
    /// New permission bits.
    pub mode: Option<u32>,
    /// New owning user id.
    pub owner: Option<u32>,
    /// New owning group id.
    pub group: Option<u32>,
    /// New logical size (truncate or extend).
    pub size: Option<u64>,
    /// New access time.
    pub atime: Option<SystemTime>,
    /// New modification time.
    pub mtime: Option<SystemTime>,
}

impl SetAttrs {
    /// True when no change is requested.
    pub fn is_empty(&self) -> bool {
        *self == SetAttrs::default()
    }
}
