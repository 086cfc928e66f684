//! Cache entries.
//!
//! One [`CacheEntry`] represents one cached filesystem object. The
//! attribute lock protects the attribute cell (attributes, populated
//! mask, export list); the content lock protects the per-type payload.
//! The attribute lock always orders before the content lock, and before
//! any export mapping lock. Reference counting rides on `Arc`: the hash
//! table holds the sentinel reference, operations hold clones, and the
//! final drop frees the entry together with its sub-FSAL handle.

use std::fmt;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bitflags::bitflags;
use parking_lot::{
    MappedRwLockReadGuard, MappedRwLockWriteGuard, Mutex, RwLock, RwLockReadGuard,
    RwLockWriteGuard,
};
use smallvec::SmallVec;

use crate::attr::{AttrMask, FileAttr};
use crate::dirent::DirState;
use crate::errors::{CacheError, CacheResult};
use crate::export::ExportId;
use crate::fsal::SubFsal;
use crate::key::CacheKey;
use crate::lru::LruSeat;
use crate::FileType;

bitflags! {
    /// Per-entry trust and state flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EntryFlags: u32 {
        /// Cached attributes are authoritative.
        const TRUST_ATTRS = 1 << 0;
        /// Cached directory content is authoritative.
        const TRUST_CONTENT = 1 << 1;
        /// Cached chunks reflect sub-FSAL stream order.
        const TRUST_DIR_CHUNKS = 1 << 2;
        /// Every dirent of the directory is cached; misses are negative.
        const DIR_POPULATED = 1 << 3;
        /// The directory overflowed; operations skip the dirent cache.
        const BYPASS_DIRCACHE = 1 << 4;
        /// The entry was killed and must not be handed out again.
        const UNREACHABLE = 1 << 5;
    }
}

/// Atomic holder for [`EntryFlags`].
///
/// Flag words are read without locks; transitions that must stay
/// consistent with directory content are made under the content lock.
pub(crate) struct AtomicEntryFlags(AtomicU32);

impl AtomicEntryFlags {
    fn new(flags: EntryFlags) -> Self {
        AtomicEntryFlags(AtomicU32::new(flags.bits()))
    }

    pub(crate) fn load(&self) -> EntryFlags {
        EntryFlags::from_bits_truncate(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn contains(&self, flags: EntryFlags) -> bool {
        self.load().contains(flags)
    }

    /// Set bits; returns the previous flag word.
    pub(crate) fn set(&self, flags: EntryFlags) -> EntryFlags {
        EntryFlags::from_bits_truncate(self.0.fetch_or(flags.bits(), Ordering::AcqRel))
    }

    /// Clear bits; returns the previous flag word.
    pub(crate) fn clear(&self, flags: EntryFlags) -> EntryFlags {
        EntryFlags::from_bits_truncate(self.0.fetch_and(!flags.bits(), Ordering::AcqRel))
    }
}

/// Attribute state guarded by the attribute lock.
pub(crate) struct AttrCell {
    pub(crate) attrs: FileAttr,
    /// Which attribute fields are populated.
    pub(crate) valid: AttrMask,
    /// When the attributes were last fetched; `None` until the first
    /// refresh completes.
    pub(crate) fetched_at: Option<Instant>,
    /// Exports this entry is attached to.
    pub(crate) exports: SmallVec<[ExportId; 2]>,
}

/// Per-type payload guarded by the content lock.
pub(crate) enum EntryContent {
    /// Regular file; data caching is out of scope.
    File,
    /// Directory content: dirents, indexes, chunks.
    Directory(Box<DirState>),
    /// Symbolic link with an optionally cached target.
    Symlink { target: Option<String> },
    /// Block, character, socket or fifo node.
    Special,
}

impl EntryContent {
    fn for_kind(kind: FileType) -> Self {
        match kind {
            FileType::Directory => EntryContent::Directory(Box::new(DirState::new())),
            FileType::RegularFile => EntryContent::File,
            FileType::Symlink => EntryContent::Symlink { target: None },
            _ => EntryContent::Special,
        }
    }
}

/// A counted reference to a cache entry. Cloning takes a reference,
/// dropping releases it.
pub type EntryRef<F> = Arc<CacheEntry<F>>;

/// One cached filesystem object.
pub struct CacheEntry<F: SubFsal> {
    pub(crate) key: CacheKey,
    pub(crate) kind: FileType,
    pub(crate) flags: AtomicEntryFlags,
    /// Id of the export that attached the entry first, or -1. Read
    /// without locks as the mapping fast path.
    pub(crate) first_export_id: AtomicI32,
    /// The sub-FSAL handle this entry caches. Dropping the entry
    /// releases the handle.
    pub(crate) sub_handle: F::Handle,
    /// Opaque open state, stored but never interpreted.
    pub(crate) open_state: Mutex<Option<F::State>>,
    pub(crate) attrs: RwLock<AttrCell>,
    pub(crate) content: RwLock<EntryContent>,
    pub(crate) seat: LruSeat,
}

impl<F: SubFsal> CacheEntry<F> {
    pub(crate) fn new(
        key: CacheKey,
        attrs: FileAttr,
        valid: AttrMask,
        sub_handle: F::Handle,
        state: Option<F::State>,
    ) -> Self {
        let kind = attrs.kind;
        let fetched_at = if valid.is_empty() {
            None
        } else {
            Some(Instant::now())
        };
        let mut initial = if valid.is_empty() {
            EntryFlags::empty()
        } else {
            EntryFlags::TRUST_ATTRS
        };
        if kind == FileType::Directory {
            // Empty content is authoritative until an invalidation says
            // otherwise; DIR_POPULATED stays clear so misses go to the
            // sub-FSAL.
            initial |= EntryFlags::TRUST_CONTENT | EntryFlags::TRUST_DIR_CHUNKS;
        }
        CacheEntry {
            key,
            kind,
            flags: AtomicEntryFlags::new(initial),
            first_export_id: AtomicI32::new(-1),
            sub_handle,
            open_state: Mutex::new(state),
            attrs: RwLock::new(AttrCell {
                attrs,
                valid,
                fetched_at,
                exports: SmallVec::new(),
            }),
            content: RwLock::new(EntryContent::for_kind(kind)),
            seat: LruSeat::new(),
        }
    }

    /// The entry's cache key.
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// The entry's immutable object type.
    pub fn kind(&self) -> FileType {
        self.kind
    }

    /// Whether this entry is a directory.
    pub fn is_dir(&self) -> bool {
        self.kind == FileType::Directory
    }

    /// Current flag word.
    pub fn entry_flags(&self) -> EntryFlags {
        self.flags.load()
    }

    /// Take a reference for handing to a caller. Refused once the entry
    /// has become unreachable.
    pub(crate) fn try_ref(self: &Arc<Self>) -> CacheResult<EntryRef<F>> {
        let entry = Arc::clone(self);
        if entry.flags.contains(EntryFlags::UNREACHABLE) {
            return Err(CacheError::Stale);
        }
        Ok(entry)
    }

    /// True when the cached attributes cover `mask` and are fresh.
    pub(crate) fn attrs_valid(&self, mask: AttrMask, ttl: Duration) -> bool {
        if !self.flags.contains(EntryFlags::TRUST_ATTRS) {
            return false;
        }
        let cell = self.attrs.read();
        if !cell.valid.contains(mask) {
            return false;
        }
        match cell.fetched_at {
            Some(at) => at.elapsed() <= ttl,
            None => false,
        }
    }

    /// Directory payload under the content read lock.
    pub(crate) fn dir_read(&self) -> CacheResult<MappedRwLockReadGuard<'_, DirState>> {
        RwLockReadGuard::try_map(self.content.read(), |content| match content {
            EntryContent::Directory(dir) => Some(&**dir),
            _ => None,
        })
        .map_err(|_| CacheError::Inval("not a directory"))
    }

    /// Directory payload under the content write lock.
    pub(crate) fn dir_write(&self) -> CacheResult<MappedRwLockWriteGuard<'_, DirState>> {
        RwLockWriteGuard::try_map(self.content.write(), |content| match content {
            EntryContent::Directory(dir) => Some(&mut **dir),
            _ => None,
        })
        .map_err(|_| CacheError::Inval("not a directory"))
    }

    /// Directory payload if the content write lock can be taken without
    /// blocking. `Ok(None)` means the lock is contended.
    pub(crate) fn try_dir_write(
        &self,
    ) -> CacheResult<Option<MappedRwLockWriteGuard<'_, DirState>>> {
        let Some(guard) = self.content.try_write() else {
            return Ok(None);
        };
        RwLockWriteGuard::try_map(guard, |content| match content {
            EntryContent::Directory(dir) => Some(&mut **dir),
            _ => None,
        })
        .map(Some)
        .map_err(|_| CacheError::Inval("not a directory"))
    }

    /// Address used for identity comparisons and chunk LRU tags.
    pub(crate) fn addr(self: &Arc<Self>) -> usize {
        Arc::as_ptr(self) as usize
    }
}

impl<F: SubFsal> fmt::Debug for CacheEntry<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry")
            .field("key", &self.key)
            .field("kind", &self.kind)
            .field("flags", &self.flags.load())
            .finish()
    }
}
