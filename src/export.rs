//! Exports and the entry/export mapping.
//!
//! Entries may be reachable through multiple exports. The relation is
//! kept on both sides: each entry carries the list of export ids it is
//! attached to (under its attribute lock), and the cache keeps a
//! per-export map from cache key to entry (under the export's mapping
//! lock). Unexport is a barrier: once the flag is set, no new mapping is
//! added and in-flight operations observe stale.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use bitflags::bitflags;
use parking_lot::{Mutex, RwLock};

use crate::entry::CacheEntry;
use crate::errors::{CacheError, CacheResult};
use crate::fsal::SubFsal;
use crate::key::CacheKey;

/// Identifier of an export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExportId(pub u16);

impl fmt::Display for ExportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "export {}", self.0)
    }
}

bitflags! {
    /// Per-export flag byte.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ExportFlags: u8 {
        /// The export is being removed; operations through it fail stale.
        const UNEXPORT = 1 << 0;
    }
}

/// An administrative mount point through which the cache is exposed.
#[derive(Debug)]
pub struct Export {
    id: ExportId,
    flags: AtomicU8,
}

impl Export {
    /// Create an export record. Exports are normally created through
    /// [`MetadataCache::add_export`](crate::MetadataCache::add_export),
    /// which also registers the mapping table.
    pub fn new(id: ExportId) -> Self {
        Export {
            id,
            flags: AtomicU8::new(0),
        }
    }

    /// This export's identifier.
    pub fn id(&self) -> ExportId {
        self.id
    }

    /// True once unexport has begun.
    pub fn is_unexporting(&self) -> bool {
        ExportFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
            .contains(ExportFlags::UNEXPORT)
    }

    pub(crate) fn begin_unexport(&self) {
        self.flags
            .fetch_or(ExportFlags::UNEXPORT.bits(), Ordering::AcqRel);
    }
}

/// The export-side half of the mapping: key to entry, guarded by the
/// export's mapping lock.
pub(crate) struct ExportMap<F: SubFsal> {
    pub(crate) entries: Mutex<HashMap<CacheKey, Weak<CacheEntry<F>>>>,
}

impl<F: SubFsal> ExportMap<F> {
    fn new() -> Self {
        ExportMap {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

/// Registry of live exports and their mapping tables.
pub(crate) struct ExportRegistry<F: SubFsal> {
    exports: RwLock<HashMap<ExportId, (Arc<Export>, Arc<ExportMap<F>>)>>,
}

impl<F: SubFsal> ExportRegistry<F> {
    pub(crate) fn new() -> Self {
        ExportRegistry {
            exports: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) fn add(&self, id: ExportId) -> CacheResult<Arc<Export>> {
        let mut exports = self.exports.write();
        if exports.contains_key(&id) {
            return Err(CacheError::Exist);
        }
        let export = Arc::new(Export::new(id));
        exports.insert(id, (export.clone(), Arc::new(ExportMap::new())));
        Ok(export)
    }

    /// The mapping table for an export, if it is still registered.
    pub(crate) fn map_of(&self, id: ExportId) -> Option<Arc<ExportMap<F>>> {
        self.exports.read().get(&id).map(|(_, map)| map.clone())
    }

    pub(crate) fn remove(&self, id: ExportId) -> Option<Arc<ExportMap<F>>> {
        self.exports.write().remove(&id).map(|(_, map)| map)
    }
}
