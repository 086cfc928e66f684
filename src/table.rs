//! The keyed entry table.
//!
//! A concurrent map from cache key to entry, sharded by key hash with
//! one reader/writer latch per shard. Callers that need to race-check
//! an insert hold the shard's write latch across the lookup and the
//! insert; the latch guard borrows the shard lock directly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::entry::CacheEntry;
use crate::errors::{CacheError, CacheResult};
use crate::fsal::SubFsal;
use crate::key::CacheKey;

/// How a latch should be held on return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LatchMode {
    Read,
    Write,
}

pub(crate) struct Shard<F: SubFsal> {
    map: HashMap<CacheKey, Arc<CacheEntry<F>>>,
}

/// A held shard latch. Dropping it releases the shard.
pub(crate) enum Latch<'a, F: SubFsal> {
    Read {
        _guard: RwLockReadGuard<'a, Shard<F>>,
    },
    Write {
        guard: RwLockWriteGuard<'a, Shard<F>>,
    },
}

pub(crate) struct CacheTable<F: SubFsal> {
    shards: Box<[RwLock<Shard<F>>]>,
    mask: u64,
    count: AtomicUsize,
}

impl<F: SubFsal> CacheTable<F> {
    /// Create a table with `shards` shards; must be a power of two.
    pub(crate) fn new(shards: usize) -> Self {
        debug_assert!(shards.is_power_of_two());
        let shards: Box<[RwLock<Shard<F>>]> = (0..shards)
            .map(|_| {
                RwLock::new(Shard {
                    map: HashMap::new(),
                })
            })
            .collect();
        let mask = (shards.len() - 1) as u64;
        CacheTable {
            shards,
            mask,
            count: AtomicUsize::new(0),
        }
    }

    fn shard_for(&self, key: &CacheKey) -> &RwLock<Shard<F>> {
        &self.shards[(key.hash() & self.mask) as usize]
    }

    /// Look up a key and keep the shard latched in the requested mode.
    pub(crate) fn get_latched<'a>(
        &'a self,
        key: &CacheKey,
        mode: LatchMode,
    ) -> (Option<Arc<CacheEntry<F>>>, Latch<'a, F>) {
        let shard = self.shard_for(key);
        match mode {
            LatchMode::Read => {
                let guard = shard.read();
                let hit = guard.map.get(key).cloned();
                (hit, Latch::Read { _guard: guard })
            }
            LatchMode::Write => {
                let guard = shard.write();
                let hit = guard.map.get(key).cloned();
                (hit, Latch::Write { guard })
            }
        }
    }

    /// Look up a key; the latch is released before returning.
    pub(crate) fn get(&self, key: &CacheKey) -> Option<Arc<CacheEntry<F>>> {
        self.shard_for(key).read().map.get(key).cloned()
    }

    /// Insert under an already held write latch. The latch is consumed
    /// and dropped on return.
    pub(crate) fn insert_latched(
        &self,
        entry: Arc<CacheEntry<F>>,
        latch: Latch<'_, F>,
    ) -> CacheResult<()> {
        let Latch::Write { mut guard } = latch else {
            return Err(CacheError::Inval("insert requires a write latch"));
        };
        if guard.map.contains_key(entry.key()) {
            return Err(CacheError::Exist);
        }
        guard.map.insert(entry.key().clone(), entry);
        self.count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Remove the entry if the table still holds exactly it. Returns
    /// whether the table's sentinel reference was released.
    pub(crate) fn remove_checked(&self, entry: &Arc<CacheEntry<F>>) -> bool {
        let mut guard = self.shard_for(entry.key()).write();
        let present = guard
            .map
            .get(entry.key())
            .is_some_and(|occupant| Arc::ptr_eq(occupant, entry));
        if present {
            guard.map.remove(entry.key());
            self.count.fetch_sub(1, Ordering::Relaxed);
        }
        present
    }

    /// Number of published entries.
    pub(crate) fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }
}
