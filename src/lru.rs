//! Entry recency tracking and the chunk LRU.
//!
//! Entries are tracked in three recency lanes (hot, warm, cold) holding
//! weak references. A reference bit set on every cache hit promotes an
//! entry when a scan reaches it; victims are only taken from entries
//! whose strong count proves no operation holds them. Chunks have their
//! own, independent LRU: a hot entry may have cold chunks and vice
//! versa.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use lru::LruCache;
use parking_lot::Mutex;

use crate::dirent::ChunkId;
use crate::entry::CacheEntry;
use crate::fsal::SubFsal;

/// Per-entry recency state.
pub(crate) struct LruSeat {
    ref_bit: AtomicBool,
}

impl LruSeat {
    pub(crate) fn new() -> Self {
        LruSeat {
            ref_bit: AtomicBool::new(false),
        }
    }

    fn touch(&self) {
        self.ref_bit.store(true, Ordering::Release);
    }

    fn take_ref_bit(&self) -> bool {
        self.ref_bit.swap(false, Ordering::AcqRel)
    }
}

/// Aggregate cache counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    /// Key lookups attempted.
    pub mappings: u64,
    /// Key lookups that hit a cached entry.
    pub hits: u64,
    /// Entries created and published.
    pub added: u64,
    /// Creation races lost to a concurrent publisher.
    pub conflicts: u64,
}

#[derive(Default)]
pub(crate) struct StatCounters {
    mappings: AtomicU64,
    hits: AtomicU64,
    added: AtomicU64,
    conflicts: AtomicU64,
}

impl StatCounters {
    pub(crate) fn mapping(&self) {
        self.mappings.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn added(&self) {
        self.added.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn conflict(&self) {
        self.conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> CacheStats {
        CacheStats {
            mappings: self.mappings.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            added: self.added.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
        }
    }
}

struct Lanes<F: SubFsal> {
    hot: VecDeque<Weak<CacheEntry<F>>>,
    warm: VecDeque<Weak<CacheEntry<F>>>,
    cold: VecDeque<Weak<CacheEntry<F>>>,
}

/// Identifies one chunk of one directory for the chunk LRU.
type ChunkTag = (usize, ChunkId);

pub(crate) struct LruPool<F: SubFsal> {
    lanes: Mutex<Lanes<F>>,
    chunk_lru: Mutex<LruCache<ChunkTag, Weak<CacheEntry<F>>>>,
    pub(crate) stats: StatCounters,
}

/// How many lane slots one victim scan may visit.
const SCAN_BUDGET: usize = 32;

/// How many chunk LRU slots one victim pop may visit.
const CHUNK_SCAN_BUDGET: usize = 8;

impl<F: SubFsal> LruPool<F> {
    pub(crate) fn new() -> Self {
        LruPool {
            lanes: Mutex::new(Lanes {
                hot: VecDeque::new(),
                warm: VecDeque::new(),
                cold: VecDeque::new(),
            }),
            chunk_lru: Mutex::new(LruCache::unbounded()),
            stats: StatCounters::default(),
        }
    }

    /// Track a freshly published entry.
    pub(crate) fn insert_entry(&self, entry: &Arc<CacheEntry<F>>) {
        self.lanes.lock().warm.push_back(Arc::downgrade(entry));
    }

    /// Record a cache hit; the entry is promoted when a scan reaches it.
    pub(crate) fn touch(&self, entry: &CacheEntry<F>) {
        entry.seat.touch();
    }

    /// Find an entry eligible for eviction: not recently touched and
    /// referenced only by the table and this scan. The victim is removed
    /// from the lanes; callers that fail to evict must requeue it.
    pub(crate) fn pick_victim(&self) -> Option<Arc<CacheEntry<F>>> {
        let mut lanes = self.lanes.lock();
        for _ in 0..SCAN_BUDGET {
            if let Some(weak) = lanes.cold.pop_front() {
                let Some(entry) = weak.upgrade() else { continue };
                if entry.seat.take_ref_bit() {
                    lanes.hot.push_back(weak);
                    continue;
                }
                if Arc::strong_count(&entry) > 2 {
                    // Pinned by an in-flight operation.
                    lanes.warm.push_back(weak);
                    continue;
                }
                return Some(entry);
            }
            if let Some(weak) = lanes.warm.pop_front() {
                let Some(entry) = weak.upgrade() else { continue };
                if entry.seat.take_ref_bit() {
                    lanes.hot.push_back(weak);
                } else {
                    lanes.cold.push_back(weak);
                }
                continue;
            }
            if let Some(weak) = lanes.hot.pop_front() {
                let Some(entry) = weak.upgrade() else { continue };
                if entry.seat.take_ref_bit() {
                    lanes.hot.push_back(weak);
                } else {
                    lanes.warm.push_back(weak);
                }
                continue;
            }
            return None;
        }
        None
    }

    /// Put an entry back after a failed eviction attempt.
    pub(crate) fn requeue(&self, entry: &Arc<CacheEntry<F>>) {
        self.lanes.lock().warm.push_back(Arc::downgrade(entry));
    }

    /// Register or refresh a chunk; returns the tracked chunk count.
    pub(crate) fn record_chunk(
        &self,
        parent: &Arc<CacheEntry<F>>,
        chunk: ChunkId,
    ) -> usize {
        let mut lru = self.chunk_lru.lock();
        lru.put((parent.addr(), chunk), Arc::downgrade(parent));
        lru.len()
    }

    /// Mark a chunk recently used.
    pub(crate) fn bump_chunk(&self, parent: &Arc<CacheEntry<F>>, chunk: ChunkId) {
        self.chunk_lru.lock().promote(&(parent.addr(), chunk));
    }

    /// Drop a chunk from recency tracking.
    pub(crate) fn forget_chunk(&self, parent_addr: usize, chunk: ChunkId) {
        self.chunk_lru.lock().pop(&(parent_addr, chunk));
    }

    /// Number of tracked chunks, dead tags included until they are
    /// popped.
    pub(crate) fn chunk_count(&self) -> usize {
        self.chunk_lru.lock().len()
    }

    /// Pop the coldest chunk not belonging to `skip_addr`. Dead tags
    /// are discarded along the way.
    pub(crate) fn pop_chunk_victim(
        &self,
        skip_addr: usize,
    ) -> Option<(Arc<CacheEntry<F>>, ChunkId)> {
        let mut lru = self.chunk_lru.lock();
        for _ in 0..CHUNK_SCAN_BUDGET {
            let ((addr, chunk), weak) = lru.pop_lru()?;
            if addr == skip_addr {
                // The caller holds this directory's content lock.
                lru.put((addr, chunk), weak);
                continue;
            }
            match weak.upgrade() {
                Some(entry) => return Some((entry, chunk)),
                None => continue,
            }
        }
        None
    }
}
