//! Per-directory dirent storage and its three ordered indexes.
//!
//! A directory's cached content lives in a [`DirState`]: an arena of
//! dirents plus three `BTreeMap` indexes over arena ids. The by-name
//! tree is keyed by a stored name hash (perturbed on collision by a
//! bounded quadratic probe), the by-cookie tree by readdir cookie, and
//! the by-sort tree by cookie again but restricted to chunk members, so
//! placement decisions can find a new dirent's chunked neighbors.
//!
//! All mutation happens under the owning entry's content write lock.

use std::collections::BTreeMap;

use bitflags::bitflags;
use lru::LruCache;

use crate::chunk::Chunk;
use crate::errors::{CacheError, CacheResult};
use crate::key::{hash_name, CacheKey};

/// Index of a dirent in its directory's arena.
pub(crate) type DirentId = usize;
/// Index of a chunk in its directory's chunk arena.
pub(crate) type ChunkId = usize;

/// How many quadratic probe steps a name insert may take before the
/// insertion is abandoned.
const NAME_PROBE_BUDGET: u64 = 4;

bitflags! {
    /// Per-dirent flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct DirentFlags: u8 {
        /// The name was removed but the dirent is kept so readdir cookies
        /// from previous results stay stable until its chunk is dropped.
        const DELETED = 1 << 0;
        /// The dirent is a member of the by-sort tree.
        const SORTED = 1 << 1;
    }
}

/// A name to child-key binding within one directory.
#[derive(Debug)]
pub(crate) struct Dirent {
    pub(crate) name: Box<str>,
    /// By-name tree key; starts at `hash_name(name)` and may be
    /// perturbed by collision probing.
    pub(crate) stored_hash: u64,
    /// The child's cache key, held by value.
    pub(crate) ckey: CacheKey,
    pub(crate) flags: DirentFlags,
    /// Readdir cookie; 0 while unknown.
    pub(crate) ck: u64,
    /// Set on the last dirent the sub-FSAL enumerated.
    pub(crate) eod: bool,
    /// Owning chunk; `None` means the dirent is detached.
    pub(crate) chunk: Option<ChunkId>,
}

impl Dirent {
    pub(crate) fn is_deleted(&self) -> bool {
        self.flags.contains(DirentFlags::DELETED)
    }
}

/// Outcome of a by-name insertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NameInsert {
    /// The dirent now owns a by-name slot.
    Inserted,
    /// A dirent with the same name already exists.
    Exists(DirentId),
}

/// Cached content of one directory.
pub(crate) struct DirState {
    /// Opaque handle bytes of the parent directory, resolved by hash
    /// lookup when needed. Never a pointer to the parent entry.
    pub(crate) parent_wire: Option<Box<[u8]>>,
    arena: Vec<Option<Dirent>>,
    arena_free: Vec<DirentId>,
    /// Name hash to dirent. Deleted dirents are not members.
    pub(crate) by_name: BTreeMap<u64, DirentId>,
    /// Cookie to dirent, for every dirent with a known cookie.
    pub(crate) by_cookie: BTreeMap<u64, DirentId>,
    /// Cookie to dirent, chunk members only. Placement decisions walk
    /// this tree for neighbors.
    pub(crate) by_sort: BTreeMap<u64, DirentId>,
    chunks: Vec<Option<Chunk>>,
    chunks_free: Vec<ChunkId>,
    /// Cookie of the first dirent known, 0 if unknown.
    pub(crate) first_ck: u64,
    /// Recency list over detached dirents.
    pub(crate) detached: LruCache<DirentId, ()>,
    /// Creates in flight between the sub-FSAL call and the dirent
    /// install; while nonzero, mtime-triggered invalidation is deferred.
    pub(crate) icreate_refcnt: u32,
}

impl std::fmt::Debug for DirState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirState")
            .field("named", &self.by_name.len())
            .field("chunks", &self.num_chunks())
            .field("detached", &self.detached.len())
            .field("first_ck", &self.first_ck)
            .finish()
    }
}

impl DirState {
    pub(crate) fn new() -> Self {
        DirState {
            parent_wire: None,
            arena: Vec::new(),
            arena_free: Vec::new(),
            by_name: BTreeMap::new(),
            by_cookie: BTreeMap::new(),
            by_sort: BTreeMap::new(),
            chunks: Vec::new(),
            chunks_free: Vec::new(),
            first_ck: 0,
            detached: LruCache::unbounded(),
            icreate_refcnt: 0,
        }
    }

    pub(crate) fn dirent(&self, id: DirentId) -> &Dirent {
        match &self.arena[id] {
            Some(dirent) => dirent,
            None => panic!("dirent slot {} is vacant", id),
        }
    }

    pub(crate) fn dirent_mut(&mut self, id: DirentId) -> &mut Dirent {
        match &mut self.arena[id] {
            Some(dirent) => dirent,
            None => panic!("dirent slot {} is vacant", id),
        }
    }

    /// Allocate a dirent outside every index. The caller inserts it into
    /// the by-name tree next and discards the slot on collision.
    pub(crate) fn alloc_dirent(&mut self, name: &str, ckey: CacheKey, ck: u64) -> DirentId {
        let dirent = Dirent {
            stored_hash: hash_name(name),
            name: name.into(),
            ckey,
            flags: DirentFlags::empty(),
            ck,
            eod: false,
            chunk: None,
        };
        match self.arena_free.pop() {
            Some(id) => {
                self.arena[id] = Some(dirent);
                id
            }
            None => {
                self.arena.push(Some(dirent));
                self.arena.len() - 1
            }
        }
    }

    /// Release a slot that is not a member of any index.
    pub(crate) fn free_slot(&mut self, id: DirentId) {
        self.arena[id] = None;
        self.arena_free.push(id);
    }

    /// Insert a dirent into the by-name tree, probing past hash
    /// collisions.
    ///
    /// # Errors
    /// [`CacheError::ServerFault`] once the probe budget is exhausted;
    /// callers treat it as a name conflict.
    pub(crate) fn insert_name(&mut self, id: DirentId) -> CacheResult<NameInsert> {
        let base = hash_name(&self.dirent(id).name);
        self.insert_name_from(id, base)
    }

    fn insert_name_from(&mut self, id: DirentId, base: u64) -> CacheResult<NameInsert> {
        for attempt in 0..NAME_PROBE_BUDGET {
            let slot = base.wrapping_add(attempt * attempt);
            match self.by_name.get(&slot) {
                None => {
                    self.dirent_mut(id).stored_hash = slot;
                    self.by_name.insert(slot, id);
                    return Ok(NameInsert::Inserted);
                }
                Some(&occupant) => {
                    if self.dirent(occupant).name == self.dirent(id).name {
                        return Ok(NameInsert::Exists(occupant));
                    }
                }
            }
        }
        Err(CacheError::ServerFault("name hash probe budget exhausted"))
    }

    /// Resolve a name to its dirent. Probes the full budget so removals
    /// of earlier occupants cannot hide later ones.
    pub(crate) fn lookup_name(&self, name: &str) -> Option<DirentId> {
        let base = hash_name(name);
        for attempt in 0..NAME_PROBE_BUDGET {
            let slot = base.wrapping_add(attempt * attempt);
            if let Some(&id) = self.by_name.get(&slot) {
                if &*self.dirent(id).name == name {
                    return Some(id);
                }
            }
        }
        None
    }

    /// Remove a dirent's by-name membership, if it has one.
    pub(crate) fn remove_name(&mut self, id: DirentId) {
        let slot = self.dirent(id).stored_hash;
        if self.by_name.get(&slot) == Some(&id) {
            self.by_name.remove(&slot);
        }
    }

    /// Assign or reassign a dirent's cookie, keeping the by-cookie tree
    /// consistent. An existing occupant of the cookie is removed first.
    pub(crate) fn set_cookie(&mut self, id: DirentId, ck: u64) {
        let old = self.dirent(id).ck;
        if old != 0 && self.by_cookie.get(&old) == Some(&id) {
            self.by_cookie.remove(&old);
        }
        if ck != 0 {
            if let Some(&occupant) = self.by_cookie.get(&ck) {
                if occupant != id {
                    self.remove_dirent(occupant);
                }
            }
            self.by_cookie.insert(ck, id);
        }
        self.dirent_mut(id).ck = ck;
    }

    /// Mark a name removed. Chunked dirents stay resident with the
    /// `DELETED` flag so their cookies remain stable; detached dirents
    /// are removed outright.
    pub(crate) fn mark_deleted(&mut self, id: DirentId) {
        if self.dirent(id).chunk.is_some() {
            self.remove_name(id);
            self.dirent_mut(id).flags.insert(DirentFlags::DELETED);
        } else {
            self.remove_dirent(id);
        }
    }

    /// Remove a dirent from every index and free its slot.
    pub(crate) fn remove_dirent(&mut self, id: DirentId) {
        self.remove_name(id);
        let (ck, sorted, chunk) = {
            let dirent = self.dirent(id);
            (
                dirent.ck,
                dirent.flags.contains(DirentFlags::SORTED),
                dirent.chunk,
            )
        };
        if ck != 0 && self.by_cookie.get(&ck) == Some(&id) {
            self.by_cookie.remove(&ck);
        }
        if sorted {
            self.by_sort.remove(&ck);
        }
        match chunk {
            Some(cid) => {
                if let Some(chunk) = &mut self.chunks[cid] {
                    chunk.dirents.retain(|&d| d != id);
                }
            }
            None => {
                self.detached.pop(&id);
            }
        }
        self.free_slot(id);
    }

    pub(crate) fn alloc_chunk(&mut self, prev_chunk: Option<ChunkId>, next_ck: u64) -> ChunkId {
        let chunk = Chunk::new(prev_chunk, next_ck);
        match self.chunks_free.pop() {
            Some(cid) => {
                self.chunks[cid] = Some(chunk);
                cid
            }
            None => {
                self.chunks.push(Some(chunk));
                self.chunks.len() - 1
            }
        }
    }

    pub(crate) fn chunk(&self, cid: ChunkId) -> &Chunk {
        match &self.chunks[cid] {
            Some(chunk) => chunk,
            None => panic!("chunk slot {} is vacant", cid),
        }
    }

    pub(crate) fn chunk_mut(&mut self, cid: ChunkId) -> &mut Chunk {
        match &mut self.chunks[cid] {
            Some(chunk) => chunk,
            None => panic!("chunk slot {} is vacant", cid),
        }
    }

    pub(crate) fn has_chunk(&self, cid: ChunkId) -> bool {
        self.chunks.get(cid).is_some_and(|slot| slot.is_some())
    }

    /// Release an empty chunk slot.
    pub(crate) fn free_chunk(&mut self, cid: ChunkId) {
        debug_assert!(self.chunk(cid).dirents.is_empty());
        self.chunks[cid] = None;
        self.chunks_free.push(cid);
    }

    pub(crate) fn num_chunks(&self) -> usize {
        self.chunks.iter().filter(|slot| slot.is_some()).count()
    }

    pub(crate) fn chunk_ids(&self) -> Vec<ChunkId> {
        self.chunks
            .iter()
            .enumerate()
            .filter_map(|(cid, slot)| slot.as_ref().map(|_| cid))
            .collect()
    }

    /// Drop one chunk and every dirent it holds. Continuations into the
    /// dropped region degrade to a re-scan.
    pub(crate) fn clean_chunk(&mut self, cid: ChunkId) {
        let ids: Vec<DirentId> = self.chunk(cid).dirents.iter().copied().collect();
        for id in ids {
            self.dirent_mut(id).chunk = None;
            // Not detached either; the dirent is going away entirely.
            self.remove_dirent(id);
        }
        self.chunks[cid] = None;
        self.chunks_free.push(cid);
        for slot in self.chunks.iter_mut().flatten() {
            if slot.prev_chunk == Some(cid) {
                slot.prev_chunk = None;
            }
        }
        if self.first_ck != 0 && !self.by_cookie.contains_key(&self.first_ck) {
            self.first_ck = 0;
        }
    }

    /// Drop all chunks and their dirents, keeping detached dirents as a
    /// name cache. Used when freshly discovered dirents cannot be given
    /// cookies and existing chunks can no longer be trusted.
    pub(crate) fn invalidate_chunks(&mut self) {
        let chunked: Vec<DirentId> = self
            .arena
            .iter()
            .enumerate()
            .filter_map(|(id, slot)| {
                slot.as_ref()
                    .and_then(|d| d.chunk.map(|_| id))
            })
            .collect();
        for id in chunked {
            self.dirent_mut(id).chunk = None;
            self.remove_dirent(id);
        }
        self.chunks.clear();
        self.chunks_free.clear();
        self.by_sort.clear();
        self.first_ck = 0;
    }

    /// Drop every cached dirent and chunk.
    pub(crate) fn invalidate_all(&mut self) {
        self.arena.clear();
        self.arena_free.clear();
        self.by_name.clear();
        self.by_cookie.clear();
        self.by_sort.clear();
        self.chunks.clear();
        self.chunks_free.clear();
        self.detached.clear();
        self.first_ck = 0;
    }

    /// Count of dirents resolvable by name.
    pub(crate) fn named_count(&self) -> usize {
        self.by_name.len()
    }

    /// Structural self-check used by tests and debug assertions.
    pub(crate) fn check_invariants(&self) -> Result<(), String> {
        let mut chunked = 0usize;
        for (id, slot) in self.arena.iter().enumerate() {
            let Some(dirent) = slot else { continue };
            match dirent.chunk {
                Some(cid) => {
                    chunked += 1;
                    let chunk = self
                        .chunks
                        .get(cid)
                        .and_then(|c| c.as_ref())
                        .ok_or_else(|| format!("dirent {} points at vacant chunk {}", id, cid))?;
                    if !chunk.dirents.contains(&id) {
                        return Err(format!("dirent {} missing from chunk {}", id, cid));
                    }
                    if dirent.flags.contains(DirentFlags::SORTED)
                        && self.by_sort.get(&dirent.ck) != Some(&id)
                    {
                        return Err(format!("sorted dirent {} missing from sort tree", id));
                    }
                }
                None => {
                    if !self.detached.contains(&id) {
                        return Err(format!("dirent {} neither chunked nor detached", id));
                    }
                }
            }
        }
        let in_chunks: usize = self
            .chunks
            .iter()
            .flatten()
            .map(|chunk| chunk.num_entries())
            .sum();
        if in_chunks != chunked {
            return Err(format!(
                "chunk membership mismatch: {} listed vs {} marked",
                in_chunks, chunked
            ));
        }
        for (&ck, &id) in &self.by_sort {
            if self.dirent(id).chunk.is_none() {
                return Err(format!("sort tree member {} (ck {}) is unchunked", id, ck));
            }
        }
        if self.first_ck != 0 {
            let &id = self
                .by_cookie
                .get(&self.first_ck)
                .ok_or_else(|| format!("first_ck {} not in cookie tree", self.first_ck))?;
            let cid = self
                .dirent(id)
                .chunk
                .ok_or_else(|| format!("first_ck dirent {} is detached", id))?;
            if self.chunk(cid).dirents.front() != Some(&id) {
                return Err(format!("first_ck dirent {} is not its chunk's head", id));
            }
        }
        Ok(())
    }
}
