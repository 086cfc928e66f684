//! Chunks and the placement of freshly discovered dirents.
//!
//! A chunk is a contiguous run of dirents in sub-FSAL readdir order.
//! Chunks of one directory form a successor graph through `next_ck`,
//! the cookie of the first dirent of the following chunk. When a dirent
//! is discovered outside a bulk readdir (create, link, an uncached
//! lookup), [`place_new_dirent`] decides whether it belongs to a cached
//! chunk or must be kept detached.

use std::collections::VecDeque;

use log::debug;

use crate::config::CacheConfig;
use crate::dirent::{ChunkId, DirState, DirentFlags, DirentId};

/// A contiguous run of dirents in readdir order.
#[derive(Debug)]
pub(crate) struct Chunk {
    /// Member dirents, in stream order.
    pub(crate) dirents: VecDeque<DirentId>,
    /// Cookie of the first dirent of the next chunk, 0 if unknown.
    pub(crate) next_ck: u64,
    /// Back link to the chunk enumerated just before this one.
    pub(crate) prev_chunk: Option<ChunkId>,
}

impl Chunk {
    pub(crate) fn new(prev_chunk: Option<ChunkId>, next_ck: u64) -> Self {
        Chunk {
            dirents: VecDeque::new(),
            next_ck,
            prev_chunk,
        }
    }

    pub(crate) fn num_entries(&self) -> usize {
        self.dirents.len()
    }
}

/// Where a placed dirent ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Placement {
    /// The dirent joined a cached chunk. `split_off` names the chunk a
    /// split created, when one happened.
    Chunked {
        chunk: ChunkId,
        split_off: Option<ChunkId>,
    },
    /// The dirent lives in an uncached region; it was added to the
    /// detached list and existing chunks stay trusted.
    Detached,
}

enum Pos {
    /// Insert directly after this member.
    After(DirentId),
    /// Append at the tail.
    Tail,
    /// Append at the tail and take over the end-of-directory marker
    /// from this member.
    TailEod(DirentId),
    /// Prepend; the dirent becomes the directory's first known.
    Head,
}

/// Decide chunk membership for a dirent whose cookie is already known
/// and present in the by-cookie tree.
pub(crate) fn place_new_dirent(
    dir: &mut DirState,
    config: &CacheConfig,
    id: DirentId,
) -> Placement {
    let ck = dir.dirent(id).ck;
    debug_assert_ne!(ck, 0, "placement requires a computed cookie");

    let prev = dir.by_sort.range(..ck).next_back().map(|(_, &d)| d);
    let succ = dir.by_sort.range(ck..).next().map(|(_, &d)| d);

    let target = match (prev, succ) {
        (Some(p), Some(s)) => {
            let pc = sorted_chunk(dir, p);
            let sc = sorted_chunk(dir, s);
            if pc == sc {
                Some((pc, Pos::After(p)))
            } else if dir.chunk(sc).prev_chunk == Some(pc) {
                Some((pc, Pos::Tail))
            } else {
                // The neighbors straddle a gap between non-adjacent
                // chunks; the dirent belongs to an uncached region.
                None
            }
        }
        (Some(p), None) => {
            if dir.dirent(p).eod {
                Some((sorted_chunk(dir, p), Pos::TailEod(p)))
            } else {
                None
            }
        }
        (None, Some(s)) => {
            if dir.first_ck != 0 && dir.dirent(s).ck == dir.first_ck {
                Some((sorted_chunk(dir, s), Pos::Head))
            } else {
                None
            }
        }
        (None, None) => None,
    };

    let Some((cid, pos)) = target else {
        add_detached(dir, config, id);
        return Placement::Detached;
    };

    match pos {
        Pos::After(p) => {
            let idx = dir
                .chunk(cid)
                .dirents
                .iter()
                .position(|&d| d == p)
                .unwrap_or(dir.chunk(cid).num_entries() - 1);
            dir.chunk_mut(cid).dirents.insert(idx + 1, id);
        }
        Pos::Tail => dir.chunk_mut(cid).dirents.push_back(id),
        Pos::TailEod(p) => {
            dir.chunk_mut(cid).dirents.push_back(id);
            dir.dirent_mut(p).eod = false;
            dir.dirent_mut(id).eod = true;
        }
        Pos::Head => {
            dir.chunk_mut(cid).dirents.push_front(id);
            dir.first_ck = ck;
        }
    }
    dir.dirent_mut(id).chunk = Some(cid);
    dir.dirent_mut(id).flags.insert(DirentFlags::SORTED);
    dir.by_sort.insert(ck, id);

    let split_off = if dir.chunk(cid).num_entries() >= config.dir_chunk_split {
        Some(split_chunk(dir, cid))
    } else {
        None
    };
    let chunk = match dir.dirent(id).chunk {
        Some(c) => c,
        None => panic!("placed dirent {} lost its chunk", id),
    };
    Placement::Chunked { chunk, split_off }
}

fn sorted_chunk(dir: &DirState, id: DirentId) -> ChunkId {
    match dir.dirent(id).chunk {
        Some(cid) => cid,
        // Sort tree members always belong to a chunk.
        None => panic!("sort tree member {} has no chunk", id),
    }
}

/// Split a chunk in half. The second half becomes a new chunk whose
/// back link names the first half and whose `next_ck` is inherited; the
/// successor chunk's back link is repointed when it is resident.
pub(crate) fn split_chunk(dir: &mut DirState, cid: ChunkId) -> ChunkId {
    let half = dir.chunk(cid).num_entries() / 2;
    let tail = dir.chunk_mut(cid).dirents.split_off(half);
    let head_of_tail = match tail.front() {
        Some(&d) => d,
        None => panic!("chunk split produced an empty tail"),
    };
    let inherited_next = dir.chunk(cid).next_ck;
    let tail_first_ck = dir.dirent(head_of_tail).ck;

    let new_id = dir.alloc_chunk(Some(cid), inherited_next);
    for &d in &tail {
        dir.dirent_mut(d).chunk = Some(new_id);
    }
    dir.chunk_mut(new_id).dirents = tail;
    dir.chunk_mut(cid).next_ck = tail_first_ck;

    if inherited_next != 0 {
        if let Some(&next_head) = dir.by_cookie.get(&inherited_next) {
            if let Some(nc) = dir.dirent(next_head).chunk {
                if dir.chunk(nc).prev_chunk == Some(cid) {
                    dir.chunk_mut(nc).prev_chunk = Some(new_id);
                }
            }
        }
    }
    debug!(
        "split chunk {} at {} entries, new chunk {}",
        cid,
        half,
        new_id
    );
    new_id
}

/// Admit a dirent to the bounded detached list, evicting the oldest
/// detached dirent when the list is full.
pub(crate) fn add_detached(dir: &mut DirState, config: &CacheConfig, id: DirentId) {
    dir.detached.put(id, ());
    if dir.detached.len() > config.detached_max {
        if let Some((victim, ())) = dir.detached.pop_lru() {
            debug!("detached list full, evicting dirent {}", victim);
            dir.remove_dirent(victim);
        }
    }
}
