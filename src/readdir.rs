//! Chunked directory enumeration.
//!
//! Serving a readdir request alternates between walking cached chunks
//! under the content read lock and populating missing regions under the
//! content write lock. Population passes a fresh chunk as callback
//! state to the sub-FSAL's readdir, rotates to a readahead chunk when
//! one fills, and stitches into already cached chunks when the stream
//! catches up with them.
//!
//! Cookie stability: a cookie handed to a client remains a valid
//! continuation point for as long as its chunk is resident. Once the
//! chunk is evicted, continuation degrades to a re-scan under
//! whence-is-name sub-FSALs and to a bad-cookie error under cookie
//! seeking ones.

use log::{debug, trace};

use crate::attr::AttrMask;
use crate::dirent::{ChunkId, DirState, DirentFlags, DirentId};
use crate::entry::{EntryFlags, EntryRef};
use crate::errors::{CacheError, CacheResult};
use crate::fsal::{FsalDirent, FsalFeatures, ReaddirControl, SubFsal, Whence};
use crate::key::CacheKey;
use crate::ops::MetadataCache;
use crate::op_context::OpContext;

/// Cookies 1 and 2 are reserved for the protocol's dot entries; real
/// dirents start at 3.
const FIRST_VALID_COOKIE: u64 = 3;

/// Where a population pass starts relative to what is cached.
enum Continuation {
    /// Start of the directory.
    FromStart,
    /// Continue after the last dirent of this resident chunk.
    AfterChunk(ChunkId),
    /// Continue after this cookie, for sub-FSALs that seek by cookie.
    Cookie(u64),
}

/// What a population pass produced.
struct PopulateOutcome {
    /// Dirent matching the sought cookie, when one was requested.
    found: Option<DirentId>,
    /// First dirent added by this pass.
    first_new: Option<DirentId>,
    /// Number of dirents added.
    added: usize,
    /// End of directory was reached.
    eod: bool,
    /// The pass collided with an already cached chunk and stitched the
    /// successor link to it. Progress even when nothing new was added.
    stitched: bool,
    /// Cookie of the cached dirent the pass stitched into, 0 if none.
    stitch_ck: u64,
}

/// Where a cached walk ended.
enum WalkEnd {
    /// The end-of-directory marker was reached.
    Eod,
    /// The user callback stopped the walk.
    Stopped { at_eod: bool },
    /// The cached run ended before end of directory.
    Gap,
}

/// Resolution of a resume cookie against the cached indexes.
enum Locate {
    At(DirentId),
    FromStart,
    Seek,
}

fn locate(dir: &DirState, resume_ck: u64) -> Locate {
    if resume_ck == 0 {
        if dir.first_ck != 0 {
            if let Some(&id) = dir.by_cookie.get(&dir.first_ck) {
                if dir.dirent(id).chunk.is_some() {
                    return Locate::At(id);
                }
            }
        }
        return Locate::FromStart;
    }
    match dir.by_cookie.get(&resume_ck) {
        Some(&id) if dir.dirent(id).chunk.is_some() => Locate::At(id),
        _ => Locate::Seek,
    }
}

/// Follow `next_ck` links from a chunk to the last resident chunk of
/// its contiguous run.
fn chain_end(dir: &DirState, from: ChunkId) -> ChunkId {
    let mut current = from;
    // The successor graph is acyclic, but bound the walk anyway.
    for _ in 0..=dir.num_chunks() {
        let next_ck = dir.chunk(current).next_ck;
        if next_ck == 0 {
            return current;
        }
        match dir.by_cookie.get(&next_ck) {
            Some(&id) => match dir.dirent(id).chunk {
                Some(next) if next != current => current = next,
                _ => return current,
            },
            None => return current,
        }
    }
    current
}

impl<F: SubFsal> MetadataCache<F> {
    /// Enumerate a directory from `whence`, invoking `cb` per dirent.
    ///
    /// `whence` 0 starts at the beginning; otherwise it is a cookie from
    /// a previous enumeration and the walk resumes after it. The
    /// callback receives the name, a referenced child entry, and the
    /// dirent's cookie; returning [`ReaddirControl::Stop`] ends the walk
    /// after the delivered dirent. Returns whether end of directory was
    /// met.
    ///
    /// The callback runs under the directory's content read lock and
    /// must not call back into the cache for the same directory.
    pub fn readdir(
        &self,
        ctx: &OpContext,
        dir_entry: &EntryRef<F>,
        whence: u64,
        attr_mask: AttrMask,
        cb: &mut dyn FnMut(&str, &EntryRef<F>, u64) -> CacheResult<ReaddirControl>,
    ) -> CacheResult<bool> {
        self.check_mapping(ctx, dir_entry)?;
        if whence != 0 && whence < FIRST_VALID_COOKIE {
            return Err(CacheError::BadCookie(whence));
        }
        if !self.config.chunking_enabled()
            || dir_entry.flags.contains(EntryFlags::BYPASS_DIRCACHE)
        {
            return self.readdir_uncached(ctx, dir_entry, whence, attr_mask, cb);
        }
        {
            let mut dir = dir_entry.dir_write()?;
            self.retrust_dir(dir_entry, &mut dir);
        }

        let whence_is_name = self
            .fsal
            .features()
            .contains(FsalFeatures::WHENCE_IS_NAME);
        let mut resume_ck = whence;
        // Set when a population pass names an explicit first dirent that
        // the walk must deliver rather than skip past.
        let mut pending_inclusive = false;

        loop {
            // Walk phase, under the read lock.
            {
                let dir = dir_entry.dir_read()?;
                if let Locate::At(start) = locate(&dir, resume_ck) {
                    let include_start = resume_ck == 0 || pending_inclusive;
                    pending_inclusive = false;
                    match self.walk_chunks(
                        ctx,
                        dir_entry,
                        &dir,
                        start,
                        include_start,
                        &mut resume_ck,
                        cb,
                    )? {
                        WalkEnd::Eod => return Ok(true),
                        WalkEnd::Stopped { at_eod } => return Ok(at_eod),
                        WalkEnd::Gap => {}
                    }
                }
            }

            // Population phase, under the write lock.
            let mut dir = dir_entry.dir_write()?;
            match locate(&dir, resume_ck) {
                Locate::At(start) => {
                    // The resume position is cached; extend the run it
                    // belongs to.
                    let start_chunk = match dir.dirent(start).chunk {
                        Some(cid) => cid,
                        None => continue,
                    };
                    let run_end = chain_end(&dir, start_chunk);
                    let ends_at_eod = dir
                        .chunk(run_end)
                        .dirents
                        .back()
                        .is_some_and(|&last| dir.dirent(last).eod);
                    if ends_at_eod {
                        continue;
                    }
                    let outcome = self.populate_checked(
                        ctx,
                        dir_entry,
                        &mut dir,
                        0,
                        Continuation::AfterChunk(run_end),
                        attr_mask,
                    );
                    match outcome {
                        Ok(out) => {
                            if out.added == 0 && !out.eod && !out.stitched {
                                drop(dir);
                                return self.incomplete_readdir();
                            }
                        }
                        Err(CacheError::Overflow) => {
                            return self.readdir_overflow(
                                ctx, dir_entry, dir, resume_ck, attr_mask, cb,
                            );
                        }
                        Err(err) => return Err(err),
                    }
                }
                Locate::FromStart => {
                    let outcome = self.populate_checked(
                        ctx,
                        dir_entry,
                        &mut dir,
                        0,
                        Continuation::FromStart,
                        attr_mask,
                    );
                    match outcome {
                        Ok(out) => {
                            if out.added == 0 && !out.stitched {
                                if out.eod {
                                    // Nothing to enumerate at all.
                                    return Ok(true);
                                }
                                drop(dir);
                                return self.incomplete_readdir();
                            }
                        }
                        Err(CacheError::Overflow) => {
                            return self.readdir_overflow(
                                ctx, dir_entry, dir, resume_ck, attr_mask, cb,
                            );
                        }
                        Err(err) => return Err(err),
                    }
                }
                Locate::Seek if !whence_is_name => {
                    // Cookie seeking sub-FSAL: ask it to continue after
                    // the cookie directly. A bogus cookie is its to
                    // reject.
                    let outcome = self.populate_checked(
                        ctx,
                        dir_entry,
                        &mut dir,
                        0,
                        Continuation::Cookie(resume_ck),
                        attr_mask,
                    );
                    match outcome {
                        Ok(out) => {
                            if out.added == 0 && !out.stitched {
                                if out.eod {
                                    // The cookie pointed at the end.
                                    return Ok(true);
                                }
                                drop(dir);
                                return self.incomplete_readdir();
                            }
                            if let Some(first) = out.first_new {
                                resume_ck = dir.dirent(first).ck;
                                pending_inclusive = true;
                            } else if out.stitched {
                                // Everything after the cookie is already
                                // cached; deliver from the stitch point.
                                resume_ck = out.stitch_ck;
                                pending_inclusive = true;
                            }
                        }
                        Err(CacheError::Overflow) => {
                            return self.readdir_overflow(
                                ctx, dir_entry, dir, resume_ck, attr_mask, cb,
                            );
                        }
                        Err(err) => return Err(err),
                    }
                }
                Locate::Seek => {
                    // Whence-is-name sub-FSAL: re-scan from the nearest
                    // surviving chunk (or the beginning), skipping
                    // already cached runs, until the sought cookie shows
                    // up or end of directory proves it gone.
                    let mut found = false;
                    loop {
                        let anchor = dir
                            .by_sort
                            .range(..resume_ck)
                            .next_back()
                            .and_then(|(_, &id)| dir.dirent(id).chunk)
                            .or_else(|| {
                                // No sorted predecessor; fall back to the
                                // run reachable from the stream head.
                                dir.by_cookie
                                    .get(&dir.first_ck)
                                    .and_then(|&id| dir.dirent(id).chunk)
                            });
                        let continuation = match anchor {
                            Some(cid) => Continuation::AfterChunk(chain_end(&dir, cid)),
                            None => Continuation::FromStart,
                        };
                        let out = match self.populate_checked(
                            ctx,
                            dir_entry,
                            &mut dir,
                            resume_ck,
                            continuation,
                            attr_mask,
                        ) {
                            Ok(out) => out,
                            Err(CacheError::Overflow) => {
                                return self.readdir_overflow(
                                    ctx, dir_entry, dir, resume_ck, attr_mask, cb,
                                );
                            }
                            Err(err) => return Err(err),
                        };
                        if out.found.is_some() {
                            found = true;
                            break;
                        }
                        if out.eod {
                            break;
                        }
                        if out.added == 0 && !out.stitched {
                            drop(dir);
                            return self.incomplete_readdir();
                        }
                    }
                    if !found {
                        // The dirent behind the cookie no longer exists.
                        return Err(CacheError::BadCookie(resume_ck));
                    }
                }
            }
        }
    }

    /// An apparently complete pass that never produced the end marker.
    fn incomplete_readdir(&self) -> CacheResult<bool> {
        if self.config.retry_readdir {
            Err(CacheError::Delay)
        } else {
            Ok(false)
        }
    }

    /// A population pass overflowed the dirent cap: drop the cache,
    /// leave bypass mode on, and finish the enumeration uncached.
    fn readdir_overflow(
        &self,
        ctx: &OpContext,
        dir_entry: &EntryRef<F>,
        mut dir: parking_lot::MappedRwLockWriteGuard<'_, DirState>,
        resume_ck: u64,
        attr_mask: AttrMask,
        cb: &mut dyn FnMut(&str, &EntryRef<F>, u64) -> CacheResult<ReaddirControl>,
    ) -> CacheResult<bool> {
        debug!("directory {:?} overflowed during readdir", dir_entry.key());
        for cid in dir.chunk_ids() {
            self.pool.forget_chunk(dir_entry.addr(), cid);
        }
        dir.invalidate_all();
        dir_entry.flags.clear(
            EntryFlags::TRUST_CONTENT
                | EntryFlags::TRUST_DIR_CHUNKS
                | EntryFlags::DIR_POPULATED,
        );
        drop(dir);
        self.readdir_uncached(ctx, dir_entry, resume_ck, attr_mask, cb)
    }

    /// Uncached enumeration, used in legacy mode (chunking disabled) and
    /// under bypass.
    fn readdir_uncached(
        &self,
        ctx: &OpContext,
        dir_entry: &EntryRef<F>,
        whence: u64,
        attr_mask: AttrMask,
        cb: &mut dyn FnMut(&str, &EntryRef<F>, u64) -> CacheResult<ReaddirControl>,
    ) -> CacheResult<bool> {
        let whence_is_name = self
            .fsal
            .features()
            .contains(FsalFeatures::WHENCE_IS_NAME);
        // Name seeking sub-FSALs cannot jump to a cookie; scan from the
        // start and swallow dirents until the cookie is passed.
        let mut skip_until = (whence >= FIRST_VALID_COOKIE && whence_is_name).then_some(whence);
        let fsal_whence = if whence >= FIRST_VALID_COOKIE && !whence_is_name {
            Whence::Cookie(whence)
        } else {
            Whence::Start
        };
        self.fsal.readdir(
            ctx,
            &dir_entry.sub_handle,
            fsal_whence,
            attr_mask,
            &mut |fd: FsalDirent<F::Handle>| {
                if let Some(mark) = skip_until {
                    if fd.cookie == mark {
                        skip_until = None;
                    }
                    return Ok(ReaddirControl::Continue);
                }
                let child =
                    self.new_entry(ctx, fd.handle, fd.attrs, AttrMask::BASIC, None)?;
                match cb(&fd.name, &child, fd.cookie) {
                    Ok(control) => Ok(control),
                    Err(CacheError::XDev) => Ok(ReaddirControl::Continue),
                    Err(err) => Err(err),
                }
            },
        )
    }

    /// Walk resident chunks from `start`, delivering non-deleted dirents
    /// to the callback.
    #[allow(clippy::too_many_arguments)]
    fn walk_chunks(
        &self,
        ctx: &OpContext,
        parent: &EntryRef<F>,
        dir: &DirState,
        start: DirentId,
        include_start: bool,
        resume_ck: &mut u64,
        cb: &mut dyn FnMut(&str, &EntryRef<F>, u64) -> CacheResult<ReaddirControl>,
    ) -> CacheResult<WalkEnd> {
        let mut cid = match dir.dirent(start).chunk {
            Some(cid) => cid,
            None => return Err(CacheError::ServerFault("walk anchored on detached dirent")),
        };
        let mut idx = match dir.chunk(cid).dirents.iter().position(|&d| d == start) {
            Some(idx) => idx,
            None => return Err(CacheError::ServerFault("dirent missing from its chunk")),
        };
        if !include_start {
            idx += 1;
        }
        loop {
            self.pool.bump_chunk(parent, cid);
            let chunk = dir.chunk(cid);
            while idx < chunk.dirents.len() {
                let id = chunk.dirents[idx];
                let dirent = dir.dirent(id);
                if !dirent.is_deleted() {
                    if let Some(child) =
                        self.resolve_walk_child(ctx, parent, &dirent.name, &dirent.ckey)?
                    {
                        match cb(&dirent.name, &child, dirent.ck) {
                            Ok(ReaddirControl::Continue) => {
                                *resume_ck = dirent.ck;
                            }
                            Ok(ReaddirControl::Stop) => {
                                *resume_ck = dirent.ck;
                                return Ok(WalkEnd::Stopped {
                                    at_eod: dirent.eod,
                                });
                            }
                            Err(CacheError::XDev) => {
                                // Junction; skip the dirent.
                                *resume_ck = dirent.ck;
                            }
                            Err(err) => return Err(err),
                        }
                    } else {
                        trace!("dirent {:?} went stale mid-walk", dirent.name);
                    }
                }
                if dirent.eod {
                    return Ok(WalkEnd::Eod);
                }
                idx += 1;
            }
            // The per-dirent check above misses the eod marker when the
            // walk started past it (a client re-reading from its last
            // cookie); catch it at the chunk boundary.
            if chunk
                .dirents
                .back()
                .is_some_and(|&last| dir.dirent(last).eod)
            {
                return Ok(WalkEnd::Eod);
            }
            let next_ck = chunk.next_ck;
            if next_ck == 0 {
                return Ok(WalkEnd::Gap);
            }
            match dir.by_cookie.get(&next_ck) {
                Some(&next_head) => match dir.dirent(next_head).chunk {
                    Some(next_cid) => {
                        idx = match dir
                            .chunk(next_cid)
                            .dirents
                            .iter()
                            .position(|&d| d == next_head)
                        {
                            Some(idx) => idx,
                            None => {
                                return Err(CacheError::ServerFault(
                                    "dirent missing from its chunk",
                                ));
                            }
                        };
                        cid = next_cid;
                    }
                    None => return Ok(WalkEnd::Gap),
                },
                None => return Ok(WalkEnd::Gap),
            }
        }
    }

    /// Resolve a walked dirent to its child entry, re-fetching from the
    /// sub-FSAL when the child was evicted. `None` means the dirent went
    /// stale and should be skipped.
    fn resolve_walk_child(
        &self,
        ctx: &OpContext,
        parent: &EntryRef<F>,
        name: &str,
        ckey: &CacheKey,
    ) -> CacheResult<Option<EntryRef<F>>> {
        match self.find_keyed(ckey) {
            Ok(child) => Ok(Some(child)),
            Err(_) => match self.fsal.lookup(ctx, &parent.sub_handle, name) {
                Ok((handle, attrs)) => Ok(Some(self.new_entry(
                    ctx,
                    handle,
                    attrs,
                    AttrMask::BASIC,
                    None,
                )?)),
                Err(CacheError::NoEnt) | Err(CacheError::Stale) => Ok(None),
                Err(err) => Err(err),
            },
        }
    }

    /// Populate and mark the chunk stream trusted on success.
    fn populate_checked(
        &self,
        ctx: &OpContext,
        parent: &EntryRef<F>,
        dir: &mut DirState,
        target_ck: u64,
        continuation: Continuation,
        attr_mask: AttrMask,
    ) -> CacheResult<PopulateOutcome> {
        let outcome = self.populate_dir_chunk(ctx, parent, dir, target_ck, continuation, attr_mask)?;
        parent.flags.set(EntryFlags::TRUST_DIR_CHUNKS);
        Ok(outcome)
    }

    /// One population pass: allocate a chunk, feed it from the
    /// sub-FSAL, rotating to readahead chunks and stitching into cached
    /// runs as needed.
    fn populate_dir_chunk(
        &self,
        ctx: &OpContext,
        parent: &EntryRef<F>,
        dir: &mut DirState,
        target_ck: u64,
        continuation: Continuation,
        attr_mask: AttrMask,
    ) -> CacheResult<PopulateOutcome> {
        let sort_supported = self
            .fsal
            .features()
            .contains(FsalFeatures::COMPUTE_READDIR_COOKIE);
        let whence_is_name = self
            .fsal
            .features()
            .contains(FsalFeatures::WHENCE_IS_NAME);

        // Owned continuation name; `Whence` borrows it.
        let mut whence_name = String::new();
        let (prev_chunk, from_start) = match &continuation {
            Continuation::FromStart => (None, true),
            Continuation::Cookie(_) => (None, false),
            Continuation::AfterChunk(cid) => (Some(*cid), false),
        };
        let whence = match &continuation {
            Continuation::FromStart => Whence::Start,
            Continuation::Cookie(ck) => Whence::Cookie(*ck),
            Continuation::AfterChunk(cid) => {
                let last = match dir.chunk(*cid).dirents.back() {
                    Some(&last) => last,
                    None => return Err(CacheError::ServerFault("continuation from empty chunk")),
                };
                if whence_is_name {
                    whence_name = dir.dirent(last).name.to_string();
                    Whence::Name(&whence_name)
                } else {
                    Whence::Cookie(dir.dirent(last).ck)
                }
            }
        };

        struct PopState {
            cur_chunk: ChunkId,
            chunks_made: usize,
            created: Vec<ChunkId>,
            added: usize,
            found: Option<DirentId>,
            first_new: Option<DirentId>,
            last_dirent: Option<DirentId>,
            stitched: bool,
            stitch_ck: u64,
        }
        let first = dir.alloc_chunk(prev_chunk, 0);
        let mut st = PopState {
            cur_chunk: first,
            chunks_made: 1,
            created: vec![first],
            added: 0,
            found: None,
            first_new: None,
            last_dirent: None,
            stitched: false,
            stitch_ck: 0,
        };

        let dir_chunk = self.config.dir_chunk;
        let readahead = self.config.readahead_chunks;
        let dir_max = self.config.dir_max;

        let result = self.fsal.readdir(
            ctx,
            &parent.sub_handle,
            whence,
            attr_mask,
            &mut |fd: FsalDirent<F::Handle>| {
                if fd.cookie < FIRST_VALID_COOKIE {
                    return Err(CacheError::ServerFault(
                        "sub-FSAL produced a reserved cookie",
                    ));
                }
                if dir.chunk(st.cur_chunk).num_entries() >= dir_chunk {
                    if st.chunks_made >= readahead {
                        return Ok(ReaddirControl::Stop);
                    }
                    let next = dir.alloc_chunk(Some(st.cur_chunk), 0);
                    dir.chunk_mut(st.cur_chunk).next_ck = fd.cookie;
                    st.cur_chunk = next;
                    st.chunks_made += 1;
                    st.created.push(next);
                }
                let child =
                    self.new_entry(ctx, fd.handle, fd.attrs, AttrMask::BASIC, None)?;
                let ckey = child.key().clone();
                drop(child);

                let mut id = dir.alloc_dirent(&fd.name, ckey, 0);
                match dir.insert_name(id) {
                    Err(err) => {
                        // Probe burst; drop the dirent and keep going.
                        debug!("dropping dirent {:?}: {}", fd.name, err);
                        dir.free_slot(id);
                        return Ok(ReaddirControl::Continue);
                    }
                    Ok(crate::dirent::NameInsert::Exists(prior)) => {
                        dir.free_slot(id);
                        match dir.dirent(prior).chunk {
                            Some(prior_chunk) if prior_chunk != st.cur_chunk => {
                                // The stream caught up with an already
                                // cached chunk; stitch and stop.
                                let prior_ck = dir.dirent(prior).ck;
                                dir.chunk_mut(st.cur_chunk).next_ck = prior_ck;
                                st.stitched = true;
                                st.stitch_ck = prior_ck;
                                if from_start && st.first_new.is_none() && dir.first_ck == 0 {
                                    // The directory starts inside an
                                    // already cached chunk.
                                    dir.first_ck = prior_ck;
                                }
                                if target_ck != 0 && prior_ck == target_ck {
                                    st.found = Some(prior);
                                }
                                return Ok(ReaddirControl::Stop);
                            }
                            Some(_) => {
                                // Duplicate within the chunk being built.
                                return Ok(ReaddirControl::Continue);
                            }
                            None => {
                                // Known by name but detached; give it the
                                // stream cookie and a chunk seat.
                                dir.detached.pop(&prior);
                                dir.set_cookie(prior, fd.cookie);
                                id = prior;
                            }
                        }
                    }
                    Ok(crate::dirent::NameInsert::Inserted) => {
                        dir.set_cookie(id, fd.cookie);
                    }
                }
                dir.chunk_mut(st.cur_chunk).dirents.push_back(id);
                dir.dirent_mut(id).chunk = Some(st.cur_chunk);
                if sort_supported {
                    dir.by_sort.insert(fd.cookie, id);
                    dir.dirent_mut(id).flags.insert(DirentFlags::SORTED);
                }
                if st.first_new.is_none() {
                    st.first_new = Some(id);
                    if let Some(prev) = prev_chunk {
                        dir.chunk_mut(prev).next_ck = fd.cookie;
                    }
                    if from_start && dir.first_ck == 0 {
                        dir.first_ck = fd.cookie;
                    }
                }
                if target_ck != 0 && fd.cookie == target_ck {
                    st.found = Some(id);
                }
                st.last_dirent = Some(id);
                st.added += 1;
                if dir.named_count() > dir_max {
                    parent.flags.set(EntryFlags::BYPASS_DIRCACHE);
                    return Err(CacheError::Overflow);
                }
                Ok(ReaddirControl::Continue)
            },
        );

        // Trim an empty trailing chunk regardless of how the pass ended.
        if dir.chunk(st.cur_chunk).num_entries() == 0 {
            let carried_next = dir.chunk(st.cur_chunk).next_ck;
            let prev = dir.chunk(st.cur_chunk).prev_chunk;
            if let Some(prev) = prev {
                if carried_next != 0 {
                    dir.chunk_mut(prev).next_ck = carried_next;
                }
            }
            dir.free_chunk(st.cur_chunk);
            st.created.retain(|&c| c != st.cur_chunk);
        }
        for &cid in &st.created {
            self.pool.record_chunk(parent, cid);
        }
        let eod = result?;

        if eod {
            if let Some(last) = st.last_dirent {
                dir.dirent_mut(last).eod = true;
            } else if let Some(prev) = prev_chunk {
                // Nothing follows the continuation chunk.
                if let Some(&last) = dir.chunk(prev).dirents.back() {
                    dir.dirent_mut(last).eod = true;
                }
            }
            if from_start {
                parent.flags.set(EntryFlags::DIR_POPULATED);
            }
        }
        self.maybe_reclaim_chunks(parent);

        trace!(
            "populated {} dirents in {} chunks (eod {})",
            st.added,
            st.created.len(),
            eod
        );
        Ok(PopulateOutcome {
            found: st.found,
            first_new: st.first_new,
            added: st.added,
            eod,
            stitched: st.stitched,
            stitch_ck: st.stitch_ck,
        })
    }
}
