//! The metadata cache and its handle operations.
//!
//! [`MetadataCache`] wraps each protocol-level operation with lock
//! acquisition, sub-FSAL delegation and cache maintenance. Control flow
//! alternates between fast paths under read locks and slow paths that
//! upgrade to write locks, consult the sub-FSAL, and install the result.

use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use log::{debug, trace, warn};
use parking_lot::MappedRwLockWriteGuard;

use crate::attr::{AccessMask, AttrMask, FileAttr, SetAttrs};
use crate::chunk::{add_detached, place_new_dirent, Placement};
use crate::config::CacheConfig;
use crate::dirent::{DirState, NameInsert};
use crate::entry::{CacheEntry, EntryContent, EntryFlags, EntryRef};
use crate::errors::{CacheError, CacheResult};
use crate::export::{Export, ExportId, ExportRegistry};
use crate::fsal::{LockRequest, OpenFlags, SubFsal};
use crate::key::CacheKey;
use crate::lru::{CacheStats, LruPool};
use crate::op_context::OpContext;
use crate::table::{CacheTable, LatchMode};
use crate::FileType;

/// How often a creation race is retried before giving up.
const NEW_ENTRY_RETRIES: usize = 4;

/// The metadata cache.
///
/// Generic over the sub-FSAL it stacks on. Entries are handed out as
/// [`EntryRef`]s; cloning one takes a reference, dropping releases it.
pub struct MetadataCache<F: SubFsal> {
    pub(crate) fsal: F,
    pub(crate) config: CacheConfig,
    pub(crate) table: CacheTable<F>,
    pub(crate) pool: LruPool<F>,
    pub(crate) registry: ExportRegistry<F>,
}

impl<F: SubFsal> std::fmt::Debug for MetadataCache<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataCache")
            .field("entries", &self.table.len())
            .field("config", &self.config)
            .finish()
    }
}

/// Holds a directory's in-flight create count up while a creation is
/// between the sub-FSAL call and the dirent install.
struct IcreateGuard<'a, F: SubFsal>(&'a CacheEntry<F>);

impl<F: SubFsal> Drop for IcreateGuard<'_, F> {
    fn drop(&mut self) {
        if let Ok(mut dir) = self.0.dir_write() {
            dir.icreate_refcnt = dir.icreate_refcnt.saturating_sub(1);
        }
    }
}

impl<F: SubFsal> MetadataCache<F> {
    /// Create a cache over a sub-FSAL.
    ///
    /// # Errors
    /// Fails when the configuration does not validate.
    pub fn new(fsal: F, config: CacheConfig) -> io::Result<Self> {
        config.validate()?;
        let table = CacheTable::new(config.shard_count());
        Ok(MetadataCache {
            fsal,
            config,
            table,
            pool: LruPool::new(),
            registry: ExportRegistry::new(),
        })
    }

    /// The wrapped sub-FSAL.
    pub fn fsal(&self) -> &F {
        &self.fsal
    }

    /// The active configuration.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Aggregate counters.
    pub fn stats(&self) -> CacheStats {
        self.pool.stats.snapshot()
    }

    /// Number of entries currently published.
    pub fn num_entries(&self) -> usize {
        self.table.len()
    }

    // ---- exports -------------------------------------------------------

    /// Register an export.
    ///
    /// # Errors
    /// [`CacheError::Exist`] when the id is already registered.
    pub fn add_export(&self, id: ExportId) -> CacheResult<Arc<Export>> {
        self.registry.add(id)
    }

    /// Remove an export: set the barrier flag, unlink every mapping
    /// record, and kill entries that lose their last mapping.
    pub fn unexport(&self, export: &Arc<Export>) {
        export.begin_unexport();
        let Some(map) = self.registry.remove(export.id()) else {
            return;
        };
        let snapshot: Vec<_> = map.entries.lock().drain().collect();
        debug!("unexporting {} with {} entries", export.id(), snapshot.len());
        let mut doomed = Vec::new();
        for (_, weak) in snapshot {
            let Some(entry) = weak.upgrade() else { continue };
            let orphaned = {
                let mut cell = entry.attrs.write();
                cell.exports.retain(|e| *e != export.id());
                let raw = export.id().0 as i32;
                if entry.first_export_id.load(Ordering::Acquire) == raw {
                    let next = cell.exports.first().map(|e| e.0 as i32).unwrap_or(-1);
                    entry.first_export_id.store(next, Ordering::Release);
                }
                cell.exports.is_empty()
            };
            if orphaned {
                doomed.push(entry);
            }
        }
        for entry in doomed {
            self.kill_entry(&entry);
        }
    }

    /// Verify the context's export is attached to the entry, attaching
    /// it when the check races with a first access through this export.
    pub fn check_mapping(&self, ctx: &OpContext, entry: &EntryRef<F>) -> CacheResult<()> {
        if ctx.export.is_unexporting() {
            return Err(CacheError::Stale);
        }
        let raw = ctx.export.id().0 as i32;
        if entry.first_export_id.load(Ordering::Acquire) == raw {
            return Ok(());
        }
        {
            let cell = entry.attrs.read();
            if cell.exports.contains(&ctx.export.id()) {
                return Ok(());
            }
        }
        self.attach_export(ctx, entry)
    }

    /// Append a mapping record on both sides. The attribute write lock
    /// is taken before the export's mapping lock.
    fn attach_export(&self, ctx: &OpContext, entry: &EntryRef<F>) -> CacheResult<()> {
        let id = ctx.export.id();
        let mut cell = entry.attrs.write();
        if ctx.export.is_unexporting() {
            return Err(CacheError::Stale);
        }
        if !cell.exports.contains(&id) {
            let Some(map) = self.registry.map_of(id) else {
                return Err(CacheError::Stale);
            };
            let mut entries = map.entries.lock();
            if ctx.export.is_unexporting() {
                return Err(CacheError::Stale);
            }
            entries.insert(entry.key().clone(), Arc::downgrade(entry));
            drop(entries);
            cell.exports.push(id);
        }
        drop(cell);
        let _ = entry.first_export_id.compare_exchange(
            -1,
            id.0 as i32,
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
        Ok(())
    }

    // ---- entry lifecycle ----------------------------------------------

    /// Create or resolve the cache entry for a sub-FSAL handle.
    ///
    /// Returns an initially referenced entry; the caller owns releasing
    /// the reference. A duplicate handle for an already cached object is
    /// merged into the cached one and released.
    pub(crate) fn new_entry(
        &self,
        ctx: &OpContext,
        sub_handle: F::Handle,
        attrs: FileAttr,
        valid: AttrMask,
        state: Option<F::State>,
    ) -> CacheResult<EntryRef<F>> {
        if ctx.export.is_unexporting() {
            return Err(CacheError::Stale);
        }
        let key_bytes = self.fsal.handle_to_key(&sub_handle)?;
        let key = CacheKey::new(self.fsal.fsal_id(), key_bytes)?;

        let mut sub_handle = Some(sub_handle);
        let mut state = state;

        for _ in 0..NEW_ENTRY_RETRIES {
            self.pool.stats.mapping();
            let (hit, latch) = self.table.get_latched(&key, LatchMode::Read);
            drop(latch);
            if let Some(existing) = hit {
                if !valid.is_empty() && existing.kind() != attrs.kind {
                    // The object behind the key changed type; the cached
                    // entry is dead weight.
                    debug!("type changed under {:?}, killing stale entry", key);
                    self.kill_entry(&existing);
                    continue;
                }
                existing.flags.clear(EntryFlags::UNREACHABLE);
                self.pool.stats.hit();
                self.pool.touch(&existing);
                if let Some(handle) = sub_handle.take() {
                    self.fsal.merge(&existing.sub_handle, handle)?;
                }
                if let Some(st) = state.take() {
                    let mut slot = existing.open_state.lock();
                    if slot.is_none() {
                        *slot = Some(st);
                    }
                }
                self.check_mapping(ctx, &existing)?;
                if !valid.is_empty() {
                    let mut cell = existing.attrs.write();
                    let prior_acl = cell.attrs.acl.take();
                    cell.attrs = attrs.clone();
                    if cell.attrs.acl.is_none() {
                        cell.attrs.acl = prior_acl;
                    }
                    cell.valid = valid | (cell.valid & AttrMask::ACL);
                    cell.fetched_at = Some(Instant::now());
                    existing.flags.set(EntryFlags::TRUST_ATTRS);
                }
                return existing.try_ref();
            }

            let Some(handle) = sub_handle.take() else {
                return Err(CacheError::Stale);
            };
            let entry = Arc::new(CacheEntry::new(
                key.clone(),
                attrs.clone(),
                valid,
                handle,
                state.take(),
            ));
            let (raced, latch) = self.table.get_latched(&key, LatchMode::Write);
            if raced.is_some() {
                drop(latch);
                self.pool.stats.conflict();
                // Reclaim the handle and state from the losing entry and
                // retry against the winner.
                match Arc::try_unwrap(entry) {
                    Ok(fresh) => {
                        let CacheEntry {
                            sub_handle: h,
                            open_state,
                            ..
                        } = fresh;
                        sub_handle = Some(h);
                        state = open_state.into_inner();
                    }
                    Err(_) => return Err(CacheError::ServerFault("unpublished entry escaped")),
                }
                continue;
            }
            self.table.insert_latched(entry.clone(), latch)?;
            self.pool.stats.added();
            self.pool.insert_entry(&entry);
            if let Err(err) = self.attach_export(ctx, &entry) {
                // Unexport raced us; take the publish back.
                entry.flags.set(EntryFlags::UNREACHABLE);
                self.table.remove_checked(&entry);
                return Err(err);
            }
            self.maybe_reclaim_entries();
            return Ok(entry);
        }
        Err(CacheError::Stale)
    }

    /// Resolve a cache key to its entry.
    ///
    /// # Errors
    /// [`CacheError::NoEnt`] when the key is not cached,
    /// [`CacheError::Stale`] when the entry was killed.
    pub fn find_keyed(&self, key: &CacheKey) -> CacheResult<EntryRef<F>> {
        self.pool.stats.mapping();
        match self.table.get(key) {
            Some(entry) => {
                let entry = entry.try_ref()?;
                self.pool.stats.hit();
                self.pool.touch(&entry);
                Ok(entry)
            }
            None => Err(CacheError::NoEnt),
        }
    }

    /// Rebuild an entry from a wire handle, consulting the sub-FSAL.
    pub fn create_handle(&self, ctx: &OpContext, wire: &[u8]) -> CacheResult<EntryRef<F>> {
        let (handle, attrs) = self.fsal.create_handle(ctx, wire)?;
        self.new_entry(ctx, handle, attrs, AttrMask::BASIC, None)
    }

    /// Normalize raw client bytes into a cache key.
    pub fn host_to_key(&self, raw: &[u8]) -> CacheResult<CacheKey> {
        let bytes = self.fsal.host_to_key(raw)?;
        CacheKey::new(self.fsal.fsal_id(), bytes)
    }

    /// Take an additional reference for handing to a caller.
    pub fn get_ref(&self, entry: &EntryRef<F>) -> CacheResult<EntryRef<F>> {
        let entry = entry.try_ref()?;
        self.pool.touch(&entry);
        Ok(entry)
    }

    /// Release a reference.
    pub fn put_ref(&self, entry: EntryRef<F>) {
        drop(entry);
    }

    /// Mark an entry unreachable and remove it from the table. Future
    /// lookups re-resolve through the sub-FSAL.
    pub fn kill_entry(&self, entry: &EntryRef<F>) {
        let before = entry.flags.set(EntryFlags::UNREACHABLE);
        if before.contains(EntryFlags::UNREACHABLE) {
            return;
        }
        trace!("killing entry {:?}", entry.key());
        self.clean_entry(entry);
        self.table.remove_checked(entry);
    }

    /// Detach an entry from exports and drop its cached content.
    fn clean_entry(&self, entry: &EntryRef<F>) {
        {
            let mut cell = entry.attrs.write();
            for id in cell.exports.drain(..) {
                if let Some(map) = self.registry.map_of(id) {
                    map.entries.lock().remove(entry.key());
                }
            }
        }
        entry.first_export_id.store(-1, Ordering::Release);
        entry.flags.clear(
            EntryFlags::TRUST_ATTRS
                | EntryFlags::TRUST_CONTENT
                | EntryFlags::TRUST_DIR_CHUNKS
                | EntryFlags::DIR_POPULATED,
        );
        if entry.is_dir() {
            if let Ok(mut dir) = entry.dir_write() {
                for cid in dir.chunk_ids() {
                    self.pool.forget_chunk(entry.addr(), cid);
                }
                dir.invalidate_all();
                dir.parent_wire = None;
            }
        }
    }

    /// Non-blocking variant for the eviction path: fails instead of
    /// waiting on a lock an operation might hold.
    fn try_clean_entry(&self, entry: &EntryRef<F>) -> bool {
        let Some(mut cell) = entry.attrs.try_write() else {
            return false;
        };
        let dir_guard = if entry.is_dir() {
            match entry.try_dir_write() {
                Ok(Some(guard)) => Some(guard),
                _ => return false,
            }
        } else {
            None
        };
        for id in cell.exports.drain(..) {
            if let Some(map) = self.registry.map_of(id) {
                map.entries.lock().remove(entry.key());
            }
        }
        drop(cell);
        entry.first_export_id.store(-1, Ordering::Release);
        entry.flags.clear(
            EntryFlags::TRUST_ATTRS
                | EntryFlags::TRUST_CONTENT
                | EntryFlags::TRUST_DIR_CHUNKS
                | EntryFlags::DIR_POPULATED,
        );
        if let Some(mut dir) = dir_guard {
            for cid in dir.chunk_ids() {
                self.pool.forget_chunk(entry.addr(), cid);
            }
            dir.invalidate_all();
            dir.parent_wire = None;
        }
        true
    }

    /// Evict cold entries while the table is over its high water mark.
    fn maybe_reclaim_entries(&self) {
        while self.table.len() > self.config.entries_hiwat {
            let Some(victim) = self.pool.pick_victim() else {
                return;
            };
            let before = victim.flags.set(EntryFlags::UNREACHABLE);
            if before.contains(EntryFlags::UNREACHABLE) {
                continue;
            }
            if self.try_clean_entry(&victim) {
                trace!("evicting entry {:?}", victim.key());
                self.table.remove_checked(&victim);
            } else {
                victim.flags.clear(EntryFlags::UNREACHABLE);
                self.pool.requeue(&victim);
                return;
            }
        }
    }

    /// Reclaim cold chunks while over the chunk high water mark. The
    /// directory named by `skip` is exempt because the caller holds its
    /// content lock.
    pub(crate) fn maybe_reclaim_chunks(&self, skip: &EntryRef<F>) {
        while self.pool.chunk_count() > self.config.chunks_hiwat {
            let Some((parent, cid)) = self.pool.pop_chunk_victim(skip.addr()) else {
                return;
            };
            match parent.try_dir_write() {
                Ok(Some(mut dir)) => {
                    if dir.has_chunk(cid) {
                        trace!("reclaiming chunk {} of {:?}", cid, parent.key());
                        dir.clean_chunk(cid);
                        parent.flags.clear(EntryFlags::DIR_POPULATED);
                    }
                }
                _ => {
                    // Contended; put the chunk back and stop for now.
                    self.pool.record_chunk(&parent, cid);
                    return;
                }
            }
        }
    }

    // ---- attributes ----------------------------------------------------

    /// Fetch attributes, from cache while they are trusted and fresh.
    pub fn getattrs(
        &self,
        ctx: &OpContext,
        entry: &EntryRef<F>,
        mask: AttrMask,
    ) -> CacheResult<FileAttr> {
        self.check_mapping(ctx, entry)?;
        if entry.attrs_valid(mask, self.config.attr_expire) {
            self.pool.touch(entry);
            return Ok(entry.attrs.read().attrs.clone());
        }
        self.refresh_attrs(ctx, entry, mask.contains(AttrMask::ACL), true)?;
        Ok(entry.attrs.read().attrs.clone())
    }

    /// Refetch attributes from the sub-FSAL and replace the cached set.
    ///
    /// For directories, when `invalidate_dir` is set and the new mtime
    /// is greater than the cached one, the dirent cache is dropped
    /// (unless a create is in flight).
    pub fn refresh_attrs(
        &self,
        ctx: &OpContext,
        entry: &EntryRef<F>,
        need_acl: bool,
        invalidate_dir: bool,
    ) -> CacheResult<()> {
        let mask = if need_acl {
            AttrMask::BASIC | AttrMask::ACL
        } else {
            AttrMask::BASIC
        };
        let fresh = match self.fsal.getattrs(ctx, &entry.sub_handle, mask) {
            Ok(attrs) => attrs,
            Err(CacheError::Stale) => {
                self.kill_entry(entry);
                return Err(CacheError::Stale);
            }
            Err(err) => return Err(err),
        };

        let mut cell = entry.attrs.write();
        let old_mtime = cell.attrs.mtime;
        let prior_acl = cell.attrs.acl.take();
        let had_acl = cell.valid.contains(AttrMask::ACL);
        cell.attrs = fresh;
        let mut valid = mask;
        if !need_acl && cell.attrs.acl.is_none() {
            // Pass the previous ACL reference through untouched.
            cell.attrs.acl = prior_acl;
            if had_acl {
                valid |= AttrMask::ACL;
            }
        }
        cell.valid = valid;
        cell.fetched_at = Some(Instant::now());
        entry.flags.set(EntryFlags::TRUST_ATTRS);

        let mtime_advanced = cell.attrs.mtime > old_mtime;
        if invalidate_dir && entry.is_dir() && mtime_advanced {
            // Attribute lock held; content comes after it in the order.
            let mut dir = entry.dir_write()?;
            if dir.icreate_refcnt == 0 {
                debug!("mtime advanced on {:?}, dropping dirent cache", entry.key());
                for cid in dir.chunk_ids() {
                    self.pool.forget_chunk(entry.addr(), cid);
                }
                dir.invalidate_all();
                entry.flags.clear(
                    EntryFlags::TRUST_CONTENT
                        | EntryFlags::TRUST_DIR_CHUNKS
                        | EntryFlags::DIR_POPULATED,
                );
            }
        }
        Ok(())
    }

    /// Apply attribute changes through the sub-FSAL.
    pub fn setattrs(
        &self,
        ctx: &OpContext,
        entry: &EntryRef<F>,
        changes: &SetAttrs,
    ) -> CacheResult<()> {
        self.check_mapping(ctx, entry)?;
        if changes.is_empty() {
            return Ok(());
        }
        {
            let state = entry.open_state.lock();
            self.fsal
                .setattrs(ctx, &entry.sub_handle, changes, state.as_ref())?;
        }
        entry.flags.clear(EntryFlags::TRUST_ATTRS);
        self.refresh_attrs(ctx, entry, false, false)
    }

    /// Check whether the context's credentials grant `access`, using
    /// cached mode bits when they are trusted.
    pub fn test_access(
        &self,
        ctx: &OpContext,
        entry: &EntryRef<F>,
        access: AccessMask,
    ) -> CacheResult<bool> {
        let attrs = self.getattrs(
            ctx,
            entry,
            AttrMask::OWNER | AttrMask::GROUP | AttrMask::MODE,
        )?;
        let creds = &ctx.creds;
        if creds.uid == 0 {
            // Root bypasses permission bits, except execute on a file
            // with no execute bit at all.
            if access.contains(AccessMask::EXECUTE)
                && entry.kind() == FileType::RegularFile
                && attrs.mode & 0o111 == 0
            {
                return Ok(false);
            }
            return Ok(true);
        }
        let triad = if creds.uid == attrs.owner {
            (attrs.mode >> 6) & 0o7
        } else if creds.in_group(attrs.group) {
            (attrs.mode >> 3) & 0o7
        } else {
            attrs.mode & 0o7
        };
        let need = access.bits();
        Ok(triad & need == need)
    }

    // ---- namespace operations -----------------------------------------

    /// Resolve a name in a directory.
    pub fn lookup(
        &self,
        ctx: &OpContext,
        parent: &EntryRef<F>,
        name: &str,
    ) -> CacheResult<EntryRef<F>> {
        self.check_mapping(ctx, parent)?;
        if name.is_empty() || name == "." || name == ".." {
            return Err(CacheError::Inval("unresolvable name"));
        }

        // Fast path: trusted name tree under the content read lock.
        {
            let dir = parent.dir_read()?;
            let flags = parent.entry_flags();
            if !flags.contains(EntryFlags::BYPASS_DIRCACHE)
                && flags.contains(EntryFlags::TRUST_CONTENT)
            {
                if let Some(id) = dir.lookup_name(name) {
                    let ckey = dir.dirent(id).ckey.clone();
                    drop(dir);
                    match self.find_keyed(&ckey) {
                        Ok(child) => {
                            if child.attrs_valid(AttrMask::BASIC, self.config.attr_expire)
                                || self.refresh_attrs(ctx, &child, false, true).is_ok()
                            {
                                return Ok(child);
                            }
                            // A stale hit promotes to an uncached lookup.
                        }
                        Err(_) => {
                            // The child was evicted or killed; fall back
                            // to an uncached lookup.
                        }
                    }
                } else if flags.contains(EntryFlags::DIR_POPULATED) {
                    return Err(CacheError::NoEnt);
                }
            }
        }

        // Slow path: consult the sub-FSAL and install the result.
        let (handle, attrs) = match self.fsal.lookup(ctx, &parent.sub_handle, name) {
            Ok(found) => found,
            Err(CacheError::Stale) => {
                self.kill_entry(parent);
                return Err(CacheError::Stale);
            }
            Err(err) => return Err(err),
        };
        let child = self.new_entry(ctx, handle, attrs, AttrMask::BASIC, None)?;
        if !parent.flags.contains(EntryFlags::BYPASS_DIRCACHE) {
            let mut dir = parent.dir_write()?;
            self.retrust_dir(parent, &mut dir);
            if let Err(err) = self.dirent_add_locked(parent, &mut dir, name, child.key().clone()) {
                debug!("dirent install for {:?} failed: {}", name, err);
            }
        }
        Ok(child)
    }

    /// Create and open a regular file.
    pub fn create(
        &self,
        ctx: &OpContext,
        parent: &EntryRef<F>,
        name: &str,
        attrs: &SetAttrs,
    ) -> CacheResult<EntryRef<F>> {
        self.check_mapping(ctx, parent)?;
        let icreate = self.begin_icreate(parent)?;
        let (handle, fattrs, state) = self.fsal.create(ctx, &parent.sub_handle, name, attrs)?;
        let child = self.new_entry(ctx, handle, fattrs, AttrMask::BASIC, state)?;
        self.install_created(ctx, parent, name, &child);
        drop(icreate);
        Ok(child)
    }

    /// Create a directory.
    pub fn mkdir(
        &self,
        ctx: &OpContext,
        parent: &EntryRef<F>,
        name: &str,
        attrs: &SetAttrs,
    ) -> CacheResult<EntryRef<F>> {
        self.check_mapping(ctx, parent)?;
        let icreate = self.begin_icreate(parent)?;
        let (handle, fattrs) = self.fsal.mkdir(ctx, &parent.sub_handle, name, attrs)?;
        let child = self.new_entry(ctx, handle, fattrs, AttrMask::BASIC, None)?;
        if let Ok(wire) = self.fsal.handle_to_wire(&parent.sub_handle) {
            if let Ok(mut dir) = child.dir_write() {
                dir.parent_wire = Some(wire.into_boxed_slice());
            }
        }
        self.install_created(ctx, parent, name, &child);
        drop(icreate);
        Ok(child)
    }

    /// Create a special node.
    pub fn mknode(
        &self,
        ctx: &OpContext,
        parent: &EntryRef<F>,
        name: &str,
        kind: FileType,
        rawdev: u64,
        attrs: &SetAttrs,
    ) -> CacheResult<EntryRef<F>> {
        self.check_mapping(ctx, parent)?;
        if matches!(kind, FileType::Directory | FileType::RegularFile | FileType::Symlink) {
            return Err(CacheError::Inval("mknode requires a special node type"));
        }
        let icreate = self.begin_icreate(parent)?;
        let (handle, fattrs) = self
            .fsal
            .mknode(ctx, &parent.sub_handle, name, kind, rawdev, attrs)?;
        let child = self.new_entry(ctx, handle, fattrs, AttrMask::BASIC, None)?;
        self.install_created(ctx, parent, name, &child);
        drop(icreate);
        Ok(child)
    }

    /// Create a symbolic link; the target is cached alongside.
    pub fn symlink(
        &self,
        ctx: &OpContext,
        parent: &EntryRef<F>,
        name: &str,
        target: &str,
        attrs: &SetAttrs,
    ) -> CacheResult<EntryRef<F>> {
        self.check_mapping(ctx, parent)?;
        let icreate = self.begin_icreate(parent)?;
        let (handle, fattrs) = self
            .fsal
            .symlink(ctx, &parent.sub_handle, name, target, attrs)?;
        let child = self.new_entry(ctx, handle, fattrs, AttrMask::BASIC, None)?;
        {
            let mut content = child.content.write();
            if let EntryContent::Symlink { target: cached } = &mut *content {
                *cached = Some(target.to_owned());
            }
        }
        self.install_created(ctx, parent, name, &child);
        drop(icreate);
        Ok(child)
    }

    /// Read a symlink target, from cache when present.
    pub fn readlink(&self, ctx: &OpContext, entry: &EntryRef<F>) -> CacheResult<String> {
        self.check_mapping(ctx, entry)?;
        if entry.kind() != FileType::Symlink {
            return Err(CacheError::Inval("not a symlink"));
        }
        {
            let content = entry.content.read();
            if let EntryContent::Symlink {
                target: Some(target),
            } = &*content
            {
                if entry.flags.contains(EntryFlags::TRUST_ATTRS) {
                    return Ok(target.clone());
                }
            }
        }
        let target = self.fsal.readlink(ctx, &entry.sub_handle)?;
        {
            let mut content = entry.content.write();
            if let EntryContent::Symlink { target: cached } = &mut *content {
                *cached = Some(target.clone());
            }
        }
        Ok(target)
    }

    /// Add a hard link to an existing object.
    pub fn link(
        &self,
        ctx: &OpContext,
        obj: &EntryRef<F>,
        dir: &EntryRef<F>,
        name: &str,
    ) -> CacheResult<()> {
        self.check_mapping(ctx, dir)?;
        self.check_mapping(ctx, obj)?;
        self.fsal.link(ctx, &obj.sub_handle, &dir.sub_handle, name)?;
        obj.flags.clear(EntryFlags::TRUST_ATTRS);
        self.install_created(ctx, dir, name, obj);
        Ok(())
    }

    /// Remove a name, and kill the object's entry.
    pub fn unlink(
        &self,
        ctx: &OpContext,
        parent: &EntryRef<F>,
        name: &str,
        obj: &EntryRef<F>,
    ) -> CacheResult<()> {
        self.check_mapping(ctx, parent)?;
        match self.fsal.unlink(ctx, &parent.sub_handle, name, &obj.sub_handle) {
            Ok(()) => {}
            Err(CacheError::NotEmpty) => {
                // The target still has entries our cache did not know
                // about; its dirent cache is not to be trusted.
                if obj.is_dir() {
                    let _ = self.invalidate_dirent_cache(obj);
                }
                return Err(CacheError::NotEmpty);
            }
            Err(CacheError::Stale) => {
                self.kill_entry(parent);
                return Err(CacheError::Stale);
            }
            Err(err) => return Err(err),
        }
        {
            let mut dir = parent.dir_write()?;
            if let Some(id) = dir.lookup_name(name) {
                dir.mark_deleted(id);
            }
        }
        parent.flags.clear(EntryFlags::TRUST_ATTRS);
        obj.flags.clear(EntryFlags::TRUST_ATTRS);
        self.kill_entry(obj);
        Ok(())
    }

    /// Rename an object.
    pub fn rename(
        &self,
        ctx: &OpContext,
        obj: &EntryRef<F>,
        old_dir: &EntryRef<F>,
        old_name: &str,
        new_dir: &EntryRef<F>,
        new_name: &str,
    ) -> CacheResult<()> {
        self.check_mapping(ctx, old_dir)?;
        self.check_mapping(ctx, new_dir)?;
        let same_dir = Arc::ptr_eq(old_dir, new_dir);
        let rename_changes_key = self
            .fsal
            .features()
            .contains(crate::fsal::FsalFeatures::RENAME_CHANGES_KEY);
        let mut kill_obj = false;
        {
            let (mut old_guard, mut new_guard) = self.lock_two_dirs(old_dir, new_dir)?;
            {
                let dest_state: &DirState = new_guard.as_deref().unwrap_or(&*old_guard);
                if let Some(dest) = dest_state.lookup_name(new_name) {
                    if dest_state.dirent(dest).ckey == *obj.key() {
                        // Renaming an object onto itself is a no-op.
                        return Ok(());
                    }
                }
            }
            self.fsal.rename(
                ctx,
                &obj.sub_handle,
                &old_dir.sub_handle,
                old_name,
                &new_dir.sub_handle,
                new_name,
            )?;
            old_dir.flags.clear(EntryFlags::TRUST_ATTRS);
            new_dir.flags.clear(EntryFlags::TRUST_ATTRS);
            obj.flags.clear(EntryFlags::TRUST_ATTRS);

            if rename_changes_key {
                // The renamed object's cached handle is now useless, and
                // both directories' dirent caches name it.
                for cid in old_guard.chunk_ids() {
                    self.pool.forget_chunk(old_dir.addr(), cid);
                }
                old_guard.invalidate_all();
                old_dir.flags.clear(
                    EntryFlags::TRUST_CONTENT
                        | EntryFlags::TRUST_DIR_CHUNKS
                        | EntryFlags::DIR_POPULATED,
                );
                if let Some(new_state) = new_guard.as_mut() {
                    for cid in new_state.chunk_ids() {
                        self.pool.forget_chunk(new_dir.addr(), cid);
                    }
                    new_state.invalidate_all();
                    new_dir.flags.clear(
                        EntryFlags::TRUST_CONTENT
                            | EntryFlags::TRUST_DIR_CHUNKS
                            | EntryFlags::DIR_POPULATED,
                    );
                }
                kill_obj = true;
            } else if same_dir && !self.config.chunking_enabled() {
                // Legacy mode: rename in place in the name tree.
                if let Some(dest) = old_guard.lookup_name(new_name) {
                    old_guard.mark_deleted(dest);
                }
                if let Some(src) = old_guard.lookup_name(old_name) {
                    old_guard.remove_name(src);
                    old_guard.dirent_mut(src).name = new_name.into();
                    match old_guard.insert_name(src) {
                        Ok(NameInsert::Inserted) => {}
                        _ => old_guard.remove_dirent(src),
                    }
                }
            } else {
                match new_guard.as_mut() {
                    None => {
                        if let Some(src) = old_guard.lookup_name(old_name) {
                            old_guard.mark_deleted(src);
                        }
                        if let Some(dest) = old_guard.lookup_name(new_name) {
                            old_guard.mark_deleted(dest);
                        }
                        if let Err(err) = self.dirent_add_locked(
                            new_dir,
                            &mut old_guard,
                            new_name,
                            obj.key().clone(),
                        ) {
                            debug!("rename dirent install failed: {}", err);
                        }
                    }
                    Some(new_state) => {
                        if let Some(src) = old_guard.lookup_name(old_name) {
                            old_guard.mark_deleted(src);
                        }
                        if let Some(dest) = new_state.lookup_name(new_name) {
                            new_state.mark_deleted(dest);
                        }
                        if let Err(err) = self.dirent_add_locked(
                            new_dir,
                            new_state,
                            new_name,
                            obj.key().clone(),
                        ) {
                            debug!("rename dirent install failed: {}", err);
                        }
                    }
                }
            }
        }
        if kill_obj {
            self.kill_entry(obj);
        }
        Ok(())
    }

    // ---- pass-through I/O ---------------------------------------------

    /// Open an object; the sub-FSAL's open state is stored on the entry.
    pub fn open(&self, ctx: &OpContext, entry: &EntryRef<F>, flags: OpenFlags) -> CacheResult<()> {
        self.check_mapping(ctx, entry)?;
        let state = self.fsal.open(ctx, &entry.sub_handle, flags)?;
        let mut slot = entry.open_state.lock();
        if slot.is_some() {
            drop(slot);
            return Err(CacheError::Exist);
        }
        *slot = Some(state);
        if flags.contains(OpenFlags::TRUNCATE) {
            entry.flags.clear(EntryFlags::TRUST_ATTRS);
        }
        Ok(())
    }

    /// Close the stored open state.
    pub fn close(&self, ctx: &OpContext, entry: &EntryRef<F>) -> CacheResult<()> {
        let state = entry.open_state.lock().take();
        match state {
            Some(state) => self.fsal.close(ctx, &entry.sub_handle, state),
            None => Err(CacheError::Inval("entry is not open")),
        }
    }

    /// Read file data.
    pub fn read(
        &self,
        ctx: &OpContext,
        entry: &EntryRef<F>,
        offset: u64,
        buf: &mut [u8],
    ) -> CacheResult<usize> {
        self.check_mapping(ctx, entry)?;
        let state = entry.open_state.lock();
        self.fsal
            .read(ctx, &entry.sub_handle, state.as_ref(), offset, buf)
    }

    /// Write file data; cached sizes and times become untrusted.
    pub fn write(
        &self,
        ctx: &OpContext,
        entry: &EntryRef<F>,
        offset: u64,
        data: &[u8],
    ) -> CacheResult<usize> {
        self.check_mapping(ctx, entry)?;
        let written = {
            let state = entry.open_state.lock();
            self.fsal
                .write(ctx, &entry.sub_handle, state.as_ref(), offset, data)?
        };
        entry.flags.clear(EntryFlags::TRUST_ATTRS);
        Ok(written)
    }

    /// Commit buffered writes.
    pub fn commit(
        &self,
        ctx: &OpContext,
        entry: &EntryRef<F>,
        offset: u64,
        length: u64,
    ) -> CacheResult<()> {
        self.check_mapping(ctx, entry)?;
        self.fsal.commit(ctx, &entry.sub_handle, offset, length)?;
        entry.flags.clear(EntryFlags::TRUST_ATTRS);
        Ok(())
    }

    /// Forward a byte-range lock operation.
    pub fn lock_op(
        &self,
        ctx: &OpContext,
        entry: &EntryRef<F>,
        request: &LockRequest,
    ) -> CacheResult<()> {
        self.check_mapping(ctx, entry)?;
        let state = entry.open_state.lock();
        self.fsal
            .lock_op(ctx, &entry.sub_handle, state.as_ref(), request)
    }

    /// Fetch an extended attribute.
    pub fn getxattr(
        &self,
        ctx: &OpContext,
        entry: &EntryRef<F>,
        name: &str,
    ) -> CacheResult<Vec<u8>> {
        self.check_mapping(ctx, entry)?;
        self.fsal.getxattr(ctx, &entry.sub_handle, name)
    }

    /// Set an extended attribute.
    pub fn setxattr(
        &self,
        ctx: &OpContext,
        entry: &EntryRef<F>,
        name: &str,
        value: &[u8],
    ) -> CacheResult<()> {
        self.check_mapping(ctx, entry)?;
        self.fsal.setxattr(ctx, &entry.sub_handle, name, value)?;
        entry.flags.clear(EntryFlags::TRUST_ATTRS);
        Ok(())
    }

    /// List extended attribute names.
    pub fn listxattrs(&self, ctx: &OpContext, entry: &EntryRef<F>) -> CacheResult<Vec<String>> {
        self.check_mapping(ctx, entry)?;
        self.fsal.listxattrs(ctx, &entry.sub_handle)
    }

    /// Remove an extended attribute.
    pub fn removexattr(
        &self,
        ctx: &OpContext,
        entry: &EntryRef<F>,
        name: &str,
    ) -> CacheResult<()> {
        self.check_mapping(ctx, entry)?;
        self.fsal.removexattr(ctx, &entry.sub_handle, name)?;
        entry.flags.clear(EntryFlags::TRUST_ATTRS);
        Ok(())
    }

    // ---- handle plumbing ----------------------------------------------

    /// Serialize an entry's handle for export to clients.
    pub fn handle_to_wire(&self, entry: &EntryRef<F>) -> CacheResult<Vec<u8>> {
        self.fsal.handle_to_wire(&entry.sub_handle)
    }

    /// The entry's portable cache key.
    pub fn handle_to_key(&self, entry: &EntryRef<F>) -> CacheKey {
        entry.key().clone()
    }

    /// Whether two entries name the same object.
    pub fn handle_cmp(&self, a: &EntryRef<F>, b: &EntryRef<F>) -> bool {
        a.key() == b.key()
    }

    /// Merge a duplicate entry for the same object into the original.
    pub fn merge(&self, orig: &EntryRef<F>, dup: EntryRef<F>) -> CacheResult<()> {
        if Arc::ptr_eq(orig, &dup) {
            return Ok(());
        }
        if orig.key() != dup.key() {
            return Err(CacheError::Inval("merge of distinct objects"));
        }
        if let Some(state) = dup.open_state.lock().take() {
            let mut slot = orig.open_state.lock();
            if slot.is_none() {
                *slot = Some(state);
            }
        }
        Ok(())
    }

    // ---- invalidation upcalls -----------------------------------------

    /// Server-driven invalidation: cached attributes are no longer
    /// authoritative.
    pub fn invalidate_attrs(&self, entry: &EntryRef<F>) {
        entry.flags.clear(EntryFlags::TRUST_ATTRS);
    }

    /// Server-driven invalidation: drop a directory's dirent cache.
    pub fn invalidate_dirent_cache(&self, entry: &EntryRef<F>) -> CacheResult<()> {
        let mut dir = entry.dir_write()?;
        for cid in dir.chunk_ids() {
            self.pool.forget_chunk(entry.addr(), cid);
        }
        dir.invalidate_all();
        entry.flags.clear(
            EntryFlags::TRUST_CONTENT
                | EntryFlags::TRUST_DIR_CHUNKS
                | EntryFlags::DIR_POPULATED
                | EntryFlags::BYPASS_DIRCACHE,
        );
        entry.flags.set(EntryFlags::TRUST_CONTENT | EntryFlags::TRUST_DIR_CHUNKS);
        Ok(())
    }

    /// Structural self-check of a directory's indexes, for tests.
    pub fn check_dir_invariants(&self, entry: &EntryRef<F>) -> Result<(), String> {
        let dir = entry.dir_read().map_err(|e| e.to_string())?;
        dir.check_invariants()
    }

    /// Sizes of a directory's cached chunks in stream order, starting
    /// from the first known dirent. Debug introspection for tests and
    /// operator tooling.
    pub fn dir_chunk_sizes(&self, entry: &EntryRef<F>) -> CacheResult<Vec<usize>> {
        let dir = entry.dir_read()?;
        let mut sizes = Vec::new();
        let mut seen = Vec::new();
        let mut cursor = if dir.first_ck != 0 {
            dir.by_cookie
                .get(&dir.first_ck)
                .and_then(|&id| dir.dirent(id).chunk)
        } else {
            None
        };
        while let Some(cid) = cursor {
            if seen.contains(&cid) {
                break;
            }
            seen.push(cid);
            sizes.push(dir.chunk(cid).num_entries());
            let next_ck = dir.chunk(cid).next_ck;
            cursor = if next_ck != 0 {
                dir.by_cookie
                    .get(&next_ck)
                    .and_then(|&id| dir.dirent(id).chunk)
            } else {
                None
            };
        }
        Ok(sizes)
    }

    /// Stream-order index of the chunk holding `name`, if the dirent is
    /// cached and chunked. Debug introspection for tests.
    pub fn dirent_chunk_position(
        &self,
        entry: &EntryRef<F>,
        name: &str,
    ) -> CacheResult<Option<usize>> {
        let dir = entry.dir_read()?;
        let Some(id) = dir.lookup_name(name) else {
            return Ok(None);
        };
        let Some(home) = dir.dirent(id).chunk else {
            return Ok(None);
        };
        let mut position = 0;
        let mut cursor = if dir.first_ck != 0 {
            dir.by_cookie
                .get(&dir.first_ck)
                .and_then(|&did| dir.dirent(did).chunk)
        } else {
            None
        };
        let mut seen = Vec::new();
        while let Some(cid) = cursor {
            if cid == home {
                return Ok(Some(position));
            }
            if seen.contains(&cid) {
                break;
            }
            seen.push(cid);
            position += 1;
            let next_ck = dir.chunk(cid).next_ck;
            cursor = if next_ck != 0 {
                dir.by_cookie
                    .get(&next_ck)
                    .and_then(|&did| dir.dirent(did).chunk)
            } else {
                None
            };
        }
        Ok(None)
    }

    // ---- internals -----------------------------------------------------

    fn begin_icreate<'a>(&self, parent: &'a EntryRef<F>) -> CacheResult<IcreateGuard<'a, F>> {
        parent.dir_write()?.icreate_refcnt += 1;
        Ok(IcreateGuard(parent))
    }

    /// Install a freshly created child's dirent and settle the parent's
    /// attribute trust. Creation already succeeded; failures here only
    /// cost cache efficiency.
    fn install_created(
        &self,
        ctx: &OpContext,
        parent: &EntryRef<F>,
        name: &str,
        child: &EntryRef<F>,
    ) {
        let placed = if parent.flags.contains(EntryFlags::BYPASS_DIRCACHE) {
            Ok(false)
        } else {
            match parent.dir_write() {
                Ok(mut dir) => {
                    self.retrust_dir(parent, &mut dir);
                    self.dirent_add_locked(parent, &mut dir, name, child.key().clone())
                }
                Err(err) => Err(err),
            }
        };
        match placed {
            Ok(true) => {
                // The dirent landed in a chunk; the cached listing is
                // still exact, so refresh without invalidating.
                if let Err(err) = self.refresh_attrs(ctx, parent, false, false) {
                    debug!("post-create refresh failed: {}", err);
                    parent.flags.clear(EntryFlags::TRUST_ATTRS);
                }
            }
            Ok(false) => {
                parent.flags.clear(EntryFlags::TRUST_ATTRS);
            }
            Err(CacheError::Overflow) => {
                parent.flags.clear(EntryFlags::TRUST_ATTRS);
            }
            Err(err) => {
                debug!("dirent install for created {:?} failed: {}", name, err);
                parent.flags.clear(EntryFlags::TRUST_ATTRS);
            }
        }
    }

    /// Re-trust a directory whose content was marked stale: drop what is
    /// cached and start over from empty.
    pub(crate) fn retrust_dir(&self, parent: &EntryRef<F>, dir: &mut DirState) {
        if parent.flags.contains(EntryFlags::TRUST_CONTENT) {
            return;
        }
        for cid in dir.chunk_ids() {
            self.pool.forget_chunk(parent.addr(), cid);
        }
        dir.invalidate_all();
        parent.flags.clear(EntryFlags::DIR_POPULATED);
        parent
            .flags
            .set(EntryFlags::TRUST_CONTENT | EntryFlags::TRUST_DIR_CHUNKS);
    }

    /// Add a name to child-key dirent under the parent's content write
    /// lock, deciding chunk placement. Returns whether the dirent landed
    /// in a chunk.
    pub(crate) fn dirent_add_locked(
        &self,
        parent: &EntryRef<F>,
        dir: &mut DirState,
        name: &str,
        ckey: CacheKey,
    ) -> CacheResult<bool> {
        if dir.named_count() >= self.config.dir_max {
            parent.flags.set(EntryFlags::BYPASS_DIRCACHE);
            warn!(
                "directory {:?} exceeded {} dirents, bypassing the cache",
                parent.key(),
                self.config.dir_max
            );
            return Err(CacheError::Overflow);
        }

        let mut id = dir.alloc_dirent(name, ckey.clone(), 0);
        match dir.insert_name(id) {
            Ok(NameInsert::Inserted) => {}
            Ok(NameInsert::Exists(prior)) => {
                dir.free_slot(id);
                if dir.dirent(prior).ckey == ckey {
                    // A parallel populator beat us to it; treat the
                    // collision as success.
                    return Ok(dir.dirent(prior).chunk.is_some());
                }
                // The name maps to a different object now; replace it.
                dir.mark_deleted(prior);
                id = dir.alloc_dirent(name, ckey.clone(), 0);
                match dir.insert_name(id) {
                    Ok(NameInsert::Inserted) => {}
                    Ok(NameInsert::Exists(_)) | Err(_) => {
                        dir.free_slot(id);
                        return Err(CacheError::Exist);
                    }
                }
            }
            Err(err) => {
                dir.free_slot(id);
                return Err(err);
            }
        }

        if !self.config.chunking_enabled() {
            add_detached(dir, &self.config, id);
            return Ok(false);
        }

        let ck = self.fsal.compute_readdir_cookie(&parent.sub_handle, name);
        if ck == 0 {
            // Without a computable cookie we cannot know where the
            // dirent falls; existing chunks are no longer exact.
            if dir.num_chunks() > 0 {
                debug!(
                    "no computable cookie for {:?}; dropping cached chunks",
                    name
                );
                for cid in dir.chunk_ids() {
                    self.pool.forget_chunk(parent.addr(), cid);
                }
                dir.invalidate_chunks();
                parent
                    .flags
                    .clear(EntryFlags::TRUST_DIR_CHUNKS | EntryFlags::DIR_POPULATED);
            }
            add_detached(dir, &self.config, id);
            return Ok(false);
        }

        dir.set_cookie(id, ck);
        if !parent.flags.contains(EntryFlags::TRUST_DIR_CHUNKS) {
            add_detached(dir, &self.config, id);
            return Ok(false);
        }
        match place_new_dirent(dir, &self.config, id) {
            Placement::Chunked { chunk, split_off } => {
                self.pool.bump_chunk(parent, chunk);
                if let Some(new_chunk) = split_off {
                    self.pool.record_chunk(parent, new_chunk);
                }
                Ok(true)
            }
            Placement::Detached => Ok(false),
        }
    }

    /// Take the content locks of two directories in entry address
    /// order. The second lock is tried; on contention the first is
    /// released and the acquisition restarts after a brief yield.
    fn lock_two_dirs<'a>(
        &self,
        old_dir: &'a EntryRef<F>,
        new_dir: &'a EntryRef<F>,
    ) -> CacheResult<(
        MappedRwLockWriteGuard<'a, DirState>,
        Option<MappedRwLockWriteGuard<'a, DirState>>,
    )> {
        if Arc::ptr_eq(old_dir, new_dir) {
            return Ok((old_dir.dir_write()?, None));
        }
        let old_first = old_dir.addr() < new_dir.addr();
        let (first, second) = if old_first {
            (old_dir, new_dir)
        } else {
            (new_dir, old_dir)
        };
        loop {
            let first_guard = first.dir_write()?;
            match second.try_dir_write()? {
                Some(second_guard) => {
                    return Ok(if old_first {
                        (first_guard, Some(second_guard))
                    } else {
                        (second_guard, Some(first_guard))
                    });
                }
                None => {
                    drop(first_guard);
                    thread::yield_now();
                }
            }
        }
    }
}
