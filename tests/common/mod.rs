//! Shared test fixture: an in-memory sub-FSAL.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, UNIX_EPOCH};

use mdcache::{
    AttrMask, CacheConfig, CacheError, CacheResult, Creds, EntryRef, FileAttr, FileType,
    FsalDirent, FsalFeatures, MetadataCache, OpContext, ReaddirControl, SetAttrs, SubFsal, Whence,
};

pub const ROOT_INO: u64 = 1;

/// Order-preserving readdir cookie for a name: the first eight bytes,
/// big endian. ASCII names always land well above the reserved range.
pub fn cookie_of(name: &str) -> u64 {
    let mut buf = [0u8; 8];
    for (i, byte) in name.bytes().take(8).enumerate() {
        buf[i] = byte;
    }
    u64::from_be_bytes(buf)
}

/// Handle for an in-memory node.
#[derive(Debug, Clone)]
pub struct MemHandle(pub u64);

#[derive(Debug, Clone)]
struct Node {
    kind: FileType,
    mode: u32,
    owner: u32,
    group: u32,
    size: u64,
    nlink: u32,
    mtime_tick: u64,
    ctime_tick: u64,
    children: BTreeMap<String, u64>,
    link_target: String,
}

impl Node {
    fn new(kind: FileType) -> Self {
        Node {
            kind,
            mode: if kind == FileType::Directory {
                0o755
            } else {
                0o644
            },
            owner: 0,
            group: 0,
            size: 0,
            nlink: if kind == FileType::Directory { 2 } else { 1 },
            mtime_tick: 0,
            ctime_tick: 0,
            children: BTreeMap::new(),
            link_target: String::new(),
        }
    }
}

struct MemState {
    nodes: HashMap<u64, Node>,
    next_ino: u64,
    clock: u64,
}

/// An in-memory sub-FSAL with configurable feature flags and call
/// counters.
pub struct MemFs {
    features: FsalFeatures,
    state: Mutex<MemState>,
    pub lookup_calls: AtomicU64,
    pub getattrs_calls: AtomicU64,
    pub readdir_calls: AtomicU64,
}

impl MemFs {
    pub fn new(features: FsalFeatures) -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(ROOT_INO, Node::new(FileType::Directory));
        MemFs {
            features,
            state: Mutex::new(MemState {
                nodes,
                next_ino: ROOT_INO + 1,
                clock: 0,
            }),
            lookup_calls: AtomicU64::new(0),
            getattrs_calls: AtomicU64::new(0),
            readdir_calls: AtomicU64::new(0),
        }
    }

    /// Add a node directly, behind the cache's back.
    pub fn add_raw(&self, parent: u64, name: &str, kind: FileType) -> u64 {
        let mut state = self.state.lock().unwrap();
        state.clock += 1;
        let tick = state.clock;
        let ino = state.next_ino;
        state.next_ino += 1;
        let mut node = Node::new(kind);
        node.mtime_tick = tick;
        node.ctime_tick = tick;
        state.nodes.insert(ino, node);
        let dir = state.nodes.get_mut(&parent).expect("parent must exist");
        dir.children.insert(name.to_owned(), ino);
        dir.mtime_tick = tick;
        ino
    }

    /// Remove a node directly, behind the cache's back.
    pub fn remove_raw(&self, parent: u64, name: &str) {
        let mut state = self.state.lock().unwrap();
        state.clock += 1;
        let tick = state.clock;
        let dir = state.nodes.get_mut(&parent).expect("parent must exist");
        let ino = dir.children.remove(name).expect("name must exist");
        dir.mtime_tick = tick;
        state.nodes.remove(&ino);
    }

    fn attrs_of(node: &Node) -> FileAttr {
        FileAttr {
            kind: node.kind,
            owner: node.owner,
            group: node.group,
            mode: node.mode,
            size: node.size,
            space_used: node.size,
            nlink: node.nlink,
            atime: UNIX_EPOCH + Duration::from_secs(node.mtime_tick),
            mtime: UNIX_EPOCH + Duration::from_secs(node.mtime_tick),
            ctime: UNIX_EPOCH + Duration::from_secs(node.ctime_tick),
            change: node.mtime_tick,
            rawdev: 0,
            acl: None,
        }
    }

    fn new_child(
        &self,
        dir: &MemHandle,
        name: &str,
        kind: FileType,
        attrs: &SetAttrs,
    ) -> CacheResult<(MemHandle, FileAttr)> {
        let mut state = self.state.lock().unwrap();
        state.clock += 1;
        let tick = state.clock;
        let parent = state
            .nodes
            .get(&dir.0)
            .ok_or(CacheError::Stale)?
            .clone();
        if parent.kind != FileType::Directory {
            return Err(CacheError::Inval("not a directory"));
        }
        if parent.children.contains_key(name) {
            return Err(CacheError::Exist);
        }
        let ino = state.next_ino;
        state.next_ino += 1;
        let mut node = Node::new(kind);
        node.mode = attrs.mode.unwrap_or(node.mode);
        node.owner = attrs.owner.unwrap_or(0);
        node.group = attrs.group.unwrap_or(0);
        node.mtime_tick = tick;
        node.ctime_tick = tick;
        let fattrs = Self::attrs_of(&node);
        state.nodes.insert(ino, node);
        let dir_node = state.nodes.get_mut(&dir.0).expect("checked above");
        dir_node.children.insert(name.to_owned(), ino);
        dir_node.mtime_tick = tick;
        Ok((MemHandle(ino), fattrs))
    }
}

impl SubFsal for MemFs {
    type Handle = MemHandle;
    type State = u64;

    fn fsal_id(&self) -> u16 {
        7
    }

    fn features(&self) -> FsalFeatures {
        self.features
    }

    fn lookup(
        &self,
        _ctx: &OpContext,
        dir: &MemHandle,
        name: &str,
    ) -> CacheResult<(MemHandle, FileAttr)> {
        self.lookup_calls.fetch_add(1, Ordering::Relaxed);
        let state = self.state.lock().unwrap();
        let parent = state.nodes.get(&dir.0).ok_or(CacheError::Stale)?;
        let &ino = parent.children.get(name).ok_or(CacheError::NoEnt)?;
        let node = state.nodes.get(&ino).ok_or(CacheError::Stale)?;
        Ok((MemHandle(ino), Self::attrs_of(node)))
    }

    fn readdir(
        &self,
        _ctx: &OpContext,
        dir: &MemHandle,
        whence: Whence<'_>,
        _attr_mask: AttrMask,
        cb: &mut dyn FnMut(FsalDirent<MemHandle>) -> CacheResult<ReaddirControl>,
    ) -> CacheResult<bool> {
        self.readdir_calls.fetch_add(1, Ordering::Relaxed);
        let entries: Vec<(String, u64, FileAttr)> = {
            let state = self.state.lock().unwrap();
            let parent = state.nodes.get(&dir.0).ok_or(CacheError::Stale)?;
            parent
                .children
                .iter()
                .map(|(name, &ino)| {
                    let node = state.nodes.get(&ino).expect("child must exist");
                    (name.clone(), ino, Self::attrs_of(node))
                })
                .collect()
        };
        let after: Option<u64> = match whence {
            Whence::Start => None,
            Whence::Cookie(ck) => {
                if !entries.iter().any(|(name, _, _)| cookie_of(name) == ck) {
                    return Err(CacheError::BadCookie(ck));
                }
                Some(ck)
            }
            Whence::Name(name) => Some(cookie_of(name)),
        };
        for (name, ino, attrs) in entries {
            let cookie = cookie_of(&name);
            if let Some(after) = after {
                if cookie <= after {
                    continue;
                }
            }
            match cb(FsalDirent {
                name,
                handle: MemHandle(ino),
                attrs,
                cookie,
            })? {
                ReaddirControl::Continue => {}
                ReaddirControl::Stop => return Ok(false),
            }
        }
        Ok(true)
    }

    fn getattrs(
        &self,
        _ctx: &OpContext,
        obj: &MemHandle,
        _mask: AttrMask,
    ) -> CacheResult<FileAttr> {
        self.getattrs_calls.fetch_add(1, Ordering::Relaxed);
        let state = self.state.lock().unwrap();
        let node = state.nodes.get(&obj.0).ok_or(CacheError::Stale)?;
        Ok(Self::attrs_of(node))
    }

    fn setattrs(
        &self,
        _ctx: &OpContext,
        obj: &MemHandle,
        attrs: &SetAttrs,
        _state: Option<&u64>,
    ) -> CacheResult<()> {
        let mut state = self.state.lock().unwrap();
        state.clock += 1;
        let tick = state.clock;
        let node = state.nodes.get_mut(&obj.0).ok_or(CacheError::Stale)?;
        if let Some(mode) = attrs.mode {
            node.mode = mode;
        }
        if let Some(owner) = attrs.owner {
            node.owner = owner;
        }
        if let Some(group) = attrs.group {
            node.group = group;
        }
        if let Some(size) = attrs.size {
            node.size = size;
            node.mtime_tick = tick;
        }
        node.ctime_tick = tick;
        Ok(())
    }

    fn create(
        &self,
        _ctx: &OpContext,
        dir: &MemHandle,
        name: &str,
        attrs: &SetAttrs,
    ) -> CacheResult<(MemHandle, FileAttr, Option<u64>)> {
        let (handle, fattrs) = self.new_child(dir, name, FileType::RegularFile, attrs)?;
        Ok((handle, fattrs, None))
    }

    fn mkdir(
        &self,
        _ctx: &OpContext,
        dir: &MemHandle,
        name: &str,
        attrs: &SetAttrs,
    ) -> CacheResult<(MemHandle, FileAttr)> {
        self.new_child(dir, name, FileType::Directory, attrs)
    }

    fn mknode(
        &self,
        _ctx: &OpContext,
        dir: &MemHandle,
        name: &str,
        kind: FileType,
        _rawdev: u64,
        attrs: &SetAttrs,
    ) -> CacheResult<(MemHandle, FileAttr)> {
        self.new_child(dir, name, kind, attrs)
    }

    fn symlink(
        &self,
        _ctx: &OpContext,
        dir: &MemHandle,
        name: &str,
        target: &str,
        attrs: &SetAttrs,
    ) -> CacheResult<(MemHandle, FileAttr)> {
        let (handle, fattrs) = self.new_child(dir, name, FileType::Symlink, attrs)?;
        let mut state = self.state.lock().unwrap();
        if let Some(node) = state.nodes.get_mut(&handle.0) {
            node.link_target = target.to_owned();
        }
        Ok((handle, fattrs))
    }

    fn readlink(&self, _ctx: &OpContext, obj: &MemHandle) -> CacheResult<String> {
        let state = self.state.lock().unwrap();
        let node = state.nodes.get(&obj.0).ok_or(CacheError::Stale)?;
        if node.kind != FileType::Symlink {
            return Err(CacheError::Inval("not a symlink"));
        }
        Ok(node.link_target.clone())
    }

    fn link(
        &self,
        _ctx: &OpContext,
        obj: &MemHandle,
        dir: &MemHandle,
        name: &str,
    ) -> CacheResult<()> {
        let mut state = self.state.lock().unwrap();
        state.clock += 1;
        let tick = state.clock;
        if !state.nodes.contains_key(&obj.0) {
            return Err(CacheError::Stale);
        }
        let dir_node = state.nodes.get_mut(&dir.0).ok_or(CacheError::Stale)?;
        if dir_node.children.contains_key(name) {
            return Err(CacheError::Exist);
        }
        dir_node.children.insert(name.to_owned(), obj.0);
        dir_node.mtime_tick = tick;
        let node = state.nodes.get_mut(&obj.0).expect("checked above");
        node.nlink += 1;
        node.ctime_tick = tick;
        Ok(())
    }

    fn rename(
        &self,
        _ctx: &OpContext,
        obj: &MemHandle,
        old_dir: &MemHandle,
        old_name: &str,
        new_dir: &MemHandle,
        new_name: &str,
    ) -> CacheResult<()> {
        let mut state = self.state.lock().unwrap();
        state.clock += 1;
        let tick = state.clock;
        let src = state.nodes.get_mut(&old_dir.0).ok_or(CacheError::Stale)?;
        let ino = src.children.remove(old_name).ok_or(CacheError::NoEnt)?;
        src.mtime_tick = tick;
        let final_ino = if self.features.contains(FsalFeatures::RENAME_CHANGES_KEY) {
            // Path-addressed backends mint a new handle on rename.
            let node = state.nodes.remove(&ino).ok_or(CacheError::Stale)?;
            let new_ino = state.next_ino;
            state.next_ino += 1;
            state.nodes.insert(new_ino, node);
            new_ino
        } else {
            ino
        };
        let _ = obj;
        let dst = state.nodes.get_mut(&new_dir.0).ok_or(CacheError::Stale)?;
        dst.children.insert(new_name.to_owned(), final_ino);
        dst.mtime_tick = tick;
        Ok(())
    }

    fn unlink(
        &self,
        _ctx: &OpContext,
        dir: &MemHandle,
        name: &str,
        _obj: &MemHandle,
    ) -> CacheResult<()> {
        let mut state = self.state.lock().unwrap();
        state.clock += 1;
        let tick = state.clock;
        let parent = state.nodes.get(&dir.0).ok_or(CacheError::Stale)?;
        let &ino = parent.children.get(name).ok_or(CacheError::NoEnt)?;
        let victim = state.nodes.get(&ino).ok_or(CacheError::Stale)?;
        if victim.kind == FileType::Directory && !victim.children.is_empty() {
            return Err(CacheError::NotEmpty);
        }
        let keep = victim.kind != FileType::Directory && victim.nlink > 1;
        if keep {
            let node = state.nodes.get_mut(&ino).expect("checked above");
            node.nlink -= 1;
            node.ctime_tick = tick;
        } else {
            state.nodes.remove(&ino);
        }
        let parent = state.nodes.get_mut(&dir.0).expect("checked above");
        parent.children.remove(name);
        parent.mtime_tick = tick;
        Ok(())
    }

    fn handle_to_key(&self, obj: &MemHandle) -> CacheResult<Vec<u8>> {
        Ok(obj.0.to_le_bytes().to_vec())
    }

    fn handle_to_wire(&self, obj: &MemHandle) -> CacheResult<Vec<u8>> {
        Ok(obj.0.to_le_bytes().to_vec())
    }

    fn create_handle(
        &self,
        _ctx: &OpContext,
        wire: &[u8],
    ) -> CacheResult<(MemHandle, FileAttr)> {
        let bytes: [u8; 8] = wire
            .try_into()
            .map_err(|_| CacheError::Inval("bad wire handle"))?;
        let ino = u64::from_le_bytes(bytes);
        let state = self.state.lock().unwrap();
        let node = state.nodes.get(&ino).ok_or(CacheError::Stale)?;
        Ok((MemHandle(ino), Self::attrs_of(node)))
    }

    fn compute_readdir_cookie(&self, _dir: &MemHandle, name: &str) -> u64 {
        if self
            .features
            .contains(FsalFeatures::COMPUTE_READDIR_COOKIE)
        {
            cookie_of(name)
        } else {
            0
        }
    }
}

pub struct Harness {
    pub cache: MetadataCache<MemFs>,
    pub ctx: OpContext,
    pub root: EntryRef<MemFs>,
}

pub fn harness(features: FsalFeatures, config: CacheConfig) -> Harness {
    let _ = env_logger::builder().is_test(true).try_init();
    let cache = MetadataCache::new(MemFs::new(features), config).expect("config must validate");
    let export = cache
        .add_export(mdcache::ExportId(1))
        .expect("fresh export id");
    let ctx = OpContext::new(export, Creds::new(0, 0));
    let root = cache
        .create_handle(&ctx, &ROOT_INO.to_le_bytes())
        .expect("root must resolve");
    Harness { cache, ctx, root }
}

/// Chunking-friendly config used by most tests: chunks of 8, split 16.
pub fn small_chunks() -> CacheConfig {
    CacheConfig::new()
        .dir_chunk(8)
        .dir_chunk_split(16)
        .attr_expire(Duration::ZERO)
}

/// Collect a readdir pass into (names, eod).
pub fn collect_readdir(
    h: &Harness,
    dir: &EntryRef<MemFs>,
    whence: u64,
) -> CacheResult<(Vec<String>, bool)> {
    let mut names = Vec::new();
    let eod = h.cache.readdir(
        &h.ctx,
        dir,
        whence,
        AttrMask::BASIC,
        &mut |name, _entry, _ck| {
            names.push(name.to_owned());
            Ok(ReaddirControl::Continue)
        },
    )?;
    Ok((names, eod))
}
