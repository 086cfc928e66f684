//! Namespace operations: lookup, create, unlink, rename, links.

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use common::{collect_readdir, harness, small_chunks, Harness, MemFs};
use mdcache::{
    CacheConfig, CacheError, EntryFlags, EntryRef, FsalFeatures, SetAttrs,
};

fn lookup_calls(h: &Harness) -> u64 {
    h.cache.fsal().lookup_calls.load(Ordering::Relaxed)
}

fn ino_of(h: &Harness, entry: &EntryRef<MemFs>) -> u64 {
    let wire = h.cache.handle_to_wire(entry).unwrap();
    u64::from_le_bytes(wire.try_into().unwrap())
}

#[test]
fn second_lookup_is_served_from_cache() {
    let cfg = small_chunks().attr_expire(Duration::from_secs(60));
    let h = harness(FsalFeatures::COMPUTE_READDIR_COOKIE, cfg);
    h.cache
        .fsal()
        .add_raw(common::ROOT_INO, "hello", mdcache::FileType::RegularFile);
    let first = h.cache.lookup(&h.ctx, &h.root, "hello").unwrap();
    assert_eq!(lookup_calls(&h), 1);
    let second = h.cache.lookup(&h.ctx, &h.root, "hello").unwrap();
    assert_eq!(lookup_calls(&h), 1, "second lookup must hit the cache");
    assert!(h.cache.handle_cmp(&first, &second));
}

#[test]
fn dot_names_are_rejected() {
    let h = harness(FsalFeatures::COMPUTE_READDIR_COOKIE, small_chunks());
    assert!(matches!(
        h.cache.lookup(&h.ctx, &h.root, "."),
        Err(CacheError::Inval(_))
    ));
    assert!(matches!(
        h.cache.lookup(&h.ctx, &h.root, ".."),
        Err(CacheError::Inval(_))
    ));
}

#[test]
fn create_then_lookup_roundtrip() {
    let h = harness(FsalFeatures::COMPUTE_READDIR_COOKIE, small_chunks());
    let created = h
        .cache
        .create(&h.ctx, &h.root, "data", &SetAttrs::default())
        .unwrap();
    let found = h.cache.lookup(&h.ctx, &h.root, "data").unwrap();
    assert!(h.cache.handle_cmp(&created, &found));
    h.cache.check_dir_invariants(&h.root).unwrap();
}

#[test]
fn unlink_kills_the_child() {
    let h = harness(FsalFeatures::COMPUTE_READDIR_COOKIE, small_chunks());
    let child = h
        .cache
        .create(&h.ctx, &h.root, "doomed", &SetAttrs::default())
        .unwrap();
    let key = h.cache.handle_to_key(&child);
    h.cache.unlink(&h.ctx, &h.root, "doomed", &child).unwrap();
    assert!(child.entry_flags().contains(EntryFlags::UNREACHABLE));
    assert!(h.cache.find_keyed(&key).is_err());
    assert!(matches!(
        h.cache.lookup(&h.ctx, &h.root, "doomed"),
        Err(CacheError::NoEnt)
    ));
}

#[test]
fn unlink_nonempty_directory_untrusts_its_listing() {
    let h = harness(FsalFeatures::COMPUTE_READDIR_COOKIE, small_chunks());
    let subdir = h
        .cache
        .mkdir(&h.ctx, &h.root, "sub", &SetAttrs::default())
        .unwrap();
    h.cache
        .create(&h.ctx, &subdir, "occupant", &SetAttrs::default())
        .unwrap();
    collect_readdir(&h, &subdir, 0).unwrap();
    assert!(!h.cache.dir_chunk_sizes(&subdir).unwrap().is_empty());
    assert!(matches!(
        h.cache.unlink(&h.ctx, &h.root, "sub", &subdir),
        Err(CacheError::NotEmpty)
    ));
    assert!(h.cache.dir_chunk_sizes(&subdir).unwrap().is_empty());
    assert!(!subdir.entry_flags().contains(EntryFlags::UNREACHABLE));
}

#[test]
fn rename_in_place_without_chunking() {
    let cfg = CacheConfig::new().dir_chunk(0);
    let h = harness(FsalFeatures::empty(), cfg);
    let child = h
        .cache
        .create(&h.ctx, &h.root, "a", &SetAttrs::default())
        .unwrap();
    h.cache
        .rename(&h.ctx, &child, &h.root, "a", &h.root, "b")
        .unwrap();
    assert!(
        !child.entry_flags().contains(EntryFlags::TRUST_ATTRS),
        "renamed child's attribute trust must be cleared"
    );
    // The name tree was updated in place: "b" resolves without a
    // sub-FSAL call, "a" is gone.
    let calls = lookup_calls(&h);
    let found = h.cache.lookup(&h.ctx, &h.root, "b").unwrap();
    assert_eq!(lookup_calls(&h), calls);
    assert!(h.cache.handle_cmp(&child, &found));
    assert!(matches!(
        h.cache.lookup(&h.ctx, &h.root, "a"),
        Err(CacheError::NoEnt)
    ));
}

#[test]
fn rename_under_chunking_moves_the_dirent() {
    let h = harness(FsalFeatures::COMPUTE_READDIR_COOKIE, small_chunks());
    let child = h
        .cache
        .create(&h.ctx, &h.root, "old", &SetAttrs::default())
        .unwrap();
    let other = h
        .cache
        .mkdir(&h.ctx, &h.root, "dir", &SetAttrs::default())
        .unwrap();
    h.cache
        .rename(&h.ctx, &child, &h.root, "old", &other, "new")
        .unwrap();
    assert!(matches!(
        h.cache.lookup(&h.ctx, &h.root, "old"),
        Err(CacheError::NoEnt)
    ));
    let found = h.cache.lookup(&h.ctx, &other, "new").unwrap();
    assert!(h.cache.handle_cmp(&child, &found));
    h.cache.check_dir_invariants(&h.root).unwrap();
    h.cache.check_dir_invariants(&other).unwrap();
}

#[test]
fn rename_onto_itself_is_a_noop() {
    let h = harness(FsalFeatures::COMPUTE_READDIR_COOKIE, small_chunks());
    let child = h
        .cache
        .create(&h.ctx, &h.root, "same", &SetAttrs::default())
        .unwrap();
    h.cache
        .rename(&h.ctx, &child, &h.root, "same", &h.root, "same")
        .unwrap();
    let found = h.cache.lookup(&h.ctx, &h.root, "same").unwrap();
    assert!(h.cache.handle_cmp(&child, &found));
}

#[test]
fn rename_that_changes_keys_kills_the_object() {
    let features =
        FsalFeatures::COMPUTE_READDIR_COOKIE | FsalFeatures::RENAME_CHANGES_KEY;
    let h = harness(features, small_chunks());
    let child = h
        .cache
        .create(&h.ctx, &h.root, "before", &SetAttrs::default())
        .unwrap();
    let old_key = h.cache.handle_to_key(&child);
    collect_readdir(&h, &h.root, 0).unwrap();
    h.cache
        .rename(&h.ctx, &child, &h.root, "before", &h.root, "after")
        .unwrap();
    assert!(child.entry_flags().contains(EntryFlags::UNREACHABLE));
    assert!(h.cache.find_keyed(&old_key).is_err());
    // Both directories' dirent caches were dumped.
    assert!(h.cache.dir_chunk_sizes(&h.root).unwrap().is_empty());
    let renamed = h.cache.lookup(&h.ctx, &h.root, "after").unwrap();
    assert_ne!(h.cache.handle_to_key(&renamed), old_key);
}

#[test]
fn link_installs_a_second_name() {
    let h = harness(FsalFeatures::COMPUTE_READDIR_COOKIE, small_chunks());
    let child = h
        .cache
        .create(&h.ctx, &h.root, "one", &SetAttrs::default())
        .unwrap();
    h.cache.link(&h.ctx, &child, &h.root, "two").unwrap();
    let found = h.cache.lookup(&h.ctx, &h.root, "two").unwrap();
    assert!(h.cache.handle_cmp(&child, &found));
    let attrs = h.cache.getattrs(&h.ctx, &child, mdcache::AttrMask::BASIC).unwrap();
    assert_eq!(attrs.nlink, 2);
}

#[test]
fn symlink_target_is_cached() {
    let h = harness(FsalFeatures::COMPUTE_READDIR_COOKIE, small_chunks());
    let link = h
        .cache
        .symlink(&h.ctx, &h.root, "ptr", "../elsewhere", &SetAttrs::default())
        .unwrap();
    assert_eq!(h.cache.readlink(&h.ctx, &link).unwrap(), "../elsewhere");
    assert_eq!(h.cache.readlink(&h.ctx, &link).unwrap(), "../elsewhere");
    assert!(matches!(
        h.cache.readlink(&h.ctx, &h.root),
        Err(CacheError::Inval(_))
    ));
}

#[test]
fn stale_parent_is_killed_and_reresolvable() {
    let h = harness(FsalFeatures::COMPUTE_READDIR_COOKIE, small_chunks());
    let subdir = h
        .cache
        .mkdir(&h.ctx, &h.root, "gone", &SetAttrs::default())
        .unwrap();
    let sub_ino = ino_of(&h, &subdir);
    let key = h.cache.handle_to_key(&subdir);
    // The directory disappears behind the cache's back.
    h.cache.fsal().remove_raw(common::ROOT_INO, "gone");
    let _ = sub_ino;
    assert!(matches!(
        h.cache.lookup(&h.ctx, &subdir, "x"),
        Err(CacheError::Stale)
    ));
    assert!(subdir.entry_flags().contains(EntryFlags::UNREACHABLE));
    assert!(h.cache.find_keyed(&key).is_err());
}

#[test]
fn killed_entry_is_recreated_distinct() {
    let h = harness(FsalFeatures::COMPUTE_READDIR_COOKIE, small_chunks());
    let subdir = h
        .cache
        .mkdir(&h.ctx, &h.root, "d", &SetAttrs::default())
        .unwrap();
    let wire = h.cache.handle_to_wire(&subdir).unwrap();
    let key = h.cache.handle_to_key(&subdir);
    h.cache.kill_entry(&subdir);
    assert!(h.cache.find_keyed(&key).is_err());
    // Re-resolving through the wire handle builds a fresh entry for the
    // same object.
    let reborn = h.cache.create_handle(&h.ctx, &wire).unwrap();
    assert!(!std::sync::Arc::ptr_eq(&subdir, &reborn));
    assert_eq!(*reborn.key(), key);
    assert!(h.cache.find_keyed(&key).is_ok());
}
