//! Attribute caching, refresh, expiry, and access checks.

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use common::{collect_readdir, harness, small_chunks, Harness};
use mdcache::{
    AccessMask, AttrMask, Creds, EntryFlags, FsalFeatures, OpContext, SetAttrs,
};

fn getattrs_calls(h: &Harness) -> u64 {
    h.cache.fsal().getattrs_calls.load(Ordering::Relaxed)
}

#[test]
fn fresh_attrs_are_served_from_cache() {
    let cfg = small_chunks().attr_expire(Duration::from_secs(60));
    let h = harness(FsalFeatures::COMPUTE_READDIR_COOKIE, cfg);
    let child = h
        .cache
        .create(&h.ctx, &h.root, "f", &SetAttrs::default())
        .unwrap();
    let calls = getattrs_calls(&h);
    h.cache.getattrs(&h.ctx, &child, AttrMask::BASIC).unwrap();
    h.cache.getattrs(&h.ctx, &child, AttrMask::BASIC).unwrap();
    assert_eq!(getattrs_calls(&h), calls, "fresh attrs must not refetch");
}

#[test]
fn expired_attrs_refetch() {
    let h = harness(FsalFeatures::COMPUTE_READDIR_COOKIE, small_chunks());
    let child = h
        .cache
        .create(&h.ctx, &h.root, "f", &SetAttrs::default())
        .unwrap();
    let calls = getattrs_calls(&h);
    h.cache.getattrs(&h.ctx, &child, AttrMask::BASIC).unwrap();
    h.cache.getattrs(&h.ctx, &child, AttrMask::BASIC).unwrap();
    assert!(
        getattrs_calls(&h) >= calls + 2,
        "a zero TTL must refetch every time"
    );
}

#[test]
fn refresh_with_unchanged_mtime_keeps_directory_content() {
    let h = harness(FsalFeatures::COMPUTE_READDIR_COOKIE, small_chunks());
    for i in 0..10 {
        h.cache
            .fsal()
            .add_raw(common::ROOT_INO, &format!("f{:02}", i), mdcache::FileType::RegularFile);
    }
    // Sync the cached mtime with the seeded state first.
    h.cache.getattrs(&h.ctx, &h.root, AttrMask::BASIC).unwrap();
    collect_readdir(&h, &h.root, 0).unwrap();
    assert!(h.root.entry_flags().contains(EntryFlags::DIR_POPULATED));
    h.cache.getattrs(&h.ctx, &h.root, AttrMask::BASIC).unwrap();
    assert!(
        h.root.entry_flags().contains(EntryFlags::DIR_POPULATED),
        "unchanged mtime must keep the dirent cache"
    );
    assert!(!h.cache.dir_chunk_sizes(&h.root).unwrap().is_empty());
}

#[test]
fn refresh_with_newer_mtime_invalidates_directory_content() {
    let h = harness(FsalFeatures::COMPUTE_READDIR_COOKIE, small_chunks());
    for i in 0..10 {
        h.cache
            .fsal()
            .add_raw(common::ROOT_INO, &format!("f{:02}", i), mdcache::FileType::RegularFile);
    }
    collect_readdir(&h, &h.root, 0).unwrap();
    // A write behind the cache's back advances the directory mtime.
    h.cache
        .fsal()
        .add_raw(common::ROOT_INO, "intruder", mdcache::FileType::RegularFile);
    h.cache.getattrs(&h.ctx, &h.root, AttrMask::BASIC).unwrap();
    assert!(
        !h.root.entry_flags().contains(EntryFlags::DIR_POPULATED),
        "newer mtime must drop the dirent cache"
    );
    assert!(h.cache.dir_chunk_sizes(&h.root).unwrap().is_empty());
    // The intruder resolves once the cache re-consults the sub-FSAL.
    let found = h.cache.lookup(&h.ctx, &h.root, "intruder").unwrap();
    assert_eq!(found.kind(), mdcache::FileType::RegularFile);
}

#[test]
fn setattrs_apply_and_refresh() {
    let h = harness(FsalFeatures::COMPUTE_READDIR_COOKIE, small_chunks());
    let child = h
        .cache
        .create(&h.ctx, &h.root, "f", &SetAttrs::default())
        .unwrap();
    let changes = SetAttrs {
        mode: Some(0o600),
        owner: Some(1000),
        ..SetAttrs::default()
    };
    h.cache.setattrs(&h.ctx, &child, &changes).unwrap();
    let attrs = h.cache.getattrs(&h.ctx, &child, AttrMask::BASIC).unwrap();
    assert_eq!(attrs.mode, 0o600);
    assert_eq!(attrs.owner, 1000);
}

#[test]
fn write_invalidates_attribute_trust() {
    let h = harness(FsalFeatures::COMPUTE_READDIR_COOKIE, small_chunks());
    let child = h
        .cache
        .create(&h.ctx, &h.root, "f", &SetAttrs::default())
        .unwrap();
    h.cache.getattrs(&h.ctx, &child, AttrMask::BASIC).unwrap();
    h.cache.invalidate_attrs(&child);
    assert!(!child.entry_flags().contains(EntryFlags::TRUST_ATTRS));
    // The next getattrs restores trust from the sub-FSAL.
    h.cache.getattrs(&h.ctx, &child, AttrMask::BASIC).unwrap();
    assert!(child.entry_flags().contains(EntryFlags::TRUST_ATTRS));
}

#[test]
fn access_checks_use_the_mode_triads() {
    let cfg = small_chunks().attr_expire(Duration::from_secs(60));
    let h = harness(FsalFeatures::COMPUTE_READDIR_COOKIE, cfg);
    let child = h
        .cache
        .create(&h.ctx, &h.root, "f", &SetAttrs::default())
        .unwrap();
    let changes = SetAttrs {
        mode: Some(0o640),
        owner: Some(1000),
        group: Some(44),
        ..SetAttrs::default()
    };
    h.cache.setattrs(&h.ctx, &child, &changes).unwrap();

    let owner_ctx = OpContext::new(h.ctx.export.clone(), Creds::new(1000, 1000));
    assert!(h
        .cache
        .test_access(&owner_ctx, &child, AccessMask::READ | AccessMask::WRITE)
        .unwrap());
    assert!(!h
        .cache
        .test_access(&owner_ctx, &child, AccessMask::EXECUTE)
        .unwrap());

    let mut group_creds = Creds::new(2000, 2000);
    group_creds.groups.push(44);
    let group_ctx = OpContext::new(h.ctx.export.clone(), group_creds);
    assert!(h
        .cache
        .test_access(&group_ctx, &child, AccessMask::READ)
        .unwrap());
    assert!(!h
        .cache
        .test_access(&group_ctx, &child, AccessMask::WRITE)
        .unwrap());

    let other_ctx = OpContext::new(h.ctx.export.clone(), Creds::new(3000, 3000));
    assert!(!h
        .cache
        .test_access(&other_ctx, &child, AccessMask::READ)
        .unwrap());

    let root_ctx = OpContext::new(h.ctx.export.clone(), Creds::new(0, 0));
    assert!(h
        .cache
        .test_access(&root_ctx, &child, AccessMask::READ | AccessMask::WRITE)
        .unwrap());
}

#[test]
fn creates_do_not_dump_the_parent_listing() {
    let h = harness(FsalFeatures::COMPUTE_READDIR_COOKIE, small_chunks());
    for i in 0..10 {
        h.cache
            .fsal()
            .add_raw(common::ROOT_INO, &format!("f{:02}", i), mdcache::FileType::RegularFile);
    }
    collect_readdir(&h, &h.root, 0).unwrap();
    // The create advances the directory mtime, but the dirent was
    // placed into a chunk, so the listing stays cached.
    h.cache
        .create(&h.ctx, &h.root, "f99", &SetAttrs::default())
        .unwrap();
    let readdirs = h.cache.fsal().readdir_calls.load(Ordering::Relaxed);
    let (names, eod) = collect_readdir(&h, &h.root, 0).unwrap();
    assert!(eod);
    assert_eq!(names.len(), 11);
    assert_eq!(
        h.cache.fsal().readdir_calls.load(Ordering::Relaxed),
        readdirs,
        "listing must come from cache after a placeable create"
    );
}
