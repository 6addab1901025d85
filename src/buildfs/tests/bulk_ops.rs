mod common;

use std::sync::Arc;

use buildfs::cache::CachedForm;
use buildfs::ops::{preload_all, purge_unused, verify_all, CancelFlag, Progress};
use buildfs::{Guid, Storage, StorageFlags, VerifyOutcome};

use common::*;

const GUID_A: &str = "AA000000000000000000000000000001";
const GUID_B: &str = "BB000000000000000000000000000002";
const GUID_STRAY: &str = "CC000000000000000000000000000003";

fn flags() -> StorageFlags {
    StorageFlags::DECOMPRESSED | StorageFlags::VERIFY_HASHES
}

fn two_chunk_specs() -> Vec<TestChunkSpec> {
    vec![
        TestChunkSpec::new(GUID_A, 0x1111, 0, window(3, 64 * 1024)),
        TestChunkSpec::new(GUID_B, 0x2222, 1, window(5, 64 * 1024)),
    ]
}

fn spec_files() -> Vec<TestFileSpec> {
    vec![TestFileSpec::new(
        "bin/a",
        vec![(0, 0, 64 * 1024), (1, 0, 64 * 1024)],
    )]
}

#[test]
fn preload_fetches_everything_once() {
    let cdn = TestCdn::start();
    let manifest = host_build(&cdn, &two_chunk_specs(), &spec_files());

    let cache_dir = tempfile::tempdir().unwrap();
    let storage =
        Storage::open(flags(), cache_dir.path(), &cdn.host(), &manifest.chunk_dir()).unwrap();

    let progress = Progress::new();
    let cancel = CancelFlag::new();
    let summary = preload_all(&storage, &manifest, 4, &progress, &cancel);
    assert_eq!(summary.processed, 2);
    assert_eq!(summary.failed, 0);
    assert!(!summary.cancelled);
    assert_eq!(progress.total(), 2);
    assert_eq!(progress.completed(), 2);
    assert_eq!(cdn.total_hits(), 2);
    for chunk in manifest.chunks() {
        assert!(storage.chunk_present(chunk));
    }

    // idempotent: present chunks are skipped without transfers
    let summary = preload_all(&storage, &manifest, 4, &progress, &cancel);
    assert_eq!(summary.processed, 2);
    assert_eq!(cdn.total_hits(), 2);
}

#[test]
fn cancelled_preload_transfers_nothing() {
    let cdn = TestCdn::start();
    let manifest = host_build(&cdn, &two_chunk_specs(), &spec_files());

    let cache_dir = tempfile::tempdir().unwrap();
    let storage =
        Storage::open(flags(), cache_dir.path(), &cdn.host(), &manifest.chunk_dir()).unwrap();

    let progress = Progress::new();
    let cancel = CancelFlag::new();
    cancel.cancel();
    let summary = preload_all(&storage, &manifest, 4, &progress, &cancel);
    assert!(summary.cancelled);
    assert_eq!(summary.processed, 0);
    assert_eq!(cdn.total_hits(), 0);
}

#[test]
fn verify_reacquires_corrupt_chunks() {
    let cdn = TestCdn::start();
    let manifest = host_build(&cdn, &two_chunk_specs(), &spec_files());

    let cache_dir = tempfile::tempdir().unwrap();
    let storage =
        Storage::open(flags(), cache_dir.path(), &cdn.host(), &manifest.chunk_dir()).unwrap();

    let progress = Progress::new();
    let cancel = CancelFlag::new();
    preload_all(&storage, &manifest, 4, &progress, &cancel);
    assert_eq!(cdn.total_hits(), 2);

    // clobber one cached chunk
    let guid_a = Guid::from_hex(GUID_A).unwrap();
    storage
        .cache()
        .write_cached(guid_a, CachedForm::Decompressed, 0, b"garbage")
        .unwrap();

    let summary = verify_all(&storage, &manifest, 4, &progress, &cancel);
    assert_eq!(summary.processed, 2);
    assert_eq!(summary.reacquired, 1);
    assert_eq!(summary.failed, 0);
    assert_eq!(progress.total(), 2);
    assert_eq!(cdn.total_hits(), 3);

    for chunk in manifest.chunks() {
        assert_eq!(storage.verify(chunk).unwrap(), VerifyOutcome::Verified);
    }
}

#[test]
fn purge_removes_only_unreferenced_chunks() {
    let cdn = TestCdn::start();
    let manifest = host_build(&cdn, &two_chunk_specs(), &spec_files());

    let cache_dir = tempfile::tempdir().unwrap();
    let storage =
        Storage::open(flags(), cache_dir.path(), &cdn.host(), &manifest.chunk_dir()).unwrap();

    let progress = Progress::new();
    let cancel = CancelFlag::new();
    preload_all(&storage, &manifest, 4, &progress, &cancel);

    // a chunk left over from a previous build, plus content the purge
    // must not touch
    let stray = Guid::from_hex(GUID_STRAY).unwrap();
    storage
        .cache()
        .write_cached(stray, CachedForm::Decompressed, 0, b"old build")
        .unwrap();
    std::fs::create_dir_all(cache_dir.path().join("game")).unwrap();
    std::fs::write(cache_dir.path().join("game/keep.bin"), b"keep").unwrap();
    std::fs::write(cache_dir.path().join("manifest.json"), b"{}").unwrap();

    let summary = purge_unused(&storage, &manifest, &progress, &cancel);
    assert_eq!(progress.total(), 3);
    assert_eq!(summary.processed, 3);
    assert_eq!(summary.deleted, 1);
    assert_eq!(summary.failed, 0);

    assert!(!storage.cache().contains(stray));
    for chunk in manifest.chunks() {
        assert!(storage.chunk_present(chunk));
    }
    assert!(cache_dir.path().join("game/keep.bin").is_file());
    assert!(cache_dir.path().join("manifest.json").is_file());
}

#[test]
fn mounted_build_wrappers_drive_ops() {
    let cdn = TestCdn::start();
    let manifest = host_build(&cdn, &two_chunk_specs(), &spec_files());

    let cache_dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(
        Storage::open(flags(), cache_dir.path(), &cdn.host(), &manifest.chunk_dir()).unwrap(),
    );
    let build = buildfs::MountedBuild::new(manifest, storage.clone(), "TEST");

    let progress = Progress::new();
    let cancel = CancelFlag::new();
    let summary = build.preload(2, &progress, &cancel);
    assert_eq!(summary.processed, 2);
    let summary = build.verify_all(2, &progress, &cancel);
    assert_eq!(summary.processed, 2);
    assert_eq!(summary.reacquired, 0);
    let summary = build.purge_unused(&progress, &cancel);
    assert_eq!(summary.deleted, 0);
}
