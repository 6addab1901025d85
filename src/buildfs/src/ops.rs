use std::collections::HashSet;
use std::fs;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::bounded;

use crate::guid::Guid;
use crate::manifest::{Manifest, ManifestChunk};
use crate::storage::{Storage, VerifyOutcome};

/// Cooperative cancellation flag shared with bulk-operation workers.
#[derive(Debug, Default)]
pub struct CancelFlag {
    value: AtomicBool,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancelled(&self) -> bool {
        self.value.load(Ordering::Relaxed)
    }

    pub fn cancel(&self) {
        self.value.store(true, Ordering::Relaxed);
    }
}

/// Work counter a caller can poll from another thread.
#[derive(Debug, Default)]
pub struct Progress {
    total: AtomicU64,
    completed: AtomicU64,
}

impl Progress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_total(&self, total: u64) {
        self.total.store(total, Ordering::Relaxed);
        self.completed.store(0, Ordering::Relaxed);
    }

    pub fn complete_one(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }
}

/// Per-chunk errors inside a bulk operation are non-fatal; the summary
/// reports how the run went overall.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkSummary {
    pub processed: u64,
    pub failed: u64,
    pub reacquired: u64,
    pub deleted: u64,
    pub cancelled: bool,
}

/// Downloads every manifest chunk not yet in the cache, `thread_count`
/// transfers at a time. The progress callback ticks once per chunk,
/// including chunks that were already present.
pub fn preload_all(
    storage: &Storage,
    manifest: &Manifest,
    thread_count: usize,
    progress: &Progress,
    cancel: &CancelFlag,
) -> BulkSummary {
    let thread_count = thread_count.max(1);
    progress.set_total(manifest.chunk_count() as u64);

    let processed = AtomicU64::new(0);
    let failed = AtomicU64::new(0);

    let (tx, rx) = bounded::<Arc<ManifestChunk>>(thread_count * 2);
    thread::scope(|scope| {
        for _ in 0..thread_count {
            let rx = rx.clone();
            let processed = &processed;
            let failed = &failed;
            scope.spawn(move || {
                while let Ok(chunk) = rx.recv() {
                    if cancel.cancelled() {
                        progress.complete_one();
                        continue;
                    }
                    match storage.download(&chunk, |_| {}) {
                        Ok(()) => {
                            processed.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(err) => {
                            log::warn!("preload of chunk {} failed: {}", chunk.guid, err);
                            failed.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    progress.complete_one();
                }
            });
        }
        drop(rx);

        for chunk in manifest.chunks() {
            if cancel.cancelled() {
                break;
            }
            if storage.chunk_present(chunk) {
                processed.fetch_add(1, Ordering::Relaxed);
                progress.complete_one();
                continue;
            }
            if tx.send(chunk.clone()).is_err() {
                break;
            }
        }
        drop(tx);
    });

    BulkSummary {
        processed: processed.load(Ordering::Relaxed),
        failed: failed.load(Ordering::Relaxed),
        cancelled: cancel.cancelled(),
        ..BulkSummary::default()
    }
}

/// Verifies every cached manifest chunk, reacquiring corrupt ones.
pub fn verify_all(
    storage: &Storage,
    manifest: &Manifest,
    thread_count: usize,
    progress: &Progress,
    cancel: &CancelFlag,
) -> BulkSummary {
    let thread_count = thread_count.max(1);
    let present: Vec<Arc<ManifestChunk>> = manifest
        .chunks()
        .filter(|chunk| storage.chunk_present(chunk))
        .cloned()
        .collect();
    progress.set_total(present.len() as u64);

    let processed = AtomicU64::new(0);
    let failed = AtomicU64::new(0);
    let reacquired = AtomicU64::new(0);

    let (tx, rx) = bounded::<Arc<ManifestChunk>>(thread_count * 2);
    thread::scope(|scope| {
        for _ in 0..thread_count {
            let rx = rx.clone();
            let processed = &processed;
            let failed = &failed;
            let reacquired = &reacquired;
            scope.spawn(move || {
                while let Ok(chunk) = rx.recv() {
                    if cancel.cancelled() {
                        progress.complete_one();
                        continue;
                    }
                    match storage.verify(&chunk) {
                        Ok(VerifyOutcome::Reacquired) => {
                            reacquired.fetch_add(1, Ordering::Relaxed);
                            processed.fetch_add(1, Ordering::Relaxed);
                        }
                        Ok(_) => {
                            processed.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(err) => {
                            log::warn!("verify of chunk {} failed: {}", chunk.guid, err);
                            failed.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    progress.complete_one();
                }
            });
        }
        drop(rx);

        for chunk in present {
            if cancel.cancelled() {
                break;
            }
            if tx.send(chunk).is_err() {
                break;
            }
        }
        drop(tx);
    });

    BulkSummary {
        processed: processed.load(Ordering::Relaxed),
        failed: failed.load(Ordering::Relaxed),
        reacquired: reacquired.load(Ordering::Relaxed),
        cancelled: cancel.cancelled(),
        ..BulkSummary::default()
    }
}

/// Deletes every well-formed cache file whose guid the manifest no longer
/// references. Files outside the two-level `XX/<guid>` layout are left
/// alone.
pub fn purge_unused(
    storage: &Storage,
    manifest: &Manifest,
    progress: &Progress,
    cancel: &CancelFlag,
) -> BulkSummary {
    let live: HashSet<Guid> = manifest.chunks().map(|chunk| chunk.guid).collect();
    let chunk_files: Vec<_> = storage.cache().iter_chunk_files().collect();
    progress.set_total(chunk_files.len() as u64);

    let mut summary = BulkSummary::default();
    for (guid, path) in chunk_files {
        if cancel.cancelled() {
            summary.cancelled = true;
            break;
        }
        if !live.contains(&guid) {
            match fs::remove_file(&path) {
                Ok(()) => {
                    log::debug!("purged unused chunk {}", guid);
                    summary.deleted += 1;
                }
                Err(err) => {
                    log::warn!("failed to purge {}: {}", path.display(), err);
                    summary.failed += 1;
                }
            }
        }
        summary.processed += 1;
        progress.complete_one();
    }
    summary
}
