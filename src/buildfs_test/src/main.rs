use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::Level;
use simple_logger::init_with_level;

use buildfs::http::HttpService;
use buildfs::manifest::{download_manifest, fetch_manifest_info, Manifest};
use buildfs::stats::readable_size;
use buildfs::{CancelFlag, MountedBuild, Progress, ReadOutcome, Storage, StorageConfig};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_with_level(Level::Info)?;

    dotenv::dotenv().ok();

    let manifest_info_url = dotenv::var("MANIFEST_INFO_URL")?;
    let token = dotenv::var("AUTH_TOKEN").ok();
    let cache_dir = dotenv::var("CACHE_DIR").unwrap_or_else(|_| String::from("cached_build"));

    let http = HttpService::new(Duration::from_secs(30))?;
    let info = fetch_manifest_info(&http, &manifest_info_url, token.as_deref())?;
    log::info!(
        "{} {} ({})",
        info.app_name,
        info.build_version,
        info.label_name
    );

    let manifest_data = download_manifest(&http, &info, Some(Path::new(&cache_dir)))?;
    log::info!("parsing manifest");
    let manifest = Arc::new(Manifest::parse(&manifest_data, info.cloud_dir()?)?);
    log::info!(
        "{} files, {} chunks, install {} / download {}",
        manifest.files().len(),
        manifest.chunk_count(),
        readable_size(manifest.install_size()),
        readable_size(manifest.download_size())
    );

    let config = StorageConfig::new(&cache_dir);
    let storage = Arc::new(Storage::open(
        config.storage_flags(),
        &config.cache_dir,
        manifest.cloud_host(),
        &manifest.chunk_dir(),
    )?);
    let build = MountedBuild::new(manifest, storage, "BUILDFS");

    if dotenv::var("PRELOAD").map(|v| v == "1").unwrap_or(false) {
        let progress = Progress::new();
        let cancel = CancelFlag::new();
        let done = AtomicBool::new(false);
        let summary = std::thread::scope(|scope| {
            let progress_ref = &progress;
            let done_ref = &done;
            scope.spawn(move || {
                while !done_ref.load(Ordering::Relaxed) {
                    std::thread::sleep(Duration::from_millis(500));
                    log::info!(
                        "preloaded {} / {}",
                        progress_ref.completed(),
                        progress_ref.total()
                    );
                }
            });
            let summary = build.preload(usize::from(config.thread_count), &progress, &cancel);
            done.store(true, Ordering::Relaxed);
            summary
        });
        log::info!(
            "preload finished: {} ok, {} failed",
            summary.processed,
            summary.failed
        );
    }

    // smoke-read the head of the first file
    if let Some(file) = build.manifest().files().first().cloned() {
        let mut head = vec![0u8; file.file_size().min(4096) as usize];
        match build.read_file(&file, &mut head, 0)? {
            ReadOutcome::Data(n) => log::info!("read {} bytes of {}", n, file.path),
            ReadOutcome::EndOfFile => log::info!("{} is empty", file.path),
        }
    }

    let snapshot = build.storage().stats().snapshot();
    log::info!(
        "downloads: {} ({}), reads: {} ({})",
        snapshot.downloads,
        readable_size(snapshot.downloaded_bytes),
        snapshot.file_reads,
        readable_size(snapshot.provided_bytes)
    );

    Ok(())
}
