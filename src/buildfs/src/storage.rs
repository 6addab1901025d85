use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bitflags::bitflags;

use crate::cache::{self, CacheDirectory, CachedForm};
use crate::chunk as codec;
use crate::compression::CompressionLevel;
use crate::http::HttpService;
use crate::manifest::ManifestChunk;
use crate::pool::{ChunkPool, ChunkState};
use crate::stats::Stats;
use crate::{Error, Result};

bitflags! {
    /// Storage behavior bits: exactly one storage form, at most one level
    /// bit, plus `VERIFY_HASHES`.
    pub struct StorageFlags: u32 {
        /// Chunks are stored as solid decompressed blocks.
        const DECOMPRESSED       = 0x0000_0001;
        /// Chunks keep the form they arrived in from the CDN.
        const KEEP_AS_DOWNLOADED = 0x0000_0002;
        /// Chunks are recompressed with zlib.
        const COMPRESS_ZLIB      = 0x0000_0004;
        /// Chunks are recompressed with LZ4.
        const COMPRESS_LZ4       = 0x0000_0008;

        const COMPRESS_FASTEST   = 0x0000_0010;
        const COMPRESS_FAST      = 0x0000_0020;
        const COMPRESS_NORMAL    = 0x0000_0040;
        const COMPRESS_SLOW      = 0x0000_0080;
        const COMPRESS_SLOWEST   = 0x0000_0100;

        /// Verify the SHA-1 of disk-loaded chunks on every read.
        const VERIFY_HASHES      = 0x0000_1000;
    }
}

impl StorageFlags {
    pub fn compression_level(self) -> CompressionLevel {
        if self.contains(StorageFlags::COMPRESS_FASTEST) {
            CompressionLevel::Fastest
        } else if self.contains(StorageFlags::COMPRESS_FAST) {
            CompressionLevel::Fast
        } else if self.contains(StorageFlags::COMPRESS_SLOW) {
            CompressionLevel::Slow
        } else if self.contains(StorageFlags::COMPRESS_SLOWEST) {
            CompressionLevel::Slowest
        } else {
            CompressionLevel::Normal
        }
    }
}

/// Storage form for freshly downloaded chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionMethod {
    KeepAsDownloaded,
    Decompressed,
    Lz4,
    Zlib,
}

/// Recognized configuration, lowering to `StorageFlags`.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub cache_dir: PathBuf,
    pub compression_method: CompressionMethod,
    pub compression_level: CompressionLevel,
    pub buffer_count: u16,
    pub thread_count: u16,
    pub verify_hashes: bool,
}

impl StorageConfig {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            compression_method: CompressionMethod::Lz4,
            compression_level: CompressionLevel::Slow,
            buffer_count: DEFAULT_BUFFER_COUNT,
            thread_count: num_cpus::get().min(64) as u16,
            verify_hashes: true,
        }
    }

    pub fn storage_flags(&self) -> StorageFlags {
        let mut flags = match self.compression_method {
            CompressionMethod::KeepAsDownloaded => StorageFlags::KEEP_AS_DOWNLOADED,
            CompressionMethod::Decompressed => StorageFlags::DECOMPRESSED,
            CompressionMethod::Lz4 => StorageFlags::COMPRESS_LZ4,
            CompressionMethod::Zlib => StorageFlags::COMPRESS_ZLIB,
        };
        flags |= match self.compression_level {
            CompressionLevel::Fastest => StorageFlags::COMPRESS_FASTEST,
            CompressionLevel::Fast => StorageFlags::COMPRESS_FAST,
            CompressionLevel::Normal => StorageFlags::COMPRESS_NORMAL,
            CompressionLevel::Slow => StorageFlags::COMPRESS_SLOW,
            CompressionLevel::Slowest => StorageFlags::COMPRESS_SLOWEST,
        };
        if self.verify_hashes {
            flags |= StorageFlags::VERIFY_HASHES;
        }
        flags
    }
}

/// Result of verifying a single cached chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    Verified,
    Reacquired,
    Missing,
}

pub const DEFAULT_BUFFER_COUNT: u16 = 128;
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// The chunk storage engine: content-addressed local cache in front of the
/// CDN, with an in-memory pool of hot decompressed chunks. All methods are
/// thread-safe.
pub struct Storage {
    flags: StorageFlags,
    cache: CacheDirectory,
    http: HttpService,
    cloud_host: String,
    cloud_dir: String,
    pool: ChunkPool,
    stats: Arc<Stats>,
}

impl Storage {
    pub fn open(
        flags: StorageFlags,
        cache_root: impl Into<PathBuf>,
        cloud_host: &str,
        cloud_dir: &str,
    ) -> Result<Self> {
        Self::open_with(
            flags,
            cache_root,
            cloud_host,
            cloud_dir,
            DEFAULT_BUFFER_COUNT,
            DEFAULT_HTTP_TIMEOUT,
        )
    }

    pub fn open_with(
        flags: StorageFlags,
        cache_root: impl Into<PathBuf>,
        cloud_host: &str,
        cloud_dir: &str,
        buffer_count: u16,
        http_timeout: Duration,
    ) -> Result<Self> {
        let cache = CacheDirectory::new(cache_root);
        cache.ensure_layout()?;

        let cloud_host = cloud_host.trim_end_matches('/').to_string();
        let mut cloud_dir = cloud_dir.to_string();
        if !cloud_dir.starts_with('/') {
            cloud_dir.insert(0, '/');
        }
        if !cloud_dir.ends_with('/') {
            cloud_dir.push('/');
        }

        Ok(Self {
            flags,
            cache,
            http: HttpService::new(http_timeout)?,
            cloud_host,
            cloud_dir,
            pool: ChunkPool::new(usize::from(buffer_count.max(1))),
            stats: Arc::new(Stats::new()),
        })
    }

    pub fn flags(&self) -> StorageFlags {
        self.flags
    }

    pub fn cache(&self) -> &CacheDirectory {
        &self.cache
    }

    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    pub fn chunk_url(&self, chunk: &ManifestChunk) -> String {
        format!("{}{}{}", self.cloud_host, self.cloud_dir, chunk.url_path())
    }

    pub fn chunk_present(&self, chunk: &ManifestChunk) -> bool {
        self.cache.contains(chunk.guid)
    }

    /// Fetches a chunk into the cache. Idempotent: present chunks are left
    /// alone and `on_bytes` is not invoked for them.
    pub fn download(&self, chunk: &ManifestChunk, mut on_bytes: impl FnMut(&[u8])) -> Result<()> {
        if self.chunk_present(chunk) {
            return Ok(());
        }
        self.fetch_and_store(chunk, &mut on_bytes)?;
        Ok(())
    }

    /// Checks a cached chunk's SHA-1, replacing it from the CDN on
    /// mismatch.
    pub fn verify(&self, chunk: &ManifestChunk) -> Result<VerifyOutcome> {
        if !self.chunk_present(chunk) {
            return Ok(VerifyOutcome::Missing);
        }

        let intact = match self.cache.read_cached(chunk.guid) {
            Ok(data) => codec::verify(&data, &chunk.sha1),
            Err(Error::BadEnvelope(_)) | Err(Error::DecompressFailed) => false,
            Err(err) => return Err(err),
        };
        if intact {
            return Ok(VerifyOutcome::Verified);
        }

        log::warn!("chunk {} failed verification, reacquiring", chunk.guid);
        self.cache.remove(chunk.guid)?;
        self.pool.remove(chunk.guid);
        self.fetch_and_store(chunk, &mut |_| {})?;
        Ok(VerifyOutcome::Reacquired)
    }

    /// Copies `out.len()` bytes at `offset` of the chunk's decompressed
    /// window into `out`, acquiring the chunk through the pool.
    ///
    /// Concurrent calls for the same chunk perform exactly one fetch or
    /// disk read; late callers wait on the entry and copy from the shared
    /// buffer.
    pub fn read_part(&self, chunk: &ManifestChunk, offset: u32, out: &mut [u8]) -> Result<()> {
        if out.is_empty() {
            return Ok(());
        }
        let started = Instant::now();
        let buffer = self.acquire_readable(chunk)?;

        let start = offset as usize;
        let end = start
            .checked_add(out.len())
            .filter(|&end| end <= buffer.len())
            .ok_or(Error::BadEnvelope("part range outside chunk window"))?;
        out.copy_from_slice(&buffer[start..end]);
        self.stats.record_latency(started.elapsed());
        Ok(())
    }

    fn acquire_readable(&self, chunk: &ManifestChunk) -> Result<Arc<Vec<u8>>> {
        let entry = match self.pool.get(chunk.guid) {
            Some(entry) => entry,
            None => {
                // probe the disk before taking the pool lock
                let initial = if self.cache.contains(chunk.guid) {
                    ChunkState::Available
                } else {
                    ChunkState::Unavailable
                };
                self.pool.insert(chunk.guid, initial)
            }
        };

        let mut state = entry.state.lock().unwrap();
        loop {
            match state.clone() {
                ChunkState::Readable(buffer) => return Ok(buffer),
                ChunkState::Downloading | ChunkState::Reading => {
                    state = entry.ready.wait(state).unwrap();
                }
                ChunkState::Available => {
                    *state = ChunkState::Reading;
                    drop(state);
                    match self.load_cached(chunk) {
                        Ok(buffer) => {
                            let buffer = Arc::new(buffer);
                            entry.publish(ChunkState::Readable(buffer.clone()));
                            return Ok(buffer);
                        }
                        Err(
                            Error::IntegrityFailed { .. }
                            | Error::BadEnvelope(_)
                            | Error::DecompressFailed,
                        ) => {
                            // drop the bad copy and fall back to a fresh
                            // download; a second integrity failure surfaces
                            log::warn!(
                                "cached chunk {} is corrupt, refetching",
                                chunk.guid
                            );
                            let removed = self.cache.remove(chunk.guid);
                            entry.publish(ChunkState::Unavailable);
                            removed?;
                            state = entry.state.lock().unwrap();
                        }
                        Err(err) => {
                            entry.publish(ChunkState::Unavailable);
                            return Err(err);
                        }
                    }
                }
                ChunkState::Unavailable => {
                    *state = ChunkState::Downloading;
                    drop(state);
                    match self.fetch_and_store(chunk, &mut |_| {}) {
                        Ok(buffer) => {
                            let buffer = Arc::new(buffer);
                            entry.publish(ChunkState::Readable(buffer.clone()));
                            return Ok(buffer);
                        }
                        Err(err) => {
                            entry.publish(ChunkState::Unavailable);
                            return Err(err);
                        }
                    }
                }
            }
        }
    }

    fn load_cached(&self, chunk: &ManifestChunk) -> Result<Vec<u8>> {
        let data = self.cache.read_cached(chunk.guid)?;
        self.stats.record_disk_load();
        if self.flags.contains(StorageFlags::VERIFY_HASHES)
            && !codec::verify(&data, &chunk.sha1)
        {
            return Err(Error::IntegrityFailed { guid: chunk.guid });
        }
        Ok(data)
    }

    fn fetch_and_store(
        &self,
        chunk: &ManifestChunk,
        on_bytes: &mut dyn FnMut(&[u8]),
    ) -> Result<Vec<u8>> {
        let url = self.chunk_url(chunk);
        let envelope = self.http.get(&url)?;

        let (header, payload_range) = codec::parse(&envelope)?;
        let payload = &envelope[payload_range];
        let decompressed = codec::decode(&header, payload)?;
        if !codec::verify(&decompressed, &chunk.sha1) {
            return Err(Error::IntegrityFailed { guid: chunk.guid });
        }

        on_bytes(&decompressed);
        self.persist(chunk, &header, payload, &decompressed)?;
        self.stats.record_download(envelope.len() as u64);
        Ok(decompressed)
    }

    fn persist(
        &self,
        chunk: &ManifestChunk,
        header: &codec::CdnChunkHeader,
        payload: &[u8],
        decompressed: &[u8],
    ) -> Result<()> {
        let guid = chunk.guid;
        if self.flags.contains(StorageFlags::KEEP_AS_DOWNLOADED) {
            // an as-downloaded zlib payload still records the decompressed
            // size so reads inflate in one pass
            if header.is_compressed() {
                self.cache
                    .write_cached(guid, CachedForm::Zlib, decompressed.len() as u32, payload)
            } else {
                self.cache
                    .write_cached(guid, CachedForm::Decompressed, 0, payload)
            }
        } else {
            let form = if self.flags.contains(StorageFlags::COMPRESS_ZLIB) {
                CachedForm::Zlib
            } else if self.flags.contains(StorageFlags::COMPRESS_LZ4) {
                CachedForm::Lz4
            } else {
                CachedForm::Decompressed
            };
            let (_, payload) =
                cache::reencode(decompressed, form, self.flags.compression_level())?;
            self.cache
                .write_cached(guid, form, decompressed.len() as u32, &payload)
        }
    }
}
