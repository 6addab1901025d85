#![allow(clippy::must_use_candidate,
         clippy::module_name_repetitions,
         clippy::missing_panics_doc,
         clippy::missing_errors_doc,
         clippy::unreadable_literal,
         clippy::too_many_lines)]

//! Read-only virtual filesystem over a chunked game build.
//!
//! A build's manifest describes a logical file tree whose bytes live in a
//! shared pool of content-addressed chunks on a CDN. Opening and reading a
//! file resolves the requested byte range to chunk spans, pulls each chunk
//! from the in-memory pool, the local cache, or the CDN, and splices the
//! decompressed bytes into the caller's buffer.

pub mod cache;
pub mod chunk;
pub mod compression;
pub mod error;
pub mod fs;
pub mod guid;
pub mod http;
pub mod manifest;
pub mod mount;
pub mod ops;
pub mod pool;
pub mod stats;
pub mod storage;

pub use error::{Error, Result};
pub use guid::Guid;

pub use compression::CompressionLevel;
pub use fs::{Opened, ReadOutcome, VolumeProvider};
pub use manifest::{CloudDir, Manifest, ManifestInfo};
pub use mount::MountedBuild;
pub use ops::{BulkSummary, CancelFlag, Progress};
pub use storage::{CompressionMethod, Storage, StorageConfig, StorageFlags, VerifyOutcome};
