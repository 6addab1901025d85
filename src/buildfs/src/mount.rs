use std::sync::Arc;

use crate::fs::{
    DirEntry, DirTree, FileInfo, FileRef, Node, Opened, ReadOutcome, VolumeInfo, VolumeProvider,
};
use crate::manifest::{Manifest, ManifestFile};
use crate::ops::{self, BulkSummary, CancelFlag, Progress};
use crate::storage::Storage;
use crate::{Error, Result};

fn is_root(path: &str) -> bool {
    path.trim_matches(|c| c == '/' || c == '\\').is_empty()
}

/// A build projected as a read-only volume: the directory tree from the
/// manifest, backed by the chunk storage engine. The filesystem bridge
/// holds this behind `VolumeProvider` and calls back with the `FileRef`s
/// registered here.
pub struct MountedBuild {
    manifest: Arc<Manifest>,
    storage: Arc<Storage>,
    tree: DirTree<FileRef>,
    label: String,
}

impl MountedBuild {
    pub fn new(manifest: Arc<Manifest>, storage: Arc<Storage>, label: impl Into<String>) -> Self {
        let mut tree = DirTree::new();
        for file in manifest.files() {
            tree.insert(&file.path, file.clone());
        }
        Self {
            manifest,
            storage,
            tree,
            label: label.into(),
        }
    }

    pub fn manifest(&self) -> &Arc<Manifest> {
        &self.manifest
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// Serves one bridge read: resolves the byte range to chunk spans and
    /// splices them into `buffer`.
    ///
    /// Reads starting at or past the end report end-of-file; reads
    /// crossing the end truncate. If a later span fails after bytes were
    /// already spliced, the successfully filled prefix is returned.
    pub fn read_file(
        &self,
        file: &ManifestFile,
        buffer: &mut [u8],
        offset: u64,
    ) -> Result<ReadOutcome> {
        let file_size = file.file_size();
        if offset >= file_size {
            return Ok(ReadOutcome::EndOfFile);
        }
        let wanted = (file_size - offset).min(buffer.len() as u64);
        if wanted == 0 {
            return Ok(ReadOutcome::Data(0));
        }

        let mut written = 0usize;
        for span in file.parts_for_range(offset, wanted) {
            let len = span.size as usize;
            match self
                .storage
                .read_part(&span.chunk, span.offset, &mut buffer[written..written + len])
            {
                Ok(()) => written += len,
                Err(err) if written > 0 => {
                    log::warn!(
                        "read of {} stopped after {} bytes: {}",
                        file.path,
                        written,
                        err
                    );
                    break;
                }
                Err(err) => return Err(err),
            }
        }
        self.storage.stats().record_read(written as u64);
        Ok(ReadOutcome::Data(written))
    }

    pub fn preload(
        &self,
        thread_count: usize,
        progress: &Progress,
        cancel: &CancelFlag,
    ) -> BulkSummary {
        ops::preload_all(&self.storage, &self.manifest, thread_count, progress, cancel)
    }

    pub fn verify_all(
        &self,
        thread_count: usize,
        progress: &Progress,
        cancel: &CancelFlag,
    ) -> BulkSummary {
        ops::verify_all(&self.storage, &self.manifest, thread_count, progress, cancel)
    }

    pub fn purge_unused(&self, progress: &Progress, cancel: &CancelFlag) -> BulkSummary {
        ops::purge_unused(&self.storage, &self.manifest, progress, cancel)
    }
}

impl VolumeProvider for MountedBuild {
    fn volume_info(&self) -> VolumeInfo {
        let total = self.manifest.install_size();
        let download = self.manifest.download_size();
        VolumeInfo {
            label: self.label.clone(),
            total_size: total,
            free_size: total.saturating_sub(download),
        }
    }

    fn open(&self, path: &str) -> Result<Opened> {
        if is_root(path) {
            return Ok(Opened::Directory);
        }
        match self.tree.get(path) {
            Some(Node::Directory(_)) => Ok(Opened::Directory),
            Some(Node::File(file)) => Ok(Opened::File(file.clone())),
            None => Err(Error::NotFound(path.to_string())),
        }
    }

    fn file_info(&self, path: &str) -> Result<FileInfo> {
        if is_root(path) {
            return Ok(FileInfo::directory());
        }
        match self.tree.get(path) {
            Some(Node::Directory(_)) => Ok(FileInfo::directory()),
            Some(Node::File(file)) => Ok(FileInfo::file(file.file_size())),
            None => Err(Error::NotFound(path.to_string())),
        }
    }

    fn read(&self, file: &FileRef, buffer: &mut [u8], offset: u64) -> Result<ReadOutcome> {
        self.read_file(file, buffer, offset)
    }

    fn read_directory(&self, path: &str) -> Result<Vec<DirEntry>> {
        let root = is_root(path);
        let dir = if root {
            &self.tree
        } else {
            match self.tree.get(path) {
                Some(Node::Directory(dir)) => dir,
                Some(Node::File(_)) | None => return Err(Error::NotFound(path.to_string())),
            }
        };

        let mut entries = Vec::with_capacity(dir.len() + 2);
        if !root {
            entries.push(DirEntry {
                name: ".".to_string(),
                info: FileInfo::directory(),
            });
            entries.push(DirEntry {
                name: "..".to_string(),
                info: FileInfo::directory(),
            });
        }
        for (name, node) in dir.entries() {
            entries.push(DirEntry {
                name: name.to_string(),
                info: match node {
                    Node::Directory(_) => FileInfo::directory(),
                    Node::File(file) => FileInfo::file(file.file_size()),
                },
            });
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CachedForm;
    use crate::fs::FileAttributes;
    use crate::manifest::CloudDir;
    use crate::storage::StorageFlags;
    use serde_json::json;

    fn blob(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{:03}", b)).collect()
    }

    const GUID_A: &str = "AA000000000000000000000000000001";
    const GUID_B: &str = "BB000000000000000000000000000002";

    fn manifest() -> Arc<Manifest> {
        let doc = json!({
            "ManifestFileVersion": blob(&12u32.to_le_bytes()),
            "AppID": blob(&1u32.to_le_bytes()),
            "AppNameString": "ExampleGame",
            "BuildVersionString": "1.0.0-r1",
            "LaunchExeString": "bin/a",
            "LaunchCommand": "",
            "ChunkHashList": {
                GUID_A: blob(&1u64.to_le_bytes()),
                GUID_B: blob(&2u64.to_le_bytes()),
            },
            "ChunkShaList": {
                GUID_A: "1111111111111111111111111111111111111111",
                GUID_B: "2222222222222222222222222222222222222222",
            },
            "DataGroupList": { GUID_A: "00", GUID_B: "01" },
            "ChunkFilesizeList": {
                GUID_A: blob(&500u64.to_le_bytes()),
                GUID_B: blob(&600u64.to_le_bytes()),
            },
            "FileManifestList": [
                {
                    "Filename": "bin/a",
                    "FileHash": blob(&[0u8; 20]),
                    "FileChunkParts": [
                        { "Guid": GUID_A, "Offset": blob(&100u32.to_le_bytes()), "Size": blob(&400u32.to_le_bytes()) },
                        { "Guid": GUID_B, "Offset": blob(&0u32.to_le_bytes()), "Size": blob(&600u32.to_le_bytes()) }
                    ]
                },
                {
                    "Filename": "data/pak/small.pak",
                    "FileHash": blob(&[0u8; 20]),
                    "FileChunkParts": [
                        { "Guid": GUID_B, "Offset": blob(&0u32.to_le_bytes()), "Size": blob(&100u32.to_le_bytes()) }
                    ]
                }
            ]
        });
        Arc::new(
            Manifest::parse(
                doc.to_string().as_bytes(),
                CloudDir {
                    host: "http://127.0.0.1:9".to_string(),
                    path: "/cloud".to_string(),
                },
            )
            .unwrap(),
        )
    }

    fn window(seed: u8, len: usize) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(seed).wrapping_add(seed)).collect()
    }

    fn mounted() -> (tempfile::TempDir, MountedBuild) {
        let dir = tempfile::tempdir().unwrap();
        let manifest = manifest();
        // no VERIFY_HASHES: reads must come straight from the seeded cache
        let storage = Arc::new(
            Storage::open(
                StorageFlags::DECOMPRESSED,
                dir.path(),
                "http://127.0.0.1:9",
                &manifest.chunk_dir(),
            )
            .unwrap(),
        );
        for chunk in manifest.chunks() {
            let seed = if chunk.guid.to_string().starts_with("AA") { 3 } else { 5 };
            storage
                .cache()
                .write_cached(
                    chunk.guid,
                    CachedForm::Decompressed,
                    0,
                    &window(seed, 1024),
                )
                .unwrap();
        }
        let build = MountedBuild::new(manifest, storage, "BUILDFS");
        (dir, build)
    }

    #[test]
    fn volume_info_from_sizes() {
        let (_dir, build) = mounted();
        let info = build.volume_info();
        assert_eq!(info.label, "BUILDFS");
        assert_eq!(info.total_size, 1000 + 100);
        // install 1100, download 1100: nothing left to fetch
        assert_eq!(info.free_size, 0);
    }

    #[test]
    fn open_and_file_info() {
        let (_dir, build) = mounted();
        assert!(matches!(build.open("/"), Ok(Opened::Directory)));
        assert!(matches!(build.open("bin"), Ok(Opened::Directory)));
        assert!(matches!(build.open("/bin/a"), Ok(Opened::File(_))));
        assert!(matches!(build.open("bin/missing"), Err(Error::NotFound(_))));

        let info = build.file_info("bin/a").unwrap();
        assert_eq!(info.size, 1000);
        assert!(info.attributes.contains(FileAttributes::READ_ONLY));
        assert!(info.attributes.contains(FileAttributes::ARCHIVE));
        assert_eq!(info.write_time, 0);

        let info = build.file_info("data").unwrap();
        assert!(info.attributes.contains(FileAttributes::DIRECTORY));
    }

    #[test]
    fn directory_listing_with_dot_entries() {
        let (_dir, build) = mounted();
        let root = build.read_directory("/").unwrap();
        let names: Vec<&str> = root.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["bin", "data"]);

        let sub = build.read_directory("data/pak").unwrap();
        let names: Vec<&str> = sub.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, [".", "..", "small.pak"]);
    }

    #[test]
    fn read_splices_across_chunks() {
        let (_dir, build) = mounted();
        let file = build.manifest().get_file("bin/a").unwrap().clone();

        let mut buffer = vec![0u8; 500];
        let outcome = build.read_file(&file, &mut buffer, 200).unwrap();
        assert_eq!(outcome, ReadOutcome::Data(500));

        let a = window(3, 1024);
        let b = window(5, 1024);
        assert_eq!(&buffer[..200], &a[300..500]);
        assert_eq!(&buffer[200..], &b[0..300]);
    }

    #[test]
    fn read_boundaries() {
        let (_dir, build) = mounted();
        let file = build.manifest().get_file("bin/a").unwrap().clone();

        // truncated tail read
        let mut buffer = vec![0u8; 1000];
        assert_eq!(
            build.read_file(&file, &mut buffer, 800).unwrap(),
            ReadOutcome::Data(200)
        );

        // at and past the end
        assert_eq!(
            build.read_file(&file, &mut buffer, 1000).unwrap(),
            ReadOutcome::EndOfFile
        );
        assert_eq!(
            build.read_file(&file, &mut buffer, 4096).unwrap(),
            ReadOutcome::EndOfFile
        );

        // zero-length
        let mut empty: Vec<u8> = Vec::new();
        assert_eq!(
            build.read_file(&file, &mut empty, 0).unwrap(),
            ReadOutcome::Data(0)
        );
    }

    #[test]
    fn writes_denied() {
        let (_dir, build) = mounted();
        let Opened::File(file) = build.open("bin/a").unwrap() else {
            panic!("expected file");
        };
        assert!(matches!(
            build.write(&file, b"data", 0),
            Err(Error::AccessDenied)
        ));
        assert!(matches!(
            build.rename("bin/a", "bin/b"),
            Err(Error::AccessDenied)
        ));
        assert!(matches!(build.unlink("bin/a"), Err(Error::AccessDenied)));
    }
}
