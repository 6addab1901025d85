use std::collections::BTreeMap;
use std::sync::Arc;

use bitflags::bitflags;

use crate::manifest::ManifestFile;
use crate::{Error, Result};

/// Paths from the bridge may use either separator.
fn is_separator(c: char) -> bool {
    c == '/' || c == '\\'
}

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split(is_separator).filter(|s| !s.is_empty())
}

/// A node in the virtual tree: either a subdirectory or a leaf payload.
#[derive(Debug)]
pub enum Node<T> {
    Directory(DirTree<T>),
    File(T),
}

/// Directory tree with ordered children, so listings enumerate
/// deterministically for marker-based continuation.
#[derive(Debug)]
pub struct DirTree<T> {
    children: BTreeMap<String, Node<T>>,
}

impl<T> Default for DirTree<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> DirTree<T> {
    pub fn new() -> Self {
        Self {
            children: BTreeMap::new(),
        }
    }

    /// Inserts a file, creating intermediate directories. A path that
    /// walks through an existing file is dropped, as is the empty path.
    pub fn insert(&mut self, path: &str, data: T) {
        let parts: Vec<&str> = segments(path).collect();
        let Some((last, dirs)) = parts.split_last() else {
            return;
        };
        let mut node = self;
        for dir in dirs {
            let child = node
                .children
                .entry((*dir).to_string())
                .or_insert_with(|| Node::Directory(DirTree::new()));
            match child {
                Node::Directory(tree) => node = tree,
                Node::File(_) => return,
            }
        }
        node.children.insert((*last).to_string(), Node::File(data));
    }

    /// Looks up a path relative to this directory. The empty path (the
    /// directory itself) is not a child; callers handle it separately.
    pub fn get(&self, path: &str) -> Option<&Node<T>> {
        let parts: Vec<&str> = segments(path).collect();
        let (last, dirs) = parts.split_last()?;
        let mut node = self;
        for dir in dirs {
            match node.children.get(*dir)? {
                Node::Directory(tree) => node = tree,
                Node::File(_) => return None,
            }
        }
        node.children.get(*last)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &Node<T>)> {
        self.children.iter().map(|(name, node)| (name.as_str(), node))
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }
}

bitflags! {
    /// Windows-style attribute bits surfaced to the bridge.
    pub struct FileAttributes: u32 {
        const READ_ONLY = 0x0001;
        const DIRECTORY = 0x0010;
        const ARCHIVE   = 0x0020;
    }
}

/// Per-file metadata handed to the bridge. Timestamps are synthesized and
/// constant; zero means "not tracked".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileInfo {
    pub attributes: FileAttributes,
    pub size: u64,
    pub creation_time: u64,
    pub access_time: u64,
    pub write_time: u64,
    pub change_time: u64,
}

impl FileInfo {
    pub fn directory() -> Self {
        Self {
            attributes: FileAttributes::DIRECTORY | FileAttributes::READ_ONLY,
            size: 0,
            creation_time: 0,
            access_time: 0,
            write_time: 0,
            change_time: 0,
        }
    }

    pub fn file(size: u64) -> Self {
        Self {
            attributes: FileAttributes::READ_ONLY | FileAttributes::ARCHIVE,
            size,
            creation_time: 0,
            access_time: 0,
            write_time: 0,
            change_time: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct VolumeInfo {
    pub label: String,
    pub total_size: u64,
    pub free_size: u64,
}

#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub info: FileInfo,
}

/// Outcome of a read callback: end-of-file is distinct from a transient
/// zero-byte transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    Data(usize),
    EndOfFile,
}

/// The file reference registered with the bridge at mount time.
pub type FileRef = Arc<ManifestFile>;

/// A successfully opened node.
#[derive(Debug, Clone)]
pub enum Opened {
    Directory,
    File(FileRef),
}

/// Static security for every node: read and execute for everyone,
/// protected from inheritance.
pub const WORLD_READ_EXECUTE_SDDL: &str = "D:P(A;ID;FRFX;;;WD)";

/// Callback surface the user-mode filesystem bridge drives. The core
/// implements this; the bridge is the only caller. Every mutating
/// operation is rejected with access-denied.
pub trait VolumeProvider: Send + Sync {
    fn volume_info(&self) -> VolumeInfo;

    fn security_descriptor(&self) -> &str {
        WORLD_READ_EXECUTE_SDDL
    }

    fn open(&self, path: &str) -> Result<Opened>;

    fn file_info(&self, path: &str) -> Result<FileInfo>;

    fn read(&self, file: &FileRef, buffer: &mut [u8], offset: u64) -> Result<ReadOutcome>;

    /// Lists a directory; `.` and `..` are synthesized for non-root
    /// directories.
    fn read_directory(&self, path: &str) -> Result<Vec<DirEntry>>;

    fn write(&self, _file: &FileRef, _buffer: &[u8], _offset: u64) -> Result<u32> {
        Err(Error::AccessDenied)
    }

    fn set_file_size(&self, _file: &FileRef, _size: u64) -> Result<()> {
        Err(Error::AccessDenied)
    }

    fn rename(&self, _from: &str, _to: &str) -> Result<()> {
        Err(Error::AccessDenied)
    }

    fn unlink(&self, _path: &str) -> Result<()> {
        Err(Error::AccessDenied)
    }

    fn set_security(&self, _path: &str, _descriptor: &str) -> Result<()> {
        Err(Error::AccessDenied)
    }
}
