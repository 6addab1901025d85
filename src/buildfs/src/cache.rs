use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, WriteBytesExt};
use bytes::Buf;
use walkdir::WalkDir;

use crate::compression::{lz4_compress, lz4_decompress, zlib_compress, zlib_decompress, CompressionLevel};
use crate::guid::Guid;
use crate::{Error, Result};

pub const CACHED_CHUNK_VERSION: u16 = 0;

/// Storage form of a cached chunk, recorded in the file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachedForm {
    Decompressed,
    Zlib,
    Lz4,
}

impl CachedForm {
    pub fn flags(self) -> u16 {
        match self {
            CachedForm::Decompressed => 0x0001,
            CachedForm::Zlib => 0x0004,
            CachedForm::Lz4 => 0x0008,
        }
    }

    pub fn from_flags(flags: u16) -> Result<Self> {
        match flags {
            0x0001 => Ok(CachedForm::Decompressed),
            0x0004 => Ok(CachedForm::Zlib),
            0x0008 => Ok(CachedForm::Lz4),
            _ => Err(Error::BadEnvelope("unknown cached chunk flags")),
        }
    }
}

/// Compresses a decompressed window into the given local form, returning
/// the header flags and payload to write.
pub fn reencode(
    decompressed: &[u8],
    form: CachedForm,
    level: CompressionLevel,
) -> Result<(u16, Vec<u8>)> {
    let payload = match form {
        CachedForm::Decompressed => decompressed.to_vec(),
        CachedForm::Zlib => zlib_compress(level, decompressed)?,
        CachedForm::Lz4 => lz4_compress(decompressed),
    };
    Ok((form.flags(), payload))
}

/// Local chunk cache: `<root>/<XX>/<32-hex-guid>` where `XX` is the first
/// two hex digits of the guid in network byte order.
#[derive(Debug, Clone)]
pub struct CacheDirectory {
    root: PathBuf,
}

impl CacheDirectory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_of(&self, guid: Guid) -> PathBuf {
        let name = guid.to_string();
        self.root.join(&name[0..2]).join(name)
    }

    /// Creates the cache root and all 256 two-hex shard directories.
    pub fn ensure_layout(&self) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        for i in 0..256 {
            fs::create_dir_all(self.root.join(format!("{:02X}", i)))?;
        }
        Ok(())
    }

    pub fn contains(&self, guid: Guid) -> bool {
        self.path_of(guid).is_file()
    }

    pub fn remove(&self, guid: Guid) -> Result<()> {
        match fs::remove_file(self.path_of(guid)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Writes the complete cached envelope in a single create-truncate-write
    /// so concurrent readers never observe a partial chunk.
    pub fn write_cached(
        &self,
        guid: Guid,
        form: CachedForm,
        decompressed_size: u32,
        payload: &[u8],
    ) -> Result<()> {
        let mut out = Vec::with_capacity(payload.len() + 8);
        out.write_u16::<LittleEndian>(CACHED_CHUNK_VERSION)?;
        out.write_u16::<LittleEndian>(form.flags())?;
        if form != CachedForm::Decompressed {
            out.write_u32::<LittleEndian>(decompressed_size)?;
        }
        out.write_all(payload)?;
        fs::write(self.path_of(guid), out)?;
        Ok(())
    }

    /// Reads a cached chunk back to its decompressed bytes.
    pub fn read_cached(&self, guid: Guid) -> Result<Vec<u8>> {
        let data = fs::read(self.path_of(guid))?;
        if data.len() < 4 {
            return Err(Error::BadEnvelope("truncated cached chunk"));
        }
        let mut cursor = &data[..];
        let version = cursor.get_u16_le();
        if version != CACHED_CHUNK_VERSION {
            return Err(Error::BadEnvelope("unknown cached chunk version"));
        }
        let form = CachedForm::from_flags(cursor.get_u16_le())?;
        match form {
            CachedForm::Decompressed => Ok(cursor.to_vec()),
            CachedForm::Zlib | CachedForm::Lz4 => {
                if cursor.remaining() < 4 {
                    return Err(Error::BadEnvelope("truncated cached chunk"));
                }
                let decompressed_size = cursor.get_u32_le() as usize;
                if form == CachedForm::Zlib {
                    zlib_decompress(cursor, decompressed_size)
                } else {
                    lz4_decompress(cursor, decompressed_size)
                }
            }
        }
    }

    /// Walks the two-level layout, yielding every well-formed chunk file.
    /// Subtrees whose directory name is not exactly two hex characters are
    /// pruned; file names that do not parse as 32-hex guids are skipped.
    pub fn iter_chunk_files(&self) -> impl Iterator<Item = (Guid, PathBuf)> {
        WalkDir::new(&self.root)
            .min_depth(1)
            .max_depth(2)
            .into_iter()
            .filter_entry(|entry| entry.depth() != 1 || is_shard_dir_name(entry.file_name()))
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.depth() == 2 && entry.file_type().is_file())
            .filter_map(|entry| {
                let name = entry.file_name().to_str()?;
                let guid = Guid::from_hex(name).ok()?;
                Some((guid, entry.into_path()))
            })
    }

    pub fn chunk_file_count(&self) -> usize {
        self.iter_chunk_files().count()
    }
}

fn is_shard_dir_name(name: &std::ffi::OsStr) -> bool {
    match name.to_str() {
        Some(s) => s.len() == 2 && s.bytes().all(|b| b.is_ascii_hexdigit()),
        None => false,
    }
}
