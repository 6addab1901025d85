use std::io::Write;

use flate2::write::ZlibEncoder;
use flate2::Compression;
use miniz_oxide::inflate::decompress_to_vec_zlib;

use crate::{Error, Result};

/// Effort level for recompressing chunks into the local cache.
///
/// Only zlib has a level ladder; lz4 block compression is level-less.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionLevel {
    Fastest,
    Fast,
    Normal,
    Slow,
    Slowest,
}

impl CompressionLevel {
    pub fn zlib_level(self) -> u32 {
        match self {
            CompressionLevel::Fastest => 1,
            CompressionLevel::Fast => 4,
            CompressionLevel::Normal => 6,
            CompressionLevel::Slow => 8,
            CompressionLevel::Slowest => 9,
        }
    }
}

impl Default for CompressionLevel {
    fn default() -> Self {
        CompressionLevel::Slow
    }
}

pub fn zlib_compress(level: CompressionLevel, data: &[u8]) -> Result<Vec<u8>> {
    let out = Vec::with_capacity(data.len() / 2 + 64);
    let mut encoder = ZlibEncoder::new(out, Compression::new(level.zlib_level()));
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

pub fn zlib_decompress(data: &[u8], expected_size: usize) -> Result<Vec<u8>> {
    let out = decompress_to_vec_zlib(data).map_err(|_| Error::DecompressFailed)?;
    if out.len() != expected_size {
        return Err(Error::DecompressFailed);
    }
    Ok(out)
}

pub fn lz4_compress(data: &[u8]) -> Vec<u8> {
    lz4_flex::block::compress(data)
}

pub fn lz4_decompress(data: &[u8], expected_size: usize) -> Result<Vec<u8>> {
    let out = lz4_flex::block::decompress(data, expected_size)
        .map_err(|_| Error::DecompressFailed)?;
    if out.len() != expected_size {
        return Err(Error::DecompressFailed);
    }
    Ok(out)
}
