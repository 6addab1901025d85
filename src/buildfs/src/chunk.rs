use std::ops::Range;

use bytes::Buf;
use sha1::{Digest, Sha1};

use crate::compression::zlib_decompress;
use crate::guid::Guid;
use crate::{Error, Result};

pub const CHUNK_HEADER_MAGIC: u32 = 0xB1FE3AA2;

/// `stored_as` bits in the CDN envelope.
pub const CHUNK_STORED_COMPRESSED: u8 = 0x01;
pub const CHUNK_STORED_ENCRYPTED: u8 = 0x02;

/// Chunks before the v3 header carry no uncompressed size; they are always
/// one window of this size.
pub const CHUNK_DEFAULT_WINDOW: u32 = 1024 * 1024;

const HEADER_V1_SIZE: usize = 41; // magic, version, header_size, data_size_compressed, guid, rolling_hash, stored_as
const HEADER_V2_SIZE: usize = HEADER_V1_SIZE + 21; // + sha1, hash_type
const HEADER_V3_SIZE: usize = HEADER_V2_SIZE + 4; // + data_size_uncompressed

/// Parsed CDN chunk envelope header. The wire layout is little-endian.
#[derive(Debug, Clone)]
pub struct CdnChunkHeader {
    pub version: u32,
    pub header_size: u32,
    pub data_size_compressed: u32,
    pub guid: Guid,
    pub rolling_hash: u64,
    pub stored_as: u8,
    pub sha1: Option<[u8; 20]>,
    pub hash_type: u8,
    pub data_size_uncompressed: u32,
}

impl CdnChunkHeader {
    pub fn is_compressed(&self) -> bool {
        self.stored_as & CHUNK_STORED_COMPRESSED != 0
    }
}

/// Parses a CDN chunk envelope, returning the header and the payload range
/// within `data`.
///
/// # Errors
///
/// `BadEnvelope` on magic mismatch or truncation, `Encrypted` when the
/// payload is marked encrypted.
pub fn parse(data: &[u8]) -> Result<(CdnChunkHeader, Range<usize>)> {
    if data.len() < HEADER_V1_SIZE {
        return Err(Error::BadEnvelope("truncated header"));
    }

    let mut cursor = data;
    let magic = cursor.get_u32_le();
    if magic != CHUNK_HEADER_MAGIC {
        return Err(Error::BadEnvelope("magic mismatch"));
    }
    let version = cursor.get_u32_le();
    let header_size = cursor.get_u32_le();
    let data_size_compressed = cursor.get_u32_le();
    let mut guid_bytes = [0u8; 16];
    cursor.copy_to_slice(&mut guid_bytes);
    let rolling_hash = cursor.get_u64_le();
    let stored_as = cursor.get_u8();

    let mut header = CdnChunkHeader {
        version,
        header_size,
        data_size_compressed,
        guid: Guid::from_bytes(guid_bytes),
        rolling_hash,
        stored_as,
        sha1: None,
        hash_type: 0,
        data_size_uncompressed: CHUNK_DEFAULT_WINDOW,
    };

    let mut payload_start = HEADER_V1_SIZE;
    if version >= 2 {
        if data.len() < HEADER_V2_SIZE {
            return Err(Error::BadEnvelope("truncated v2 header"));
        }
        let mut sha = [0u8; 20];
        cursor.copy_to_slice(&mut sha);
        header.sha1 = Some(sha);
        header.hash_type = cursor.get_u8();
        payload_start = HEADER_V2_SIZE;

        if version >= 3 {
            if data.len() < HEADER_V3_SIZE {
                return Err(Error::BadEnvelope("truncated v3 header"));
            }
            header.data_size_uncompressed = cursor.get_u32_le();
            payload_start = HEADER_V3_SIZE;

            if version > 3 {
                // later versions position the payload explicitly
                payload_start = header.header_size as usize;
                if payload_start < HEADER_V3_SIZE {
                    return Err(Error::BadEnvelope("header size too small"));
                }
            }
        }
    }

    if header.stored_as & CHUNK_STORED_ENCRYPTED != 0 {
        return Err(Error::Encrypted);
    }

    let payload_end = payload_start
        .checked_add(header.data_size_compressed as usize)
        .ok_or(Error::BadEnvelope("payload size overflow"))?;
    if data.len() < payload_end {
        return Err(Error::BadEnvelope("truncated payload"));
    }

    Ok((header, payload_start..payload_end))
}

/// Expands the payload to the chunk's decompressed window.
pub fn decode(header: &CdnChunkHeader, payload: &[u8]) -> Result<Vec<u8>> {
    if header.is_compressed() {
        zlib_decompress(payload, header.data_size_uncompressed as usize)
    } else if payload.len() == header.data_size_uncompressed as usize {
        Ok(payload.to_vec())
    } else {
        Err(Error::BadEnvelope("stored payload does not match window size"))
    }
}

pub fn sha1_of(data: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}

pub fn verify(data: &[u8], expected: &[u8; 20]) -> bool {
    sha1_of(data) == *expected
}
