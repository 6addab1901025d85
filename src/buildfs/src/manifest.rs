use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use http::Uri;
use serde::Deserialize;
use serde_json::Value;

use crate::chunk::CHUNK_DEFAULT_WINDOW;
use crate::guid::Guid;
use crate::http::HttpService;
use crate::{Error, Result};

/// Manifest feature level, as serialized in `ManifestFileVersion`.
///
/// Only the levels that change observable behavior are named; the full
/// ladder is a plain integer comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FeatureLevel(pub i32);

impl FeatureLevel {
    pub const ORIGINAL: FeatureLevel = FeatureLevel(0);
    /// Data files renamed to include the hash value; chunks move to ChunksV2.
    pub const DATA_FILE_RENAMES: FeatureLevel = FeatureLevel(3);
    /// Chunk compression added; chunks move to ChunksV3.
    pub const CHUNK_COMPRESSION_SUPPORT: FeatureLevel = FeatureLevel(6);
    pub const STORES_CHUNK_FILE_SIZES: FeatureLevel = FeatureLevel(8);
    /// Chunks may have a dynamic window size; chunks move to ChunksV4.
    pub const VARIABLE_SIZE_CHUNKS_WITHOUT_WINDOW_SIZE: FeatureLevel = FeatureLevel(15);
    pub const VARIABLE_SIZE_CHUNKS: FeatureLevel = FeatureLevel(16);

    /// CDN sub-directory chunk objects live under for this feature level.
    pub fn chunk_sub_dir(self) -> &'static str {
        if self < Self::DATA_FILE_RENAMES {
            "Chunks"
        } else if self < Self::CHUNK_COMPRESSION_SUPPORT {
            "ChunksV2"
        } else if self < Self::VARIABLE_SIZE_CHUNKS_WITHOUT_WINDOW_SIZE {
            "ChunksV3"
        } else {
            "ChunksV4"
        }
    }

    pub fn has_variable_window(self) -> bool {
        self >= Self::VARIABLE_SIZE_CHUNKS_WITHOUT_WINDOW_SIZE
    }
}

/// Decodes the vendor's "blob" number encoding: each 3-character group is
/// the decimal value of one byte, bytes in little-endian order.
pub fn blob_to_bytes(blob: &str) -> Result<Vec<u8>> {
    if blob.len() % 3 != 0 || !blob.is_ascii() {
        return Err(Error::Manifest(format!("bad blob: {:?}", blob)));
    }
    blob.as_bytes()
        .chunks(3)
        .map(|group| {
            std::str::from_utf8(group)
                .ok()
                .and_then(|s| s.parse::<u8>().ok())
                .ok_or_else(|| Error::Manifest(format!("bad blob group in {:?}", blob)))
        })
        .collect()
}

fn blob_to_uint(blob: &str, width: usize) -> Result<u64> {
    let bytes = blob_to_bytes(blob)?;
    if bytes.len() > width {
        return Err(Error::Manifest(format!("blob wider than {} bytes: {:?}", width, blob)));
    }
    let mut padded = [0u8; 8];
    padded[..bytes.len()].copy_from_slice(&bytes);
    Ok(u64::from_le_bytes(padded))
}

pub fn blob_to_u32(blob: &str) -> Result<u32> {
    Ok(blob_to_uint(blob, 4)? as u32)
}

pub fn blob_to_u64(blob: &str) -> Result<u64> {
    blob_to_uint(blob, 8)
}

/// SHA-1 fields appear both as 40-character hex and as 60-character blob
/// triplets depending on the field; accept either spelling.
fn decode_sha1(value: &str) -> Result<[u8; 20]> {
    let bytes = if value.len() == 40 {
        hex::decode(value).map_err(|_| Error::Manifest(format!("bad sha hex: {}", value)))?
    } else {
        blob_to_bytes(value)?
    };
    bytes
        .try_into()
        .map_err(|_| Error::Manifest("sha field is not 20 bytes".to_string()))
}

/// One entry of the launcher "elements" document: where a build's manifest
/// can be downloaded from.
#[derive(Debug)]
pub struct ManifestInfo {
    pub app_name: String,
    pub label_name: String,
    pub build_version: String,
    pub hash: String,
    pub file_name: String,
    pub uri: String,
}

impl ManifestInfo {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let json: Value = serde_json::from_slice(data)?;
        Self::from_value(&json)
    }

    pub fn from_value(json: &Value) -> Result<Self> {
        fn field<'a>(element: &'a Value, name: &str) -> Result<&'a str> {
            element
                .get(name)
                .and_then(Value::as_str)
                .ok_or_else(|| Error::Manifest(format!("missing element field {}", name)))
        }

        let element = json
            .get("elements")
            .and_then(Value::as_array)
            .and_then(|elements| elements.first())
            .ok_or_else(|| Error::Manifest("no elements in manifest info".to_string()))?;

        let app_name = field(element, "appName")?;
        let label_name = field(element, "labelName")?;
        let build_version = field(element, "buildVersion")?;
        let hash = field(element, "hash")?;

        let manifest = element
            .get("manifests")
            .and_then(Value::as_array)
            .and_then(|list| list.first())
            .ok_or_else(|| Error::Manifest("no manifests in manifest info".to_string()))?;
        let mut uri = manifest
            .get("uri")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Manifest("manifest entry has no uri".to_string()))?
            .to_owned();

        if let Some(params) = manifest.get("queryParams").and_then(Value::as_array) {
            let mut first = true;
            for param in params {
                let name = param.get("name").and_then(Value::as_str).unwrap_or_default();
                let value = param.get("value").and_then(Value::as_str).unwrap_or_default();
                uri.push(if first { '?' } else { '&' });
                uri.push_str(name);
                uri.push('=');
                uri.push_str(value);
                first = false;
            }
        }

        let parsed: Uri = uri
            .parse()
            .map_err(|_| Error::Manifest(format!("bad manifest uri: {}", uri)))?;
        let path = parsed.path();
        let file_name = path[path.rfind('/').map_or(0, |i| i + 1)..].to_owned();

        Ok(Self {
            app_name: app_name.to_owned(),
            label_name: label_name.to_owned(),
            build_version: build_version.to_owned(),
            hash: hash.to_owned(),
            file_name,
            uri,
        })
    }

    /// Splits the manifest uri into the CDN host and the directory the
    /// manifest file lives in. Chunk objects live under that directory.
    pub fn cloud_dir(&self) -> Result<CloudDir> {
        let uri: Uri = self
            .uri
            .parse()
            .map_err(|_| Error::Manifest(format!("bad manifest uri: {}", self.uri)))?;
        let scheme = uri.scheme_str().unwrap_or("https");
        let authority = uri
            .authority()
            .ok_or_else(|| Error::Manifest("manifest uri has no host".to_string()))?;
        let path = uri.path();
        let dir = &path[..path.rfind('/').unwrap_or(0)];
        Ok(CloudDir {
            host: format!("{}://{}", scheme, authority),
            path: dir.to_owned(),
        })
    }
}

/// Base location for chunk objects: `host` carries the scheme and
/// authority, `path` the directory the build's manifest was served from.
#[derive(Debug, Clone)]
pub struct CloudDir {
    pub host: String,
    pub path: String,
}

/// Fetches and parses the launcher "elements" document. `bearer` is the
/// token oracle's current token, if the endpoint wants one.
pub fn fetch_manifest_info(
    http: &HttpService,
    url: &str,
    bearer: Option<&str>,
) -> Result<ManifestInfo> {
    let data = http.get_with_bearer(url, bearer)?;
    ManifestInfo::parse(&data)
}

/// Downloads the manifest document named by `info`, reusing a cached copy
/// under `cache_dir` when one exists.
pub fn download_manifest(
    http: &HttpService,
    info: &ManifestInfo,
    cache_dir: Option<&Path>,
) -> Result<Vec<u8>> {
    if let Some(dir) = cache_dir {
        let path = dir.join(&info.file_name);
        if path.is_file() {
            return Ok(fs::read(path)?);
        }
    }

    let data = http.get(&info.uri)?;

    if let Some(dir) = cache_dir {
        fs::create_dir_all(dir)?;
        fs::write(dir.join(&info.file_name), &data)?;
    }
    Ok(data)
}

/// Immutable, content-addressed chunk descriptor.
#[derive(Debug)]
pub struct ManifestChunk {
    pub guid: Guid,
    pub hash: u64,
    pub sha1: [u8; 20],
    pub group: u8,
    pub download_size: u64,
    pub window_size: u32,
}

impl ManifestChunk {
    /// Path of the chunk object relative to the chunk directory:
    /// `GG/HHHHHHHHHHHHHHHH_<guid>.chunk`.
    pub fn url_path(&self) -> String {
        format!("{:02}/{:016X}_{}.chunk", self.group, self.hash, self.guid)
    }
}

/// A run of bytes inside one chunk's decompressed window, attributed to one
/// file.
#[derive(Debug, Clone)]
pub struct ChunkPart {
    pub chunk: Arc<ManifestChunk>,
    pub offset: u32,
    pub size: u32,
}

/// A resolved span of a read request: `size` bytes at `offset` within
/// `chunk`'s decompressed window.
#[derive(Debug, Clone)]
pub struct PartRange {
    pub chunk: Arc<ManifestChunk>,
    pub offset: u32,
    pub size: u32,
}

/// One path in the virtual tree.
#[derive(Debug)]
pub struct ManifestFile {
    pub path: String,
    pub sha1: [u8; 20],
    parts: Vec<ChunkPart>,
    size: u64,
}

impl ManifestFile {
    pub fn file_size(&self) -> u64 {
        self.size
    }

    pub fn parts(&self) -> &[ChunkPart] {
        &self.parts
    }

    /// Enumerates the chunk spans covering `length` bytes at `offset`.
    ///
    /// Requests past the end of the file truncate; requests starting at or
    /// past the end yield nothing.
    pub fn parts_for_range(&self, offset: u64, length: u64) -> PartRangeIter<'_> {
        let end = offset.saturating_add(length).min(self.size);
        if offset >= end {
            return PartRangeIter {
                parts: &self.parts,
                index: self.parts.len(),
                skip: 0,
                remaining: 0,
            };
        }

        let mut cursor = 0u64;
        let mut index = 0;
        while index < self.parts.len() {
            let part_size = u64::from(self.parts[index].size);
            if offset < cursor + part_size {
                break;
            }
            cursor += part_size;
            index += 1;
        }

        PartRangeIter {
            parts: &self.parts,
            index,
            skip: (offset - cursor) as u32,
            remaining: end - offset,
        }
    }
}

pub struct PartRangeIter<'a> {
    parts: &'a [ChunkPart],
    index: usize,
    skip: u32,
    remaining: u64,
}

impl Iterator for PartRangeIter<'_> {
    type Item = PartRange;

    fn next(&mut self) -> Option<PartRange> {
        if self.remaining == 0 || self.index >= self.parts.len() {
            return None;
        }
        let part = &self.parts[self.index];
        let available = part.size - self.skip;
        let take = u64::from(available).min(self.remaining) as u32;
        let range = PartRange {
            chunk: part.chunk.clone(),
            offset: part.offset + self.skip,
            size: take,
        };
        self.remaining -= u64::from(take);
        self.skip = 0;
        self.index += 1;
        Some(range)
    }
}

#[derive(Debug, Deserialize)]
struct RawChunkPart {
    #[serde(rename = "Guid")]
    guid: String,
    #[serde(rename = "Offset")]
    offset: String,
    #[serde(rename = "Size")]
    size: String,
}

#[derive(Debug, Deserialize)]
struct RawFileManifest {
    #[serde(rename = "Filename")]
    filename: String,
    #[serde(rename = "FileHash")]
    file_hash: String,
    #[serde(rename = "FileChunkParts")]
    chunk_parts: Vec<RawChunkPart>,
}

#[derive(Debug, Deserialize)]
struct RawManifest {
    #[serde(rename = "ManifestFileVersion")]
    manifest_file_version: String,
    #[serde(rename = "bIsFileData", default)]
    b_is_file_data: bool,
    #[serde(rename = "AppID")]
    app_id: String,
    #[serde(rename = "AppNameString")]
    app_name: String,
    #[serde(rename = "BuildVersionString")]
    build_version: String,
    #[serde(rename = "LaunchExeString", default)]
    launch_exe: String,
    #[serde(rename = "LaunchCommand", default)]
    launch_command: String,
    #[serde(rename = "ChunkHashList")]
    chunk_hash_list: HashMap<String, String>,
    #[serde(rename = "ChunkShaList")]
    chunk_sha_list: HashMap<String, String>,
    #[serde(rename = "DataGroupList")]
    data_group_list: HashMap<String, String>,
    #[serde(rename = "ChunkFilesizeList")]
    chunk_filesize_list: HashMap<String, String>,
    #[serde(rename = "FileManifestList")]
    file_manifest_list: Vec<RawFileManifest>,
}

/// Point-in-time build descriptor: the logical file tree plus the shared
/// chunk pool it draws from. Immutable once parsed.
#[derive(Debug)]
pub struct Manifest {
    pub feature_level: FeatureLevel,
    pub is_file_data: bool,
    pub app_id: u32,
    pub app_name: String,
    pub build_version: String,
    launch_exe: String,
    launch_command: String,
    files: Vec<Arc<ManifestFile>>,
    file_index: HashMap<String, usize>,
    chunks: HashMap<Guid, Arc<ManifestChunk>>,
    cloud: CloudDir,
}

impl Manifest {
    pub fn parse(data: &[u8], cloud: CloudDir) -> Result<Self> {
        let raw: RawManifest = serde_json::from_slice(data)?;

        let feature_level = FeatureLevel(blob_to_u32(&raw.manifest_file_version)? as i32);

        // the four chunk lists are keyed by the same guid hex; join by key
        let mut plain_chunks: HashMap<Guid, ManifestChunk> =
            HashMap::with_capacity(raw.chunk_hash_list.len());
        for (guid_hex, hash_blob) in &raw.chunk_hash_list {
            let guid = Guid::from_hex(guid_hex)?;
            let sha_value = raw
                .chunk_sha_list
                .get(guid_hex)
                .ok_or_else(|| Error::Manifest(format!("chunk {} missing sha", guid_hex)))?;
            let group_value = raw
                .data_group_list
                .get(guid_hex)
                .ok_or_else(|| Error::Manifest(format!("chunk {} missing group", guid_hex)))?;
            let size_value = raw
                .chunk_filesize_list
                .get(guid_hex)
                .ok_or_else(|| Error::Manifest(format!("chunk {} missing size", guid_hex)))?;

            let group = group_value
                .trim()
                .parse::<u8>()
                .map_err(|_| Error::Manifest(format!("bad data group: {}", group_value)))?;

            plain_chunks.insert(
                guid,
                ManifestChunk {
                    guid,
                    hash: blob_to_u64(hash_blob)?,
                    sha1: decode_sha1(sha_value)?,
                    group,
                    download_size: blob_to_u64(size_value)?,
                    window_size: CHUNK_DEFAULT_WINDOW,
                },
            );
        }

        // JSON manifests never serialize window sizes; with variable-size
        // chunks the window is at least the furthest referenced byte
        if feature_level.has_variable_window() {
            for file in &raw.file_manifest_list {
                for part in &file.chunk_parts {
                    let guid = Guid::from_hex(&part.guid)?;
                    let end = blob_to_u32(&part.offset)?
                        .saturating_add(blob_to_u32(&part.size)?);
                    if let Some(chunk) = plain_chunks.get_mut(&guid) {
                        chunk.window_size = chunk.window_size.max(end);
                    }
                }
            }
        }

        let chunks: HashMap<Guid, Arc<ManifestChunk>> = plain_chunks
            .into_iter()
            .map(|(guid, chunk)| (guid, Arc::new(chunk)))
            .collect();

        let mut files = Vec::with_capacity(raw.file_manifest_list.len());
        let mut file_index = HashMap::with_capacity(raw.file_manifest_list.len());
        for raw_file in &raw.file_manifest_list {
            let mut parts = Vec::with_capacity(raw_file.chunk_parts.len());
            let mut size = 0u64;
            for raw_part in &raw_file.chunk_parts {
                let guid = Guid::from_hex(&raw_part.guid)?;
                let chunk = chunks
                    .get(&guid)
                    .ok_or_else(|| {
                        Error::Manifest(format!(
                            "{} references unknown chunk {}",
                            raw_file.filename, raw_part.guid
                        ))
                    })?
                    .clone();
                let part = ChunkPart {
                    chunk,
                    offset: blob_to_u32(&raw_part.offset)?,
                    size: blob_to_u32(&raw_part.size)?,
                };
                size += u64::from(part.size);
                parts.push(part);
            }
            file_index.insert(raw_file.filename.clone(), files.len());
            files.push(Arc::new(ManifestFile {
                path: raw_file.filename.clone(),
                sha1: decode_sha1(&raw_file.file_hash)?,
                parts,
                size,
            }));
        }

        Ok(Self {
            feature_level,
            is_file_data: raw.b_is_file_data,
            app_id: blob_to_u32(&raw.app_id)?,
            app_name: raw.app_name,
            build_version: raw.build_version,
            launch_exe: raw.launch_exe,
            launch_command: raw.launch_command,
            files,
            file_index,
            chunks,
            cloud,
        })
    }

    pub fn files(&self) -> &[Arc<ManifestFile>] {
        &self.files
    }

    pub fn get_file(&self, path: &str) -> Option<&Arc<ManifestFile>> {
        self.file_index.get(path).map(|&i| &self.files[i])
    }

    pub fn chunks(&self) -> impl Iterator<Item = &Arc<ManifestChunk>> {
        self.chunks.values()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn contains_chunk(&self, guid: Guid) -> bool {
        self.chunks.contains_key(&guid)
    }

    /// Sum of compressed chunk sizes on the CDN.
    pub fn download_size(&self) -> u64 {
        self.chunks.values().map(|chunk| chunk.download_size).sum()
    }

    /// Sum of logical file sizes.
    pub fn install_size(&self) -> u64 {
        self.files.iter().map(|file| file.size).sum()
    }

    pub fn launch_info(&self) -> (&str, &str) {
        (&self.launch_exe, &self.launch_command)
    }

    pub fn cloud_host(&self) -> &str {
        &self.cloud.host
    }

    /// CDN directory chunk objects live under, with a trailing slash.
    pub fn chunk_dir(&self) -> String {
        format!("{}/{}/", self.cloud.path, self.feature_level.chunk_sub_dir())
    }
}
