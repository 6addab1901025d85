#![allow(dead_code)]

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};

use buildfs::chunk::{self, CHUNK_HEADER_MAGIC, CHUNK_STORED_COMPRESSED};
use buildfs::compression::{zlib_compress, CompressionLevel};
use buildfs::manifest::{CloudDir, Manifest};
use buildfs::Guid;

pub fn blob(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:03}", b)).collect()
}

pub fn blob_u32(value: u32) -> String {
    blob(&value.to_le_bytes())
}

pub fn blob_u64(value: u64) -> String {
    blob(&value.to_le_bytes())
}

/// Deterministic window content so expected bytes can be recomputed.
pub fn window(seed: u64, len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| ((i as u64).wrapping_mul(31).wrapping_add(seed) % 251) as u8)
        .collect()
}

/// Builds a v3 CDN chunk envelope around `window`.
pub fn cdn_envelope(guid: &str, rolling_hash: u64, window: &[u8], compressed: bool) -> Vec<u8> {
    let payload = if compressed {
        zlib_compress(CompressionLevel::Normal, window).unwrap()
    } else {
        window.to_vec()
    };
    let header_size = 66u32;

    let mut out = Vec::with_capacity(payload.len() + header_size as usize);
    out.extend_from_slice(&CHUNK_HEADER_MAGIC.to_le_bytes());
    out.extend_from_slice(&3u32.to_le_bytes());
    out.extend_from_slice(&header_size.to_le_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(Guid::from_hex(guid).unwrap().as_bytes());
    out.extend_from_slice(&rolling_hash.to_le_bytes());
    out.push(if compressed { CHUNK_STORED_COMPRESSED } else { 0 });
    out.extend_from_slice(&chunk::sha1_of(window));
    out.push(0); // hash type
    out.extend_from_slice(&(window.len() as u32).to_le_bytes());
    out.extend_from_slice(&payload);
    out
}

pub struct TestChunkSpec {
    pub guid_hex: String,
    pub hash: u64,
    pub group: u8,
    pub window: Vec<u8>,
    pub compressed: bool,
}

impl TestChunkSpec {
    pub fn new(guid_hex: &str, hash: u64, group: u8, window: Vec<u8>) -> Self {
        Self {
            guid_hex: guid_hex.to_string(),
            hash,
            group,
            window,
            compressed: true,
        }
    }

    pub fn guid(&self) -> Guid {
        Guid::from_hex(&self.guid_hex).unwrap()
    }
}

pub struct TestFileSpec {
    pub name: String,
    /// (chunk index, offset within chunk window, size)
    pub parts: Vec<(usize, u32, u32)>,
}

impl TestFileSpec {
    pub fn new(name: &str, parts: Vec<(usize, u32, u32)>) -> Self {
        Self {
            name: name.to_string(),
            parts,
        }
    }
}

pub fn build_manifest_json(
    feature_level: u32,
    chunks: &[TestChunkSpec],
    files: &[TestFileSpec],
) -> String {
    use serde_json::{json, Map, Value};

    let mut hash_list = Map::new();
    let mut sha_list = Map::new();
    let mut group_list = Map::new();
    let mut size_list = Map::new();
    for spec in chunks {
        let envelope = cdn_envelope(&spec.guid_hex, spec.hash, &spec.window, spec.compressed);
        hash_list.insert(spec.guid_hex.clone(), Value::String(blob_u64(spec.hash)));
        sha_list.insert(
            spec.guid_hex.clone(),
            Value::String(hex::encode_upper(chunk::sha1_of(&spec.window))),
        );
        group_list.insert(
            spec.guid_hex.clone(),
            Value::String(format!("{:02}", spec.group)),
        );
        size_list.insert(
            spec.guid_hex.clone(),
            Value::String(blob_u64(envelope.len() as u64)),
        );
    }

    let file_list: Vec<Value> = files
        .iter()
        .map(|file| {
            let parts: Vec<Value> = file
                .parts
                .iter()
                .map(|&(chunk_index, offset, size)| {
                    json!({
                        "Guid": chunks[chunk_index].guid_hex,
                        "Offset": blob_u32(offset),
                        "Size": blob_u32(size),
                    })
                })
                .collect();
            json!({
                "Filename": file.name,
                "FileHash": blob(&[0u8; 20]),
                "FileChunkParts": parts,
            })
        })
        .collect();

    json!({
        "ManifestFileVersion": blob_u32(feature_level),
        "bIsFileData": false,
        "AppID": blob_u32(1),
        "AppNameString": "TestGame",
        "BuildVersionString": "1.0.0-test",
        "LaunchExeString": "bin/a",
        "LaunchCommand": "",
        "ChunkHashList": hash_list,
        "ChunkShaList": sha_list,
        "DataGroupList": group_list,
        "ChunkFilesizeList": size_list,
        "FileManifestList": file_list,
    })
    .to_string()
}

struct CdnState {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    hits: Mutex<HashMap<String, u64>>,
    total_hits: AtomicU64,
}

/// In-process CDN: serves registered object paths, counts every GET.
pub struct TestCdn {
    pub addr: SocketAddr,
    state: Arc<CdnState>,
    _runtime: tokio::runtime::Runtime,
}

impl TestCdn {
    pub fn start() -> Self {
        let state = Arc::new(CdnState {
            objects: Mutex::new(HashMap::new()),
            hits: Mutex::new(HashMap::new()),
            total_hits: AtomicU64::new(0),
        });
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        let addr = {
            let state = state.clone();
            runtime.block_on(async move {
                let make = make_service_fn(move |_conn| {
                    let state = state.clone();
                    async move {
                        Ok::<_, Infallible>(service_fn(move |req| serve(state.clone(), req)))
                    }
                });
                let server = Server::bind(&"127.0.0.1:0".parse().unwrap()).serve(make);
                let addr = server.local_addr();
                tokio::spawn(server);
                addr
            })
        };
        Self {
            addr,
            state,
            _runtime: runtime,
        }
    }

    pub fn host(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn put(&self, path: &str, body: Vec<u8>) {
        self.state
            .objects
            .lock()
            .unwrap()
            .insert(path.to_string(), body);
    }

    pub fn hits(&self, path: &str) -> u64 {
        *self.state.hits.lock().unwrap().get(path).unwrap_or(&0)
    }

    pub fn total_hits(&self) -> u64 {
        self.state.total_hits.load(Ordering::Relaxed)
    }
}

async fn serve(
    state: Arc<CdnState>,
    req: Request<Body>,
) -> Result<Response<Body>, Infallible> {
    let path = req.uri().path().to_string();
    let body = state.objects.lock().unwrap().get(&path).cloned();
    match body {
        Some(bytes) => {
            *state.hits.lock().unwrap().entry(path).or_insert(0) += 1;
            state.total_hits.fetch_add(1, Ordering::Relaxed);
            Ok(Response::new(Body::from(bytes)))
        }
        None => Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Body::empty())
            .unwrap()),
    }
}

/// Parses the manifest and registers every chunk's envelope with the CDN.
pub fn host_build(
    cdn: &TestCdn,
    chunks: &[TestChunkSpec],
    files: &[TestFileSpec],
) -> Arc<Manifest> {
    let json = build_manifest_json(12, chunks, files);
    let manifest = Arc::new(
        Manifest::parse(
            json.as_bytes(),
            CloudDir {
                host: cdn.host(),
                path: "/cloud".to_string(),
            },
        )
        .unwrap(),
    );

    for chunk in manifest.chunks() {
        let spec = chunks
            .iter()
            .find(|spec| spec.guid() == chunk.guid)
            .unwrap();
        let envelope = cdn_envelope(&spec.guid_hex, spec.hash, &spec.window, spec.compressed);
        cdn.put(
            &format!("{}{}", manifest.chunk_dir(), chunk.url_path()),
            envelope,
        );
    }
    manifest
}

pub fn chunk_object_path(manifest: &Manifest, guid: Guid) -> String {
    let chunk = manifest.chunks().find(|c| c.guid == guid).unwrap();
    format!("{}{}", manifest.chunk_dir(), chunk.url_path())
}
