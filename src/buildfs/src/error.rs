use thiserror::Error;

use crate::guid::Guid;

#[derive(Error, Debug)]
pub enum Error {
    #[error("fetch failed: {0}")]
    Transport(String),

    #[error("bad chunk envelope: {0}")]
    BadEnvelope(&'static str),

    #[error("chunk payload is encrypted")]
    Encrypted,

    #[error("decompression failed")]
    DecompressFailed,

    #[error("sha1 mismatch for chunk {guid}")]
    IntegrityFailed { guid: Guid },

    #[error("cache i/o: {0}")]
    CacheIo(#[from] std::io::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("access denied")]
    AccessDenied,

    #[error("manifest: {0}")]
    Manifest(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Manifest(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
