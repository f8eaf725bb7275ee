pub mod object_store;
pub mod sftp;

pub use object_store::{BucketClient, BucketConfig, ObjectPage, ObjectStoreFetcher, RemoteObject};
pub use sftp::{SftpConfig, SftpFetcher, SftpTransport};

use async_trait::async_trait;
use flate2::read::GzDecoder;
use std::io::Read;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("remote path not found: {0}")]
    NotFound(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid fetcher config: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl FetchError {
    /// Transient errors are worth a bounded retry; auth and config errors
    /// are not.
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transport(_) | FetchError::Io(_))
    }
}

/// One file pulled from a remote source, already decompressed when possible.
#[derive(Debug, Clone)]
pub struct FetchedFile {
    pub name: String,
    pub bytes: Vec<u8>,
    pub size: u64,
}

/// Common contract for remote log pullers.
#[async_trait]
pub trait Fetcher: Send {
    /// Probe the source without transferring data.
    async fn test_connection(&mut self) -> (bool, String);
    /// Discover and download all matching files.
    async fn fetch(&mut self) -> Result<Vec<FetchedFile>, FetchError>;
    /// Release connections and cached clients.
    async fn cleanup(&mut self);
}

/// Best-effort gzip handling for fetched files: `.gz` entries are
/// decompressed and renamed; on a decompression error the original name and
/// bytes are kept.
pub(crate) fn apply_gzip(name: &str, bytes: Vec<u8>) -> (String, Vec<u8>) {
    let Some(stripped) = name.strip_suffix(".gz") else {
        return (name.to_string(), bytes);
    };

    let mut decoder = GzDecoder::new(bytes.as_slice());
    let mut decompressed = Vec::new();
    match decoder.read_to_end(&mut decompressed) {
        Ok(_) => (stripped.to_string(), decompressed),
        Err(_) => (name.to_string(), bytes),
    }
}

/// Final path component, the name a fetched file is stored under.
pub(crate) fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn test_gzip_decompressed_and_renamed() {
        let compressed = gzip(b"line one\nline two\n");
        let (name, bytes) = apply_gzip("access.log.gz", compressed);
        assert_eq!(name, "access.log");
        assert_eq!(bytes, b"line one\nline two\n");
    }

    #[test]
    fn test_invalid_gzip_kept_as_is() {
        let (name, bytes) = apply_gzip("access.log.gz", b"not gzip at all".to_vec());
        assert_eq!(name, "access.log.gz");
        assert_eq!(bytes, b"not gzip at all");
    }

    #[test]
    fn test_plain_files_untouched() {
        let (name, bytes) = apply_gzip("access.log", b"plain".to_vec());
        assert_eq!(name, "access.log");
        assert_eq!(bytes, b"plain");
    }

    #[test]
    fn test_basename() {
        assert_eq!(basename("/var/log/nginx/access.log"), "access.log");
        assert_eq!(basename("access.log"), "access.log");
        assert_eq!(basename("nginx/2026/01/access.log.gz"), "access.log.gz");
    }
}
