//! Object store abstraction and backends.
//!
//! Every backend offers atomic create-or-replace puts: a reader sees either
//! no object or the complete payload, never a prefix of it.

use std::fs::File;
use std::io::{self, Read};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::config::ArchiveConfig;
use crate::context::{ArtifactKey, StorageContext, StoreLocation};
use crate::error::ArchiveResult;

pub mod local;
pub mod memory;
pub mod s3;

pub use local::LocalObjectStore;
pub use memory::{Fault, MemoryObjectStore, MemoryStoreStats, StoreOp};
pub use s3::S3ObjectStore;

/// Payload handed to [`ObjectStore::put`].
#[derive(Debug)]
pub enum ObjectBody {
    /// In-memory bytes.
    Bytes(Bytes),
    /// An open file positioned at the start of the payload.
    File {
        /// The file.
        file: File,
        /// Exact number of bytes to send.
        len: u64,
    },
}

impl ObjectBody {
    /// Declared payload length.
    pub fn len(&self) -> u64 {
        match self {
            ObjectBody::Bytes(b) => b.len() as u64,
            ObjectBody::File { len, .. } => *len,
        }
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read the whole payload into memory. Blocking for file bodies.
    pub fn into_bytes(self) -> io::Result<Bytes> {
        match self {
            ObjectBody::Bytes(b) => Ok(b),
            ObjectBody::File { file, len } => {
                let mut buf = Vec::with_capacity(len as usize);
                file.take(len).read_to_end(&mut buf)?;
                if (buf.len() as u64) != len {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("spooled body short: expected {} bytes, got {}", len, buf.len()),
                    ));
                }
                Ok(Bytes::from(buf))
            }
        }
    }
}

/// Client-side facts sent along with a put.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutMeta {
    /// Payload length.
    pub len: u64,
    /// Hex SHA-256 of the payload.
    pub checksum: String,
}

/// What the store reports about a stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    /// Stored size in bytes.
    pub size: u64,
    /// Hex SHA-256 as known to the store, if it keeps one.
    pub checksum: Option<String>,
}

/// A fetched object.
#[derive(Debug, Clone)]
pub struct StoredObject {
    /// Full payload.
    pub data: Bytes,
    /// Hex SHA-256 as known to the store, if it keeps one.
    pub checksum: Option<String>,
}

/// One entry of a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSummary {
    /// Full object key.
    pub key: String,
    /// Stored size in bytes.
    pub size: u64,
}

/// Remote object store operations used by the transfer engine.
///
/// Implementations classify their failures: retryable conditions become
/// `ArchiveError::Transient`, everything else `Permanent`. Absence is not an
/// error for `get` and `head`.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Atomically create or replace `key` with `body`.
    async fn put(&self, key: &ArtifactKey, body: ObjectBody, meta: &PutMeta) -> ArchiveResult<()>;

    /// Fetch a whole object.
    async fn get(&self, key: &ArtifactKey) -> ArchiveResult<Option<StoredObject>>;

    /// Size and checksum of an object.
    async fn head(&self, key: &ArtifactKey) -> ArchiveResult<Option<ObjectMeta>>;

    /// All objects whose key starts with `prefix`, sorted by key.
    async fn list(&self, prefix: &str) -> ArchiveResult<Vec<ObjectSummary>>;

    /// Remove an object. Removing a missing object succeeds.
    async fn delete(&self, key: &ArtifactKey) -> ArchiveResult<()>;
}

/// Build the backend a context points at.
pub fn store_from_context(
    ctx: &StorageContext,
    config: &ArchiveConfig,
) -> ArchiveResult<Arc<dyn ObjectStore>> {
    match ctx.location() {
        StoreLocation::S3 { bucket } => Ok(Arc::new(S3ObjectStore::new(
            bucket,
            &config.region,
            config.endpoint.as_deref(),
            &config.credentials,
            config.attempt_timeout(),
        )?)),
        StoreLocation::Local { root } => Ok(Arc::new(LocalObjectStore::new(root.clone()))),
        StoreLocation::Memory { .. } => Ok(Arc::new(MemoryObjectStore::new())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Seek, SeekFrom, Write};

    #[test]
    fn test_bytes_body() {
        let body = ObjectBody::Bytes(Bytes::from_static(b"abc"));
        assert_eq!(body.len(), 3);
        assert_eq!(&body.into_bytes().unwrap()[..], b"abc");
    }

    #[test]
    fn test_file_body_reads_declared_len() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"0123456789").unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();
        let body = ObjectBody::File { file, len: 4 };
        assert_eq!(&body.into_bytes().unwrap()[..], b"0123");
    }

    #[test]
    fn test_file_body_short_is_error() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"01").unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();
        let body = ObjectBody::File { file, len: 10 };
        assert!(body.into_bytes().is_err());
    }

    #[test]
    fn test_store_from_context() {
        let config = ArchiveConfig::default();
        let mem = StorageContext::parse("memory://t").unwrap();
        assert_eq!(store_from_context(&mem, &config).unwrap().name(), "memory");
        let dir = tempfile::tempdir().unwrap();
        let local =
            StorageContext::parse(&format!("file://{}", dir.path().display())).unwrap();
        assert_eq!(store_from_context(&local, &config).unwrap().name(), "local");
        let s3 = StorageContext::parse("s3://bucket/prefix").unwrap();
        assert_eq!(store_from_context(&s3, &config).unwrap().name(), "s3");
    }
}
