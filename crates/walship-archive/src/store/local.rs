//! Object store on a local (or mounted) filesystem.
//!
//! Objects are files under the root; keys map to `/`-separated relative
//! paths. Writes go to a temp file in the destination directory and are
//! renamed into place, so readers never see partial objects.

use std::fs;
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;
use walkdir::WalkDir;

use super::{ObjectBody, ObjectMeta, ObjectStore, ObjectSummary, PutMeta, StoredObject};
use crate::context::ArtifactKey;
use crate::error::{ArchiveError, ArchiveResult};
use crate::spool::sha256_hex;

const TEMP_PREFIX: &str = ".tmp";

/// Filesystem-backed object store.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: Arc<PathBuf>,
}

impl LocalObjectStore {
    /// Store rooted at `root`. The directory is created on first write.
    pub fn new(root: PathBuf) -> Self {
        Self {
            root: Arc::new(root),
        }
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(root: &Path, key: &str) -> ArchiveResult<PathBuf> {
        let unsafe_key = || ArchiveError::permanent("resolve", format!("unsafe storage key {:?}", key));
        if key.is_empty() || key.starts_with('/') || key.contains('\\') {
            return Err(unsafe_key());
        }
        if Path::new(key)
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(unsafe_key());
        }
        Ok(root.join(key))
    }

    fn atomic_write(path: &Path, body: ObjectBody) -> io::Result<u64> {
        let dir = path
            .parent()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "key has no parent"))?;
        fs::create_dir_all(dir)?;
        let mut tmp = tempfile::Builder::new().prefix(TEMP_PREFIX).tempfile_in(dir)?;
        let written = match body {
            ObjectBody::Bytes(b) => {
                tmp.write_all(&b)?;
                b.len() as u64
            }
            ObjectBody::File { file, len } => {
                let mut limited = io::Read::take(file, len);
                io::copy(&mut limited, &mut tmp)?
            }
        };
        tmp.flush()?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(written)
    }

    fn list_blocking(root: &Path, prefix: &str) -> ArchiveResult<Vec<ObjectSummary>> {
        if !root.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in WalkDir::new(root).follow_links(false) {
            let entry = entry.map_err(|e| ArchiveError::permanent("list", e))?;
            if !entry.file_type().is_file() {
                continue;
            }
            if entry
                .file_name()
                .to_str()
                .map_or(true, |n| n.starts_with(TEMP_PREFIX))
            {
                continue;
            }
            let rel = match entry.path().strip_prefix(root) {
                Ok(rel) => rel,
                Err(_) => continue,
            };
            let key = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if key.starts_with(prefix) {
                let size = entry
                    .metadata()
                    .map_err(|e| ArchiveError::permanent("list", e))?
                    .len();
                out.push(ObjectSummary { key, size });
            }
        }
        out.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(out)
    }
}

async fn blocking<T, F>(f: F) -> ArchiveResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> ArchiveResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ArchiveError::permanent("local store task", e))?
}

fn read_optional(path: &Path) -> io::Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(data) => Ok(Some(data)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn put(&self, key: &ArtifactKey, body: ObjectBody, meta: &PutMeta) -> ArchiveResult<()> {
        let path = LocalObjectStore::resolve(&self.root, key.as_str())?;
        let written = blocking(move || Ok(LocalObjectStore::atomic_write(&path, body)?)).await?;
        debug!(key = %key, written, expected = meta.len, "local put");
        Ok(())
    }

    async fn get(&self, key: &ArtifactKey) -> ArchiveResult<Option<StoredObject>> {
        let path = LocalObjectStore::resolve(&self.root, key.as_str())?;
        let data = blocking(move || Ok(read_optional(&path)?)).await?;
        Ok(data.map(|d| StoredObject {
            data: Bytes::from(d),
            checksum: None,
        }))
    }

    async fn head(&self, key: &ArtifactKey) -> ArchiveResult<Option<ObjectMeta>> {
        let path = LocalObjectStore::resolve(&self.root, key.as_str())?;
        blocking(move || {
            Ok(read_optional(&path)?.map(|d| ObjectMeta {
                size: d.len() as u64,
                checksum: Some(sha256_hex(&d)),
            }))
        })
        .await
    }

    async fn list(&self, prefix: &str) -> ArchiveResult<Vec<ObjectSummary>> {
        let root = Arc::clone(&self.root);
        let prefix = prefix.to_string();
        blocking(move || LocalObjectStore::list_blocking(&root, &prefix)).await
    }

    async fn delete(&self, key: &ArtifactKey) -> ArchiveResult<()> {
        let path = LocalObjectStore::resolve(&self.root, key.as_str())?;
        blocking(move || match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        })
        .await
    }
}
