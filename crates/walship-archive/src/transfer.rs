//! Push and fetch of single artifacts with retry and integrity checks.
//!
//! A push uploads a sealed spool entry, then asks the store for the object's
//! size and checksum and compares them with the local values. Only after
//! that comparison succeeds is the artifact considered stored; otherwise the
//! object is deleted again.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::codec::{self, CodecStats};
use crate::context::ArtifactKey;
use crate::error::{ArchiveError, ArchiveResult};
use crate::retry::{RetryConfig, RetryExecutor};
use crate::spool::{sha256_hex, Spool, SpoolHandle};
use crate::store::{ObjectStore, ObjectSummary, PutMeta};
use crate::throttle::ReadThrottle;

/// A stored, verified artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    /// Object key.
    pub key: ArtifactKey,
    /// Stored (compressed) size in bytes.
    pub size: u64,
    /// Hex SHA-256 of the stored payload.
    pub checksum: String,
}

/// Counters for one engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransferStats {
    /// Verified pushes.
    pub pushes: u64,
    /// Successful fetches.
    pub fetches: u64,
    /// Stored bytes uploaded by verified pushes.
    pub bytes_uploaded: u64,
    /// Stored bytes downloaded by successful fetches.
    pub bytes_downloaded: u64,
    /// Pushes rejected by post-upload verification.
    pub verification_failures: u64,
}

#[derive(Debug, Default)]
struct Counters {
    pushes: AtomicU64,
    fetches: AtomicU64,
    bytes_uploaded: AtomicU64,
    bytes_downloaded: AtomicU64,
    verification_failures: AtomicU64,
}

async fn blocking<T, F>(f: F) -> ArchiveResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> ArchiveResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ArchiveError::permanent("blocking task", e))?
}

/// Moves artifacts between local files and the object store.
pub struct TransferEngine {
    store: Arc<dyn ObjectStore>,
    retry: RetryExecutor,
    spool: Spool,
    counters: Counters,
}

impl TransferEngine {
    /// Create an engine over a shared store client.
    pub fn new(store: Arc<dyn ObjectStore>, retry: RetryConfig, spool: Spool) -> Self {
        Self {
            store,
            retry: RetryExecutor::new(retry),
            spool,
            counters: Counters::default(),
        }
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// The spool used for staging.
    pub fn spool(&self) -> &Spool {
        &self.spool
    }

    /// Snapshot of the transfer counters.
    pub fn stats(&self) -> TransferStats {
        TransferStats {
            pushes: self.counters.pushes.load(Ordering::Relaxed),
            fetches: self.counters.fetches.load(Ordering::Relaxed),
            bytes_uploaded: self.counters.bytes_uploaded.load(Ordering::Relaxed),
            bytes_downloaded: self.counters.bytes_downloaded.load(Ordering::Relaxed),
            verification_failures: self.counters.verification_failures.load(Ordering::Relaxed),
        }
    }

    /// Compress a local file into a new spool entry on the blocking pool.
    pub async fn stage_file(&self, path: &Path) -> ArchiveResult<(SpoolHandle, CodecStats)> {
        self.stage_file_throttled(path, None).await
    }

    /// Like [`stage_file`](Self::stage_file), with reads of `path` counted
    /// against `throttle` when one is given.
    pub async fn stage_file_throttled(
        &self,
        path: &Path,
        throttle: Option<ReadThrottle>,
    ) -> ArchiveResult<(SpoolHandle, CodecStats)> {
        let spool = self.spool.clone();
        let path = path.to_path_buf();
        blocking(move || {
            let file = BufReader::new(File::open(&path)?);
            let mut writer = spool.writer()?;
            let stats = match throttle {
                Some(t) => codec::compress(t.reader(file), &mut writer)?,
                None => codec::compress(file, &mut writer)?,
            };
            Ok((writer.finish()?, stats))
        })
        .await
    }

    /// Upload a staged payload to `key` and verify what the store reports.
    ///
    /// The upload and its verification share one deadline. If the upload
    /// went through but verification fails, the object is removed again so
    /// a failed push leaves no artifact behind.
    #[instrument(skip_all, fields(key = %key, len = staged.len()))]
    pub async fn push(
        &self,
        key: &ArtifactKey,
        staged: &SpoolHandle,
        cancel: &CancellationToken,
    ) -> ArchiveResult<ArtifactRef> {
        let meta = PutMeta {
            len: staged.len(),
            checksum: staged.checksum().to_string(),
        };
        let store = &self.store;
        let meta_ref = &meta;
        let deadline = self.retry.deadline_from_now();

        self.retry
            .execute_until(&format!("PUT {}", key), deadline, cancel, move |_| async move {
                let body = staged.body()?;
                store.put(key, body, meta_ref).await
            })
            .await?;

        if let Err(e) = self.verify_upload(key, &meta, deadline, cancel).await {
            self.discard(key).await;
            return Err(e);
        }

        self.counters.pushes.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_uploaded
            .fetch_add(meta.len, Ordering::Relaxed);
        debug!(key = %key, size = meta.len, "artifact stored and verified");
        Ok(ArtifactRef {
            key: key.clone(),
            size: meta.len,
            checksum: meta.checksum,
        })
    }

    async fn verify_upload(
        &self,
        key: &ArtifactKey,
        meta: &PutMeta,
        deadline: Option<Instant>,
        cancel: &CancellationToken,
    ) -> ArchiveResult<()> {
        let store = &self.store;
        let reported = self
            .retry
            .execute_until(&format!("HEAD {}", key), deadline, cancel, move |_| async move {
                store.head(key).await
            })
            .await?;

        let mismatch = match reported {
            None => Some("object not visible after upload".to_string()),
            Some(m) if m.size != meta.len => Some(format!(
                "store reports {} bytes, uploaded {}",
                m.size, meta.len
            )),
            Some(m) => match m.checksum {
                Some(c) if !c.eq_ignore_ascii_case(&meta.checksum) => Some(format!(
                    "store reports checksum {}, uploaded {}",
                    c, meta.checksum
                )),
                _ => None,
            },
        };
        match mismatch {
            None => Ok(()),
            Some(reason) => {
                self.counters
                    .verification_failures
                    .fetch_add(1, Ordering::Relaxed);
                warn!(key = %key, %reason, "upload verification failed");
                Err(ArchiveError::VerificationFailed {
                    key: key.to_string(),
                    reason,
                })
            }
        }
    }

    /// Best-effort removal of an object whose push did not complete. Runs
    /// under its own token so it also happens after cancellation.
    async fn discard(&self, key: &ArtifactKey) {
        match self.delete(key, &CancellationToken::new()).await {
            Ok(()) => debug!(key = %key, "removed unverified artifact"),
            Err(e) => warn!(key = %key, error = %e, "could not remove unverified artifact"),
        }
    }

    /// Compress `path`, push it to `key`, and release the spool entry.
    pub async fn push_file(
        &self,
        key: &ArtifactKey,
        path: &Path,
        cancel: &CancellationToken,
    ) -> ArchiveResult<(ArtifactRef, CodecStats)> {
        let (staged, stats) = self.stage_file(path).await?;
        let artifact = self.push(key, &staged, cancel).await?;
        Ok((artifact, stats))
    }

    /// Push an uncompressed in-memory payload.
    pub async fn push_bytes(
        &self,
        key: &ArtifactKey,
        data: &[u8],
        cancel: &CancellationToken,
    ) -> ArchiveResult<ArtifactRef> {
        let staged = self.spool.stage(data)?;
        self.push(key, &staged, cancel).await
    }

    /// Fetch the stored payload of `key`, checked against the store's
    /// checksum when it has one.
    #[instrument(skip_all, fields(key = %key))]
    pub async fn fetch(&self, key: &ArtifactKey, cancel: &CancellationToken) -> ArchiveResult<Bytes> {
        let store = &self.store;
        let object = self
            .retry
            .execute(&format!("GET {}", key), cancel, move |_| async move {
                store.get(key).await
            })
            .await?
            .ok_or_else(|| ArchiveError::NotFound {
                key: key.to_string(),
            })?;

        if let Some(expected) = &object.checksum {
            let actual = sha256_hex(&object.data);
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(ArchiveError::CorruptArtifact {
                    key: key.to_string(),
                    reason: format!("checksum {} does not match stored {}", actual, expected),
                });
            }
        }

        self.counters.fetches.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_downloaded
            .fetch_add(object.data.len() as u64, Ordering::Relaxed);
        Ok(object.data)
    }

    /// Fetch and decompress `key` into `dest`.
    ///
    /// The payload is decompressed into a temp file next to `dest` and
    /// renamed over it only once fully verified, so `dest` never holds a
    /// partial file. Returns the decompressed size.
    pub async fn fetch_to_path(
        &self,
        key: &ArtifactKey,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> ArchiveResult<u64> {
        let data = self.fetch(key, cancel).await?;
        self.restore(key, data, dest, cancel).await
    }

    /// Like [`fetch_to_path`](Self::fetch_to_path), but the payload must
    /// also hash to `expected`, the checksum recorded at push time.
    pub async fn fetch_checked_to_path(
        &self,
        key: &ArtifactKey,
        expected: &str,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> ArchiveResult<u64> {
        let data = self.fetch(key, cancel).await?;
        let actual = sha256_hex(&data);
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(ArchiveError::CorruptArtifact {
                key: key.to_string(),
                reason: format!("checksum {} does not match recorded {}", actual, expected),
            });
        }
        self.restore(key, data, dest, cancel).await
    }

    async fn restore(
        &self,
        key: &ArtifactKey,
        data: Bytes,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> ArchiveResult<u64> {
        let dest: PathBuf = dest.to_path_buf();
        let key = key.to_string();
        let cancel = cancel.clone();
        blocking(move || {
            let dir = match dest.parent() {
                Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
                _ => PathBuf::from("."),
            };
            std::fs::create_dir_all(&dir)?;
            let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
            let written = codec::decompress(&key, &data[..], BufWriter::new(&mut tmp))?;
            if cancel.is_cancelled() {
                return Err(ArchiveError::Cancelled);
            }
            tmp.persist(&dest).map_err(|e| e.error)?;
            debug!(key = %key, dest = %dest.display(), written, "artifact restored");
            Ok(written)
        })
        .await
    }

    /// Fetch and decompress `key` into memory.
    pub async fn fetch_decompressed(
        &self,
        key: &ArtifactKey,
        cancel: &CancellationToken,
    ) -> ArchiveResult<Vec<u8>> {
        let data = self.fetch(key, cancel).await?;
        let key = key.to_string();
        blocking(move || codec::decompress_bytes(&key, &data)).await
    }

    /// List objects under `prefix`, retrying transient failures.
    pub async fn list(
        &self,
        prefix: &str,
        cancel: &CancellationToken,
    ) -> ArchiveResult<Vec<ObjectSummary>> {
        let store = &self.store;
        self.retry
            .execute(&format!("LIST {}", prefix), cancel, move |_| async move {
                store.list(prefix).await
            })
            .await
    }

    /// Remove `key`, retrying transient failures.
    pub async fn delete(&self, key: &ArtifactKey, cancel: &CancellationToken) -> ArchiveResult<()> {
        let store = &self.store;
        self.retry
            .execute(&format!("DELETE {}", key), cancel, move |_| async move {
                store.delete(key).await
            })
            .await
    }
}
