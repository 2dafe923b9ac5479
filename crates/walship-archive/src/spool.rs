//! Scratch staging for compressed payloads.
//!
//! A payload is written once through a [`SpoolWriter`], which tracks its
//! length and SHA-256 as bytes go by. The resulting [`SpoolHandle`] can hand
//! out any number of full-length bodies (one per upload attempt) and releases
//! its storage when dropped. Disk spool files are anonymous temp files: they
//! have no name to leak, are never fsynced, and the OS reclaims them even if
//! the process dies.

use std::fs::File;
use std::io::{self, BufWriter, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::ArchiveResult;
use crate::store::ObjectBody;

/// Where staged payloads are kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum SpoolMode {
    /// Anonymous temp files in the system temp directory.
    #[default]
    Disk,
    /// Anonymous temp files in a specific scratch directory.
    DiskIn {
        /// Scratch directory.
        dir: PathBuf,
    },
    /// Heap buffers.
    Memory,
}

/// Hex-encoded SHA-256 of a byte slice.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Counts live spool entries so callers can assert nothing leaked.
#[derive(Debug)]
struct LiveGuard(Arc<AtomicUsize>);

impl LiveGuard {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Factory for spool entries.
#[derive(Debug, Clone)]
pub struct Spool {
    mode: SpoolMode,
    live: Arc<AtomicUsize>,
}

impl Spool {
    /// Create a spool in the given mode.
    pub fn new(mode: SpoolMode) -> Self {
        Self {
            mode,
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// The configured mode.
    pub fn mode(&self) -> &SpoolMode {
        &self.mode
    }

    /// Number of writers and handles currently alive.
    pub fn live_entries(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Start a new entry.
    pub fn writer(&self) -> ArchiveResult<SpoolWriter> {
        let sink = match &self.mode {
            SpoolMode::Memory => Sink::Memory(Vec::new()),
            SpoolMode::Disk => Sink::Disk(BufWriter::new(tempfile::tempfile()?)),
            SpoolMode::DiskIn { dir } => Sink::Disk(BufWriter::new(tempfile::tempfile_in(dir)?)),
        };
        Ok(SpoolWriter {
            sink,
            hasher: Sha256::new(),
            len: 0,
            guard: LiveGuard::new(&self.live),
        })
    }

    /// Stage an already-materialized payload.
    pub fn stage(&self, data: &[u8]) -> ArchiveResult<SpoolHandle> {
        let mut w = self.writer()?;
        w.write_all(data)?;
        w.finish()
    }
}

enum Sink {
    Memory(Vec<u8>),
    Disk(BufWriter<File>),
}

/// Write side of a spool entry.
pub struct SpoolWriter {
    sink: Sink,
    hasher: Sha256,
    len: u64,
    guard: LiveGuard,
}

impl SpoolWriter {
    /// Bytes written so far.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Seal the entry. Flushes buffered bytes to the OS without fsync.
    pub fn finish(self) -> ArchiveResult<SpoolHandle> {
        let SpoolWriter {
            sink,
            hasher,
            len,
            guard,
        } = self;
        let staged = match sink {
            Sink::Memory(buf) => Staged::Memory(Bytes::from(buf)),
            Sink::Disk(writer) => {
                let file = writer.into_inner().map_err(|e| e.into_error())?;
                Staged::Disk(file)
            }
        };
        let checksum = hex::encode(hasher.finalize());
        debug!(len, %checksum, "spool entry sealed");
        Ok(SpoolHandle {
            staged,
            len,
            checksum,
            _guard: guard,
        })
    }
}

impl Write for SpoolWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = match &mut self.sink {
            Sink::Memory(v) => {
                v.extend_from_slice(buf);
                buf.len()
            }
            Sink::Disk(w) => w.write(buf)?,
        };
        self.hasher.update(&buf[..n]);
        self.len += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.sink {
            Sink::Memory(_) => Ok(()),
            Sink::Disk(w) => w.flush(),
        }
    }
}

enum Staged {
    Memory(Bytes),
    Disk(File),
}

/// A sealed spool entry of known length and checksum.
///
/// Bodies handed out by [`SpoolHandle::body`] share the underlying file
/// cursor, so only one may be read at a time.
pub struct SpoolHandle {
    staged: Staged,
    len: u64,
    checksum: String,
    _guard: LiveGuard,
}

impl SpoolHandle {
    /// Exact payload length.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Hex SHA-256 of the payload.
    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    /// A fresh body positioned at the start of the payload.
    pub fn body(&self) -> ArchiveResult<ObjectBody> {
        match &self.staged {
            Staged::Memory(bytes) => Ok(ObjectBody::Bytes(bytes.clone())),
            Staged::Disk(file) => {
                let mut file = file.try_clone()?;
                file.seek(SeekFrom::Start(0))?;
                Ok(ObjectBody::File {
                    file,
                    len: self.len,
                })
            }
        }
    }
}

impl std::fmt::Debug for SpoolHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpoolHandle")
            .field("len", &self.len)
            .field("checksum", &self.checksum)
            .field(
                "backing",
                &match self.staged {
                    Staged::Memory(_) => "memory",
                    Staged::Disk(_) => "disk",
                },
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn modes(dir: &tempfile::TempDir) -> Vec<SpoolMode> {
        vec![
            SpoolMode::Memory,
            SpoolMode::Disk,
            SpoolMode::DiskIn {
                dir: dir.path().to_path_buf(),
            },
        ]
    }

    #[test]
    fn test_stage_reports_len_and_checksum() {
        let dir = tempfile::tempdir().unwrap();
        for mode in modes(&dir) {
            let spool = Spool::new(mode);
            let handle = spool.stage(b"hello spool").unwrap();
            assert_eq!(handle.len(), 11);
            assert_eq!(handle.checksum(), sha256_hex(b"hello spool"));
        }
    }

    #[test]
    fn test_body_can_be_read_repeatedly() {
        let dir = tempfile::tempdir().unwrap();
        for mode in modes(&dir) {
            let spool = Spool::new(mode);
            let mut w = spool.writer().unwrap();
            for i in 0..1000u32 {
                w.write_all(&i.to_le_bytes()).unwrap();
            }
            let handle = w.finish().unwrap();
            assert_eq!(handle.len(), 4000);

            let first = handle.body().unwrap().into_bytes().unwrap();
            let second = handle.body().unwrap().into_bytes().unwrap();
            assert_eq!(first.len(), 4000);
            assert_eq!(first, second);
        }
    }

    #[test]
    fn test_entries_released_on_drop() {
        let spool = Spool::new(SpoolMode::Memory);
        assert_eq!(spool.live_entries(), 0);
        let w = spool.writer().unwrap();
        assert_eq!(spool.live_entries(), 1);
        let h = w.finish().unwrap();
        assert_eq!(spool.live_entries(), 1);
        let h2 = spool.stage(b"x").unwrap();
        assert_eq!(spool.live_entries(), 2);
        drop(h);
        drop(h2);
        assert_eq!(spool.live_entries(), 0);
    }

    #[test]
    fn test_writer_dropped_on_error_path_is_released() {
        let spool = Spool::new(SpoolMode::Disk);
        let result: ArchiveResult<SpoolHandle> = (|| {
            let mut w = spool.writer()?;
            w.write_all(b"partial")?;
            Err(crate::error::ArchiveError::Cancelled)
        })();
        assert!(result.is_err());
        assert_eq!(spool.live_entries(), 0);
    }

    #[test]
    fn test_disk_spool_leaves_no_named_files() {
        let dir = tempfile::tempdir().unwrap();
        let spool = Spool::new(SpoolMode::DiskIn {
            dir: dir.path().to_path_buf(),
        });
        let handle = spool.stage(&vec![1u8; 64 * 1024]).unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
        drop(handle);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_spool_mode_serde() {
        let json = serde_json::to_string(&SpoolMode::Memory).unwrap();
        assert_eq!(json, r#"{"mode":"memory"}"#);
        let m: SpoolMode = serde_json::from_str(r#"{"mode":"diskin","dir":"/scratch"}"#).unwrap();
        assert_eq!(
            m,
            SpoolMode::DiskIn {
                dir: PathBuf::from("/scratch")
            }
        );
    }
}
