//! Shared fixtures for archive integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;
use walship_archive::{
    ArchiveConfig, Archiver, MemoryObjectStore, ScriptedBackupControl, SpoolMode, WalPosition,
};

/// Context used by the in-memory fixtures.
pub const CONTEXT: &str = "memory://integration/cluster-a";

/// Config tuned for fast tests: tiny backoff, in-memory spool.
pub fn fast_config(context: &str) -> ArchiveConfig {
    ArchiveConfig {
        context: context.to_string(),
        spool: SpoolMode::Memory,
        backoff_base_ms: 1,
        backoff_max_ms: 5,
        concurrency: 3,
        ..ArchiveConfig::default()
    }
}

/// An archiver over a fault-injectable memory store plus a scratch dir.
pub struct TestArchive {
    pub store: Arc<MemoryObjectStore>,
    pub archiver: Archiver,
    pub scratch: TempDir,
}

impl TestArchive {
    pub fn new() -> Self {
        Self::with_config(fast_config(CONTEXT))
    }

    pub fn with_config(config: ArchiveConfig) -> Self {
        let store = Arc::new(MemoryObjectStore::new());
        let archiver = Archiver::with_store(config, store.clone()).expect("valid config");
        Self {
            store,
            archiver,
            scratch: tempfile::tempdir().expect("scratch dir"),
        }
    }

    /// Write a WAL file named `name` into the scratch pg_xlog.
    pub fn write_wal(&self, name: &str, contents: &[u8]) -> PathBuf {
        let dir = self.scratch.path().join("pg_xlog");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    /// A fresh path under the scratch dir.
    pub fn path(&self, rel: &str) -> PathBuf {
        self.scratch.path().join(rel)
    }
}

/// Deterministic pseudo-WAL contents for segment `n`.
pub fn segment_bytes(n: u32, len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| ((i as u32).wrapping_mul(31) ^ n) as u8)
        .collect()
}

/// 24-hex name of segment `seg` on timeline 1, log 0.
pub fn segment_name(seg: u32) -> String {
    format!("00000001{:08X}{:08X}", 0, seg)
}

/// A small data directory with `files` heap files under base/1.
pub fn data_dir(root: &Path, files: usize) {
    std::fs::create_dir_all(root.join("base/1")).unwrap();
    std::fs::create_dir_all(root.join("global")).unwrap();
    std::fs::create_dir_all(root.join("pg_xlog/archive_status")).unwrap();
    std::fs::write(root.join("PG_VERSION"), b"9.6\n").unwrap();
    std::fs::write(root.join("global/pg_control"), vec![3u8; 8192]).unwrap();
    std::fs::write(root.join("postmaster.pid"), b"4242\n").unwrap();
    std::fs::write(root.join("pg_xlog/000000010000000000000002"), vec![1u8; 1024]).unwrap();
    for i in 1..=files {
        std::fs::write(root.join(format!("base/1/{}", i)), segment_bytes(i as u32, 10_000 * i)).unwrap();
    }
}

/// Backup control reporting start 0/2+0x28 and stop 0/3+0x100.
pub fn scripted_control() -> Arc<ScriptedBackupControl> {
    Arc::new(ScriptedBackupControl::new(
        WalPosition::new("000000010000000000000002".parse().unwrap(), 0x28),
        WalPosition::new("000000010000000000000003".parse().unwrap(), 0x100),
    ))
}
