//! Base backup manifest: the completion sentinel of a backup.
//!
//! A manifest is written only after every file artifact it lists has been
//! stored and verified, so its presence is what makes a backup restorable.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::context::{validate_relative_path, ArtifactKey};
use crate::error::{ArchiveError, ArchiveResult};
use crate::segment::WalPosition;

/// What a manifest entry describes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EntryKind {
    /// A regular file stored as a compressed artifact.
    File {
        /// Artifact key.
        key: ArtifactKey,
        /// Size of the source file.
        raw_size: u64,
        /// Size of the stored artifact.
        stored_size: u64,
        /// Hex SHA-256 of the stored artifact.
        checksum: String,
    },
    /// A directory, recreated empty before files are restored.
    Directory,
    /// A symbolic link and its target.
    Symlink {
        /// Link target as read from the source.
        target: String,
    },
}

/// One path of the backed-up data directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// `/`-separated path relative to the data directory.
    pub path: String,
    /// Entry payload.
    pub kind: EntryKind,
}

/// Summary record of a completed base backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupManifest {
    /// Backup label, derived from the start position.
    pub label: String,
    /// WAL position returned by start-backup.
    pub start: WalPosition,
    /// WAL position returned by stop-backup.
    pub stop: WalPosition,
    /// Server version reported by the backup-control client.
    pub pg_version: String,
    /// Sum of source file sizes.
    pub expanded_size_bytes: u64,
    /// When the manifest was finalized.
    pub created_at: DateTime<Utc>,
    /// Always true for a written manifest.
    pub complete: bool,
    /// Entries sorted by path.
    pub entries: Vec<ManifestEntry>,
}

impl BackupManifest {
    /// Assemble a complete manifest. Entries are sorted by path.
    pub fn new(
        start: WalPosition,
        stop: WalPosition,
        pg_version: String,
        mut entries: Vec<ManifestEntry>,
    ) -> Self {
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        let expanded_size_bytes = entries
            .iter()
            .map(|e| match &e.kind {
                EntryKind::File { raw_size, .. } => *raw_size,
                _ => 0,
            })
            .sum();
        Self {
            label: start.backup_label(),
            start,
            stop,
            pg_version,
            expanded_size_bytes,
            created_at: Utc::now(),
            complete: true,
            entries,
        }
    }

    /// Number of file entries.
    pub fn file_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e.kind, EntryKind::File { .. }))
            .count()
    }

    /// Sum of stored artifact sizes.
    pub fn stored_size_bytes(&self) -> u64 {
        self.entries
            .iter()
            .map(|e| match &e.kind {
                EntryKind::File { stored_size, .. } => *stored_size,
                _ => 0,
            })
            .sum()
    }

    /// Serialize as pretty JSON.
    pub fn to_json(&self) -> ArchiveResult<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Parse and check a stored manifest. Anything unreadable or
    /// inconsistent is a corrupt artifact.
    pub fn from_json(key: &str, data: &[u8]) -> ArchiveResult<Self> {
        let manifest: BackupManifest =
            serde_json::from_slice(data).map_err(|e| ArchiveError::CorruptArtifact {
                key: key.to_string(),
                reason: format!("manifest does not parse: {}", e),
            })?;
        manifest
            .check()
            .map_err(|reason| ArchiveError::CorruptArtifact {
                key: key.to_string(),
                reason,
            })?;
        Ok(manifest)
    }

    fn check(&self) -> Result<(), String> {
        if !self.complete {
            return Err("manifest is not marked complete".to_string());
        }
        if self.label != self.start.backup_label() {
            return Err(format!(
                "label {} does not match start position {}",
                self.label, self.start
            ));
        }
        if self.stop < self.start {
            return Err(format!(
                "stop position {} precedes start {}",
                self.stop, self.start
            ));
        }
        let mut seen = HashSet::new();
        for entry in &self.entries {
            validate_relative_path(&entry.path)
                .map_err(|_| format!("invalid entry path {:?}", entry.path))?;
            if !seen.insert(entry.path.as_str()) {
                return Err(format!("duplicate entry path {:?}", entry.path));
            }
        }
        Ok(())
    }
}
