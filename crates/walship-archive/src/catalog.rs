//! Listing and restoring stored base backups.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::context::{ArtifactKind, StorageContext};
use crate::error::{ArchiveError, ArchiveResult};
use crate::manifest::{BackupManifest, EntryKind};
use crate::scheduler::TransferScheduler;
use crate::segment::WalPosition;
use crate::transfer::TransferEngine;

/// Selects the newest backup in [`BackupCatalog::backup_fetch`].
pub const LATEST: &str = "LATEST";

/// One complete backup as seen in the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupInfo {
    /// Backup label.
    pub label: String,
    /// Start position, decoded from the label.
    pub start: WalPosition,
    /// Stop position (detail only).
    pub stop: Option<WalPosition>,
    /// When the manifest was written (detail only).
    pub created_at: Option<DateTime<Utc>>,
    /// Sum of source file sizes (detail only).
    pub expanded_size_bytes: Option<u64>,
    /// Number of file artifacts (detail only).
    pub file_count: Option<usize>,
    /// Server version (detail only).
    pub pg_version: Option<String>,
}

/// Read side of base backups: list and restore.
pub struct BackupCatalog {
    engine: Arc<TransferEngine>,
    ctx: StorageContext,
    scheduler: TransferScheduler,
}

impl BackupCatalog {
    /// Create a catalog over one context.
    pub fn new(engine: Arc<TransferEngine>, ctx: StorageContext, scheduler: TransferScheduler) -> Self {
        Self {
            engine,
            ctx,
            scheduler,
        }
    }

    /// Complete backups, newest first. `query` filters labels by substring;
    /// `detail` loads each manifest.
    pub async fn backup_list(
        &self,
        query: Option<&str>,
        detail: bool,
        cancel: &CancellationToken,
    ) -> ArchiveResult<Vec<BackupInfo>> {
        let objects = self
            .engine
            .list(&self.ctx.basebackups_prefix(), cancel)
            .await?;

        let mut backups = Vec::new();
        for object in objects {
            let label = match self.ctx.parse_key(&object.key) {
                Some((ArtifactKind::Manifest, label)) => label,
                _ => continue,
            };
            if query.map_or(false, |q| !label.contains(q)) {
                continue;
            }
            let start = WalPosition::from_backup_label(&label)?;
            let mut info = BackupInfo {
                label,
                start,
                stop: None,
                created_at: None,
                expanded_size_bytes: None,
                file_count: None,
                pg_version: None,
            };
            if detail {
                let manifest = self.load_manifest(&info.label, cancel).await?;
                info.stop = Some(manifest.stop);
                info.created_at = Some(manifest.created_at);
                info.expanded_size_bytes = Some(manifest.expanded_size_bytes);
                info.file_count = Some(manifest.file_count());
                info.pg_version = Some(manifest.pg_version);
            }
            backups.push(info);
        }
        backups.sort_by(|a, b| b.start.cmp(&a.start));
        Ok(backups)
    }

    /// Fetch and check the manifest of `label`.
    pub async fn load_manifest(
        &self,
        label: &str,
        cancel: &CancellationToken,
    ) -> ArchiveResult<BackupManifest> {
        let key = self.ctx.manifest_key(label)?;
        let data = self.engine.fetch(&key, cancel).await?;
        let manifest = BackupManifest::from_json(key.as_str(), &data)?;
        if manifest.label != label {
            return Err(ArchiveError::CorruptArtifact {
                key: key.to_string(),
                reason: format!("manifest describes {}, not {}", manifest.label, label),
            });
        }
        Ok(manifest)
    }

    /// Resolve a backup name or [`LATEST`] to a stored label.
    pub async fn resolve(&self, name: &str, cancel: &CancellationToken) -> ArchiveResult<String> {
        if name == LATEST {
            return self
                .backup_list(None, false, cancel)
                .await?
                .into_iter()
                .next()
                .map(|b| b.label)
                .ok_or_else(|| ArchiveError::NotFound {
                    key: self.ctx.basebackups_prefix(),
                });
        }
        WalPosition::from_backup_label(name)?;
        Ok(name.to_string())
    }

    /// Restore backup `name` (a label or [`LATEST`]) into `dest`, which
    /// must be empty or not exist yet.
    #[instrument(skip_all, fields(name = %name, dest = %dest.display()))]
    pub async fn backup_fetch(
        &self,
        name: &str,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> ArchiveResult<BackupManifest> {
        let label = self.resolve(name, cancel).await?;
        let manifest = self.load_manifest(&label, cancel).await?;
        prepare_destination(&label, dest)?;

        for entry in &manifest.entries {
            if entry.kind == EntryKind::Directory {
                std::fs::create_dir_all(dest.join(&entry.path))?;
            }
        }

        let tasks: Vec<_> = manifest
            .entries
            .iter()
            .filter_map(|entry| match &entry.kind {
                EntryKind::File {
                    key,
                    raw_size,
                    checksum,
                    ..
                } => Some((key.clone(), *raw_size, checksum.clone(), dest.join(&entry.path))),
                _ => None,
            })
            .map(|(key, raw_size, checksum, path)| {
                let engine = Arc::clone(&self.engine);
                let cancel = cancel.clone();
                move || async move {
                    let written = engine
                        .fetch_checked_to_path(&key, &checksum, &path, &cancel)
                        .await
                        .map_err(|e| match e {
                            ArchiveError::NotFound { key } => ArchiveError::CorruptArtifact {
                                key,
                                reason: "listed in the backup manifest but missing from the store"
                                    .to_string(),
                            },
                            other => other,
                        })?;
                    if written != raw_size {
                        return Err(ArchiveError::CorruptArtifact {
                            key: key.to_string(),
                            reason: format!("restored {} bytes, manifest says {}", written, raw_size),
                        });
                    }
                    Ok(written)
                }
            })
            .collect();
        let restored = self.scheduler.run(tasks, cancel).await.into_result()?;

        for entry in &manifest.entries {
            if let EntryKind::Symlink { target } = &entry.kind {
                restore_symlink(target, &dest.join(&entry.path))?;
            }
        }

        info!(
            label = %label,
            files = restored.len(),
            bytes = restored.iter().sum::<u64>(),
            "base backup restored"
        );
        Ok(manifest)
    }
}

fn prepare_destination(label: &str, dest: &Path) -> ArchiveResult<()> {
    match std::fs::read_dir(dest) {
        Ok(mut entries) => {
            if entries.next().is_some() {
                return Err(ArchiveError::Backup {
                    label: label.to_string(),
                    reason: format!("destination {} is not empty", dest.display()),
                });
            }
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            std::fs::create_dir_all(dest)?;
            Ok(())
        }
        Err(e) => Err(ArchiveError::Backup {
            label: label.to_string(),
            reason: format!("destination {} is unusable: {}", dest.display(), e),
        }),
    }
}

#[cfg(unix)]
fn restore_symlink(target: &str, link: &Path) -> ArchiveResult<()> {
    if let Some(parent) = link.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::os::unix::fs::symlink(PathBuf::from(target), link)?;
    debug!(link = %link.display(), target, "symlink restored");
    Ok(())
}

#[cfg(not(unix))]
fn restore_symlink(target: &str, link: &Path) -> ArchiveResult<()> {
    tracing::warn!(link = %link.display(), target, "symlinks are not restored on this platform");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup_control::ScriptedBackupControl;
    use crate::lifecycle::BackupCoordinator;
    use crate::retry::RetryConfig;
    use crate::spool::{Spool, SpoolMode};
    use crate::store::MemoryObjectStore;
    use std::time::Duration;

    fn pos(seg: &str, offset: u32) -> WalPosition {
        WalPosition::new(seg.parse().unwrap(), offset)
    }

    struct Fixture {
        store: Arc<MemoryObjectStore>,
        engine: Arc<TransferEngine>,
        ctx: StorageContext,
        catalog: BackupCatalog,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryObjectStore::new());
        let engine = Arc::new(TransferEngine::new(
            store.clone(),
            RetryConfig {
                initial_backoff: Duration::from_millis(1),
                jitter: false,
                ..Default::default()
            },
            Spool::new(SpoolMode::Memory),
        ));
        let ctx = StorageContext::parse("memory://catalog").unwrap();
        let catalog = BackupCatalog::new(engine.clone(), ctx.clone(), TransferScheduler::new(3));
        Fixture {
            store,
            engine,
            ctx,
            catalog,
        }
    }

    async fn take_backup(f: &Fixture, data_dir: &Path, start: &str, stop: &str) -> BackupManifest {
        let control = Arc::new(ScriptedBackupControl::new(pos(start, 0x28), pos(stop, 0x100)));
        BackupCoordinator::new(
            f.engine.clone(),
            f.ctx.clone(),
            control,
            TransferScheduler::new(2),
        )
        .backup_push(data_dir, &CancellationToken::new())
        .await
        .unwrap()
    }

    fn sample_data_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("base/1")).unwrap();
        std::fs::create_dir_all(root.join("pg_xlog/archive_status")).unwrap();
        std::fs::create_dir_all(root.join("pg_stat_tmp")).unwrap();
        std::fs::write(root.join("PG_VERSION"), b"9.6\n").unwrap();
        std::fs::write(root.join("base/1/1259"), vec![7u8; 40_000]).unwrap();
        std::fs::write(root.join("base/1/empty"), b"").unwrap();
        dir
    }

    #[tokio::test]
    async fn test_backup_roundtrip() {
        let f = fixture();
        let src = sample_data_dir();
        #[cfg(unix)]
        std::os::unix::fs::symlink("/mnt/ts1", src.path().join("tblspc_link")).unwrap();
        let manifest = take_backup(&f, src.path(), "000000010000000000000002", "000000010000000000000003").await;

        let out = tempfile::tempdir().unwrap();
        let dest = out.path().join("restore");
        let restored = f
            .catalog
            .backup_fetch(&manifest.label, &dest, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(restored, manifest);
        assert_eq!(std::fs::read(dest.join("PG_VERSION")).unwrap(), b"9.6\n");
        assert_eq!(std::fs::read(dest.join("base/1/1259")).unwrap(), vec![7u8; 40_000]);
        assert_eq!(std::fs::read(dest.join("base/1/empty")).unwrap(), b"");
        assert!(dest.join("pg_stat_tmp").is_dir());
        assert!(dest.join("pg_xlog").is_dir());
        #[cfg(unix)]
        assert_eq!(
            std::fs::read_link(dest.join("tblspc_link")).unwrap(),
            PathBuf::from("/mnt/ts1")
        );
    }

    #[tokio::test]
    async fn test_list_newest_first_with_query_and_detail() {
        let f = fixture();
        let src = sample_data_dir();
        take_backup(&f, src.path(), "000000010000000000000002", "000000010000000000000002").await;
        take_backup(&f, src.path(), "000000010000000000000010", "000000010000000000000011").await;
        let cancel = CancellationToken::new();

        let list = f.catalog.backup_list(None, false, &cancel).await.unwrap();
        let labels: Vec<_> = list.iter().map(|b| b.label.as_str()).collect();
        assert_eq!(
            labels,
            vec![
                "base_000000010000000000000010_00000028",
                "base_000000010000000000000002_00000028",
            ]
        );
        assert!(list[0].stop.is_none());

        let detailed = f
            .catalog
            .backup_list(Some("0002_"), true, &cancel)
            .await
            .unwrap();
        assert_eq!(detailed.len(), 1);
        assert_eq!(detailed[0].file_count, Some(3));
        assert_eq!(detailed[0].expanded_size_bytes, Some(40_004));
        assert_eq!(
            detailed[0].pg_version.as_deref(),
            Some("PostgreSQL 9.6.24 (scripted)")
        );

        assert_eq!(
            f.catalog.resolve(LATEST, &cancel).await.unwrap(),
            "base_000000010000000000000010_00000028"
        );
    }

    #[tokio::test]
    async fn test_fetch_latest_without_backups_is_not_found() {
        let f = fixture();
        let out = tempfile::tempdir().unwrap();
        let err = f
            .catalog
            .backup_fetch(LATEST, out.path(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ArchiveError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_fetch_rejects_bad_name_and_nonempty_destination() {
        let f = fixture();
        let src = sample_data_dir();
        let manifest = take_backup(&f, src.path(), "000000010000000000000002", "000000010000000000000002").await;
        let cancel = CancellationToken::new();

        let err = f
            .catalog
            .backup_fetch("yesterday", src.path(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ArchiveError::InvalidIdentifier { .. }));

        let err = f
            .catalog
            .backup_fetch(&manifest.label, src.path(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ArchiveError::Backup { .. }));
    }

    #[tokio::test]
    async fn test_fetch_detects_corrupt_file_artifact() {
        let f = fixture();
        let src = sample_data_dir();
        let manifest = take_backup(&f, src.path(), "000000010000000000000002", "000000010000000000000002").await;
        let key = f.ctx.backup_file_key(&manifest.label, "base/1/1259").unwrap();
        assert!(f.store.corrupt(key.as_str()));

        let out = tempfile::tempdir().unwrap();
        let err = f
            .catalog
            .backup_fetch(&manifest.label, &out.path().join("r"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ArchiveError::CorruptArtifact { .. }));
        assert_eq!(err.exit_code(), 3);
    }

    #[tokio::test]
    async fn test_fetch_with_missing_file_artifact_is_not_absent() {
        let f = fixture();
        let src = sample_data_dir();
        let manifest = take_backup(&f, src.path(), "000000010000000000000002", "000000010000000000000002").await;
        let cancel = CancellationToken::new();
        let key = f.ctx.backup_file_key(&manifest.label, "PG_VERSION").unwrap();
        f.engine.delete(&key, &cancel).await.unwrap();
        assert!(f.store.raw(key.as_str()).is_none());

        let out = tempfile::tempdir().unwrap();
        let err = f
            .catalog
            .backup_fetch(LATEST, &out.path().join("r"), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ArchiveError::CorruptArtifact { ref key, .. } if key.ends_with("files/PG_VERSION.lz4")));
        assert_ne!(err.exit_code(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_manifest_is_reported() {
        let f = fixture();
        let label = "base_000000010000000000000002_00000028";
        let key = f.ctx.manifest_key(label).unwrap();
        f.store.insert_raw(key.as_str(), b"{\"label\": 1".to_vec());
        let err = f
            .catalog
            .load_manifest(label, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ArchiveError::CorruptArtifact { .. }));
    }
}
