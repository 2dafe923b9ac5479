//! Base backup lifecycle.
//!
//! ```text
//! Idle -> StartRequested -> FileEnumeration -> Uploading
//!      -> StopRequested -> ManifestWrite -> Complete
//! ```
//!
//! Any non-terminal state may move to `Aborted`. The manifest is the last
//! thing written; an aborted backup never has one. Once the backup window
//! is open it is always closed again, even when the backup fails.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::backup_control::BackupControl;
use crate::context::StorageContext;
use crate::enumerate::{enumerate_data_dir, SourceKind};
use crate::error::{ArchiveError, ArchiveResult};
use crate::manifest::{BackupManifest, EntryKind, ManifestEntry};
use crate::scheduler::TransferScheduler;
use crate::throttle::ReadThrottle;
use crate::transfer::TransferEngine;

/// Where a base backup is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackupState {
    /// Nothing started.
    Idle,
    /// Asking the server to enter backup mode.
    StartRequested,
    /// Walking the data directory.
    FileEnumeration,
    /// Pushing file artifacts.
    Uploading,
    /// Asking the server to leave backup mode.
    StopRequested,
    /// Writing the manifest.
    ManifestWrite,
    /// Manifest stored; the backup is restorable.
    Complete,
    /// Failed or cancelled; no manifest exists.
    Aborted,
}

impl BackupState {
    /// Whether no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, BackupState::Complete | BackupState::Aborted)
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(&self, next: BackupState) -> bool {
        use BackupState::*;
        match (self, next) {
            (Idle, StartRequested)
            | (StartRequested, FileEnumeration)
            | (FileEnumeration, Uploading)
            | (Uploading, StopRequested)
            | (StopRequested, ManifestWrite)
            | (ManifestWrite, Complete) => true,
            (s, Aborted) => !s.is_terminal(),
            _ => false,
        }
    }
}

/// Drives one base backup at a time through its lifecycle.
pub struct BackupCoordinator {
    engine: Arc<TransferEngine>,
    ctx: StorageContext,
    control: Arc<dyn BackupControl>,
    scheduler: TransferScheduler,
    excludes: Vec<String>,
    throttle: Option<ReadThrottle>,
    state: watch::Sender<BackupState>,
    history: Mutex<Vec<BackupState>>,
}

impl BackupCoordinator {
    /// Create an idle coordinator.
    pub fn new(
        engine: Arc<TransferEngine>,
        ctx: StorageContext,
        control: Arc<dyn BackupControl>,
        scheduler: TransferScheduler,
    ) -> Self {
        let (state, _) = watch::channel(BackupState::Idle);
        Self {
            engine,
            ctx,
            control,
            scheduler,
            excludes: Vec::new(),
            throttle: None,
            state,
            history: Mutex::new(vec![BackupState::Idle]),
        }
    }

    /// Leave these data directory paths out of backups.
    pub fn with_excludes(mut self, excludes: Vec<String>) -> Self {
        self.excludes = excludes;
        self
    }

    /// Cap the combined read rate of the data directory, in bytes per second.
    pub fn with_read_rate_limit(mut self, bytes_per_sec: Option<u64>) -> Self {
        self.throttle = bytes_per_sec.map(ReadThrottle::new);
        self
    }

    /// Current state.
    pub fn state(&self) -> BackupState {
        *self.state.borrow()
    }

    /// Observe state changes.
    pub fn subscribe(&self) -> watch::Receiver<BackupState> {
        self.state.subscribe()
    }

    /// States visited by the current (or last) backup, in order.
    pub fn history(&self) -> Vec<BackupState> {
        self.history.lock().map(|h| h.clone()).unwrap_or_default()
    }

    fn transition(&self, next: BackupState) -> ArchiveResult<()> {
        let current = self.state();
        if !current.can_transition_to(next) {
            return Err(ArchiveError::permanent(
                "backup lifecycle",
                format!("illegal transition {:?} -> {:?}", current, next),
            ));
        }
        debug!(from = ?current, to = ?next, "backup state");
        self.state.send_replace(next);
        if let Ok(mut h) = self.history.lock() {
            h.push(next);
        }
        Ok(())
    }

    fn reset(&self) -> ArchiveResult<()> {
        let current = self.state();
        if current != BackupState::Idle && !current.is_terminal() {
            return Err(ArchiveError::permanent(
                "backup lifecycle",
                format!("a backup is already running ({:?})", current),
            ));
        }
        self.state.send_replace(BackupState::Idle);
        if let Ok(mut h) = self.history.lock() {
            *h = vec![BackupState::Idle];
        }
        Ok(())
    }

    /// Take a base backup of `data_dir` and return its stored manifest.
    #[instrument(skip_all, fields(data_dir = %data_dir.display()))]
    pub async fn backup_push(
        &self,
        data_dir: &Path,
        cancel: &CancellationToken,
    ) -> ArchiveResult<BackupManifest> {
        self.reset()?;
        self.transition(BackupState::StartRequested)?;

        let pg_version = match self.control.server_version().await {
            Ok(v) => v,
            Err(e) => return Err(self.abort(None, false, e).await),
        };
        let request_label = format!("walship_{}", Utc::now().format("%Y%m%dT%H%M%SZ"));
        let start = match self.control.start_backup(&request_label).await {
            Ok(p) => p,
            Err(e) => return Err(self.abort(None, false, e).await),
        };
        let label = start.backup_label();
        info!(label = %label, start = %start, "base backup started");

        match self.capture(data_dir, &label, cancel).await {
            Ok(entries) => {
                if let Err(e) = self.transition(BackupState::StopRequested) {
                    return Err(self.abort(Some(&label), true, e).await);
                }
                let stop = match self.control.stop_backup().await {
                    Ok(p) => p,
                    Err(e) => return Err(self.abort(Some(&label), false, e).await),
                };
                if let Err(e) = self.transition(BackupState::ManifestWrite) {
                    return Err(self.abort(Some(&label), false, e).await);
                }
                let manifest = BackupManifest::new(start, stop, pg_version, entries);
                if let Err(e) = self.write_manifest(&manifest, cancel).await {
                    return Err(self.abort(Some(&label), false, e).await);
                }
                self.transition(BackupState::Complete)?;
                info!(
                    label = %label,
                    stop = %stop,
                    files = manifest.file_count(),
                    expanded_bytes = manifest.expanded_size_bytes,
                    stored_bytes = manifest.stored_size_bytes(),
                    "base backup complete"
                );
                Ok(manifest)
            }
            Err(e) => Err(self.abort(Some(&label), true, e).await),
        }
    }

    /// Enumerate and upload; returns every manifest entry on success.
    async fn capture(
        &self,
        data_dir: &Path,
        label: &str,
        cancel: &CancellationToken,
    ) -> ArchiveResult<Vec<ManifestEntry>> {
        self.transition(BackupState::FileEnumeration)?;
        let root = data_dir.to_path_buf();
        let excludes = self.excludes.clone();
        let sources = tokio::task::spawn_blocking(move || enumerate_data_dir(&root, &excludes))
            .await
            .map_err(|e| ArchiveError::permanent("enumerate", e))??;

        self.transition(BackupState::Uploading)?;
        let mut entries = Vec::with_capacity(sources.len());
        let mut files: Vec<(String, PathBuf)> = Vec::new();
        for source in sources {
            match source.kind {
                SourceKind::File { .. } => files.push((source.relative, source.path)),
                SourceKind::Directory => entries.push(ManifestEntry {
                    path: source.relative,
                    kind: EntryKind::Directory,
                }),
                SourceKind::Symlink { target } => entries.push(ManifestEntry {
                    path: source.relative,
                    kind: EntryKind::Symlink { target },
                }),
            }
        }
        debug!(
            files = files.len(),
            other = entries.len(),
            read_limit = ?self.throttle.as_ref().map(ReadThrottle::bytes_per_sec),
            "uploading backup files"
        );

        let tasks: Vec<_> = files
            .into_iter()
            .map(|(relative, path)| {
                let engine = Arc::clone(&self.engine);
                let key = self.ctx.backup_file_key(label, &relative);
                let cancel = cancel.clone();
                let throttle = self.throttle.clone();
                move || async move {
                    let key = key?;
                    let (staged, stats) = match engine.stage_file_throttled(&path, throttle).await {
                        Ok(s) => s,
                        Err(ArchiveError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                            debug!(path = %relative, "file vanished during backup");
                            return Ok(None);
                        }
                        Err(e) => return Err(e),
                    };
                    let artifact = engine.push(&key, &staged, &cancel).await?;
                    Ok::<_, ArchiveError>(Some(ManifestEntry {
                        path: relative,
                        kind: EntryKind::File {
                            key: artifact.key,
                            raw_size: stats.raw_bytes,
                            stored_size: artifact.size,
                            checksum: artifact.checksum,
                        },
                    }))
                }
            })
            .collect();

        let uploaded = self.scheduler.run(tasks, cancel).await.into_result()?;
        entries.extend(uploaded.into_iter().flatten());
        Ok(entries)
    }

    async fn write_manifest(
        &self,
        manifest: &BackupManifest,
        cancel: &CancellationToken,
    ) -> ArchiveResult<()> {
        let key = self.ctx.manifest_key(&manifest.label)?;
        let json = manifest.to_json()?;
        self.engine.push_bytes(&key, &json, cancel).await?;
        Ok(())
    }

    /// Move to `Aborted`, closing the backup window and removing uploaded
    /// artifacts on a best-effort basis. Returns the original error.
    ///
    /// A manifest that may have reached the store is removed before any
    /// file, so the store never shows a complete backup missing its files.
    async fn abort(&self, label: Option<&str>, stop: bool, error: ArchiveError) -> ArchiveError {
        let state = self.state();
        warn!(error = %error, state = ?state, "base backup aborted");
        if stop {
            if let Err(e) = self.control.stop_backup().await {
                warn!(error = %e, "stop_backup after failure also failed");
            }
        }
        if let Some(label) = label {
            if state == BackupState::ManifestWrite {
                self.remove_manifest(label).await;
            }
            self.remove_artifacts(label).await;
        }
        if let Err(e) = self.transition(BackupState::Aborted) {
            warn!(error = %e, "could not record abort");
        }
        error
    }

    async fn remove_manifest(&self, label: &str) {
        let key = match self.ctx.manifest_key(label) {
            Ok(k) => k,
            Err(_) => return,
        };
        if let Err(e) = self.engine.delete(&key, &CancellationToken::new()).await {
            warn!(error = %e, key = %key, "could not remove manifest of aborted backup");
        }
    }

    async fn remove_artifacts(&self, label: &str) {
        let prefix = match self.ctx.backup_files_prefix(label) {
            Ok(p) => p,
            Err(_) => return,
        };
        // Cleanup must run even when the backup itself was cancelled.
        let cleanup = CancellationToken::new();
        let objects = match self.engine.list(&prefix, &cleanup).await {
            Ok(o) => o,
            Err(e) => {
                warn!(error = %e, prefix = %prefix, "could not list artifacts of aborted backup");
                return;
            }
        };
        let mut removed = 0usize;
        for object in objects {
            let key = match self.ctx.parse_key(&object.key) {
                Some((kind, id)) => match self.ctx.resolve_key(kind, &id) {
                    Ok(k) => k,
                    Err(_) => continue,
                },
                None => continue,
            };
            match self.engine.delete(&key, &cleanup).await {
                Ok(()) => removed += 1,
                Err(e) => warn!(error = %e, key = %key, "could not remove artifact of aborted backup"),
            }
        }
        debug!(label, removed, "aborted backup artifacts removed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup_control::ScriptedBackupControl;
    use crate::retry::RetryConfig;
    use crate::segment::WalPosition;
    use crate::spool::{Spool, SpoolMode};
    use crate::store::{Fault, MemoryObjectStore, StoreOp};
    use std::time::Duration;

    fn pos(seg: &str, offset: u32) -> WalPosition {
        WalPosition::new(seg.parse().unwrap(), offset)
    }

    struct Fixture {
        store: Arc<MemoryObjectStore>,
        control: Arc<ScriptedBackupControl>,
        ctx: StorageContext,
        coordinator: BackupCoordinator,
    }

    fn fixture(control: ScriptedBackupControl) -> Fixture {
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
        let ctx = StorageContext::parse("memory://lifecycle/c1").unwrap();
        let control = Arc::new(control);
        let coordinator = BackupCoordinator::new(
            engine,
            ctx.clone(),
            control.clone(),
            TransferScheduler::new(2),
        );
        Fixture {
            store,
            control,
            ctx,
            coordinator,
        }
    }

    fn scripted() -> ScriptedBackupControl {
        ScriptedBackupControl::new(
            pos("000000010000000000000002", 0x28),
            pos("000000010000000000000002", 0x130),
        )
    }

    fn data_dir(files: usize) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("base/1")).unwrap();
        for i in 1..=files {
            std::fs::write(dir.path().join(format!("base/1/{}", i)), vec![i as u8; 1000 * i]).unwrap();
        }
        dir
    }

    #[test]
    fn test_transitions() {
        use BackupState::*;
        assert!(Idle.can_transition_to(StartRequested));
        assert!(Uploading.can_transition_to(StopRequested));
        assert!(!Uploading.can_transition_to(ManifestWrite));
        assert!(!Idle.can_transition_to(Complete));
        assert!(Uploading.can_transition_to(Aborted));
        assert!(!Complete.can_transition_to(Aborted));
        assert!(!Aborted.can_transition_to(Aborted));
    }

    #[tokio::test]
    async fn test_successful_backup_walks_every_state() {
        let f = fixture(scripted());
        let dir = data_dir(3);
        let manifest = f
            .coordinator
            .backup_push(dir.path(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(manifest.label, "base_000000010000000000000002_00000028");
        assert_eq!(manifest.file_count(), 3);
        assert_eq!(manifest.expanded_size_bytes, 6000);
        assert_eq!(f.coordinator.state(), BackupState::Complete);
        assert_eq!(
            f.coordinator.history(),
            vec![
                BackupState::Idle,
                BackupState::StartRequested,
                BackupState::FileEnumeration,
                BackupState::Uploading,
                BackupState::StopRequested,
                BackupState::ManifestWrite,
                BackupState::Complete,
            ]
        );
        assert_eq!(f.control.calls(), vec!["start_backup", "stop_backup"]);
        let manifest_key = f.ctx.manifest_key(&manifest.label).unwrap();
        assert!(f.store.raw(manifest_key.as_str()).is_some());
    }

    #[tokio::test]
    async fn test_throttled_backup_completes() {
        let mut f = fixture(scripted());
        f.coordinator = f.coordinator.with_read_rate_limit(Some(1024 * 1024));
        let dir = data_dir(3);
        let manifest = f
            .coordinator
            .backup_push(dir.path(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(manifest.expanded_size_bytes, 6000);
        assert_eq!(f.coordinator.state(), BackupState::Complete);
    }

    #[tokio::test]
    async fn test_upload_failure_aborts_without_manifest() {
        let f = fixture(scripted());
        let dir = data_dir(5);
        f.store
            .inject(StoreOp::Put, "base/1/3.lz4", Fault::Permanent, 1);

        let err = f
            .coordinator
            .backup_push(dir.path(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ArchiveError::Permanent { .. }));
        assert_eq!(f.coordinator.state(), BackupState::Aborted);
        assert_eq!(f.control.calls(), vec!["start_backup", "stop_backup"]);
        assert!(f
            .store
            .keys()
            .iter()
            .all(|k| !k.ends_with("_backup_stop_sentinel.json")));
        assert_eq!(f.store.object_count(), 0, "uploaded files are cleaned up");
    }

    #[tokio::test]
    async fn test_start_failure_does_not_stop() {
        let f = fixture(scripted().failing_start());
        let dir = data_dir(1);
        let err = f
            .coordinator
            .backup_push(dir.path(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ArchiveError::BackupControl { op: "start_backup", .. }));
        assert_eq!(f.control.calls(), vec!["start_backup"]);
        assert_eq!(
            f.coordinator.history(),
            vec![BackupState::Idle, BackupState::StartRequested, BackupState::Aborted]
        );
    }

    #[tokio::test]
    async fn test_stop_failure_aborts() {
        let f = fixture(scripted().failing_stop());
        let dir = data_dir(2);
        let err = f
            .coordinator
            .backup_push(dir.path(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ArchiveError::BackupControl { op: "stop_backup", .. }));
        assert_eq!(f.coordinator.state(), BackupState::Aborted);
        assert_eq!(f.store.object_count(), 0);
    }

    #[tokio::test]
    async fn test_manifest_write_failure_aborts() {
        let f = fixture(scripted());
        let dir = data_dir(2);
        f.store
            .inject(StoreOp::Put, "_backup_stop_sentinel.json", Fault::Permanent, 1);
        f.coordinator
            .backup_push(dir.path(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(f.coordinator.state(), BackupState::Aborted);
        assert_eq!(f.store.object_count(), 0);
    }

    #[tokio::test]
    async fn test_unverified_manifest_is_removed() {
        let f = fixture(scripted());
        let dir = data_dir(3);
        f.store
            .inject(StoreOp::Head, "_backup_stop_sentinel.json", Fault::Transient, 3);
        // The push's own cleanup fails; the abort path must still remove it.
        f.store
            .inject(StoreOp::Delete, "_backup_stop_sentinel.json", Fault::Transient, 3);

        let err = f
            .coordinator
            .backup_push(dir.path(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ArchiveError::RetriesExhausted { .. }));
        assert_eq!(f.coordinator.state(), BackupState::Aborted);
        assert_eq!(f.control.calls(), vec!["start_backup", "stop_backup"]);
        assert!(f.store.keys().is_empty(), "left behind: {:?}", f.store.keys());

        let catalog = crate::catalog::BackupCatalog::new(
            Arc::clone(&f.coordinator.engine),
            f.ctx.clone(),
            TransferScheduler::new(2),
        );
        let listed = catalog
            .backup_list(None, false, &CancellationToken::new())
            .await
            .unwrap();
        assert!(listed.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_backup_closes_window() {
        let f = fixture(scripted());
        let dir = data_dir(4);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = f.coordinator.backup_push(dir.path(), &cancel).await.unwrap_err();
        assert!(matches!(err, ArchiveError::Cancelled));
        assert_eq!(f.coordinator.state(), BackupState::Aborted);
        assert_eq!(f.control.calls(), vec!["start_backup", "stop_backup"]);
    }

    #[tokio::test]
    async fn test_coordinator_is_reusable_after_terminal_state() {
        let f = fixture(scripted());
        let dir = data_dir(1);
        let mut rx = f.coordinator.subscribe();
        f.coordinator
            .backup_push(dir.path(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), BackupState::Complete);

        f.coordinator
            .backup_push(dir.path(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(f.coordinator.history().len(), 7);
    }
}
