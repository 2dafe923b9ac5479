//! Operation entry points, one per archive command.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::backup_control::BackupControl;
use crate::catalog::{BackupCatalog, BackupInfo};
use crate::config::ArchiveConfig;
use crate::context::StorageContext;
use crate::continuity::{ContinuityTracker, Gap, TimelineAudit, WalFetchOutcome};
use crate::error::{ArchiveError, ArchiveResult};
use crate::lifecycle::BackupCoordinator;
use crate::manifest::BackupManifest;
use crate::scheduler::{TransferScheduler, WalPushPipeline};
use crate::segment::{SegmentName, WalFileName};
use crate::spool::Spool;
use crate::store::{store_from_context, ObjectStore};
use crate::transfer::{ArtifactRef, TransferEngine};

const READY_SUFFIX: &str = ".ready";
const DONE_SUFFIX: &str = ".done";

/// Outcome of a WAL verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalVerification {
    /// A bounded range was checked.
    Range {
        /// First segment required.
        start: SegmentName,
        /// Last segment required.
        end: SegmentName,
        /// First hole, if any.
        gap: Option<Gap>,
    },
    /// Every timeline in the archive was checked.
    Audit(Vec<TimelineAudit>),
}

impl WalVerification {
    /// Whether no gap was found.
    pub fn is_continuous(&self) -> bool {
        match self {
            WalVerification::Range { gap, .. } => gap.is_none(),
            WalVerification::Audit(timelines) => timelines.iter().all(|t| t.gaps.is_empty()),
        }
    }
}

/// Archive operations bound to one context and configuration.
pub struct Archiver {
    config: ArchiveConfig,
    ctx: StorageContext,
    engine: Arc<TransferEngine>,
}

impl Archiver {
    /// Build an archiver and its store client from configuration.
    pub fn from_config(config: ArchiveConfig) -> ArchiveResult<Self> {
        config.validate()?;
        let ctx = config.storage_context()?;
        let store = store_from_context(&ctx, &config)?;
        Self::with_store(config, store)
    }

    /// Build an archiver over an existing store client.
    pub fn with_store(config: ArchiveConfig, store: Arc<dyn ObjectStore>) -> ArchiveResult<Self> {
        config.validate()?;
        let ctx = config.storage_context()?;
        let engine = Arc::new(TransferEngine::new(
            store,
            config.retry_config(),
            Spool::new(config.spool.clone()),
        ));
        debug!(context = %ctx, store = engine.store().name(), "archiver ready");
        Ok(Self {
            config,
            ctx,
            engine,
        })
    }

    /// Addressing context.
    pub fn context(&self) -> &StorageContext {
        &self.ctx
    }

    /// Configuration in effect.
    pub fn config(&self) -> &ArchiveConfig {
        &self.config
    }

    /// Shared transfer engine.
    pub fn engine(&self) -> &Arc<TransferEngine> {
        &self.engine
    }

    fn scheduler(&self) -> TransferScheduler {
        TransferScheduler::new(self.config.concurrency)
    }

    fn catalog(&self) -> BackupCatalog {
        BackupCatalog::new(Arc::clone(&self.engine), self.ctx.clone(), self.scheduler())
    }

    /// Continuity checks over this context.
    pub fn continuity(&self) -> ContinuityTracker {
        ContinuityTracker::new(
            Arc::clone(&self.engine),
            self.ctx.clone(),
            self.config.wal_segment_size,
        )
    }

    /// Archive one WAL file. Its name is taken from the file name of `path`.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub async fn wal_push(&self, path: &Path, cancel: &CancellationToken) -> ArchiveResult<ArtifactRef> {
        let name = wal_file_name(path)?;
        let key = self.ctx.wal_key(&name);
        let (artifact, stats) = self.engine.push_file(&key, path, cancel).await?;
        info!(
            name = %name,
            raw_bytes = stats.raw_bytes,
            stored_bytes = stats.compressed_bytes,
            ratio = format!("{:.2}", stats.ratio()),
            "wal file archived"
        );
        Ok(artifact)
    }

    /// Restore one WAL file to `dest`.
    pub async fn wal_fetch(
        &self,
        name: &str,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> ArchiveResult<WalFetchOutcome> {
        let name: WalFileName = name.parse()?;
        self.continuity().wal_fetch(&name, dest, cancel).await
    }

    /// Archive every WAL file marked ready in `<wal_dir>/archive_status`.
    ///
    /// Each `.ready` marker becomes `.done` only after its artifact is
    /// verified. Returns the archived names, or the first failure once
    /// every file has been attempted.
    #[instrument(skip_all, fields(wal_dir = %wal_dir.display()))]
    pub async fn wal_push_ready(
        &self,
        wal_dir: &Path,
        cancel: &CancellationToken,
    ) -> ArchiveResult<Vec<WalFileName>> {
        let status_dir = wal_dir.join("archive_status");
        let mut ready: Vec<String> = Vec::new();
        for entry in std::fs::read_dir(&status_dir)? {
            let entry = entry?;
            if let Some(name) = entry
                .file_name()
                .to_str()
                .and_then(|n| n.strip_suffix(READY_SUFFIX))
            {
                ready.push(name.to_string());
            }
        }
        ready.sort();

        let mut files = Vec::with_capacity(ready.len());
        for name in ready {
            match name.parse::<WalFileName>() {
                Ok(parsed) => files.push((parsed, wal_dir.join(&name))),
                Err(e) => warn!(name = %name, error = %e, "ignoring unrecognized ready file"),
            }
        }
        if files.is_empty() {
            debug!("no wal files ready");
            return Ok(Vec::new());
        }

        let pipeline = WalPushPipeline::new(
            Arc::clone(&self.engine),
            self.ctx.clone(),
            self.config.concurrency,
        );
        let results = pipeline.push_all(files, cancel).await;

        let mut archived = Vec::new();
        let mut first_error = None;
        for result in results {
            match result.outcome {
                Ok(_) => {
                    mark_done(&status_dir, &result.name)?;
                    archived.push(result.name);
                }
                Err(e) => {
                    warn!(name = %result.name, error = %e, "wal file not archived");
                    first_error.get_or_insert(e);
                }
            }
        }
        archived.sort_by_key(|n| n.to_string());
        info!(archived = archived.len(), "ready wal files processed");
        match first_error {
            Some(e) => Err(e),
            None => Ok(archived),
        }
    }

    /// Take a base backup of `data_dir`.
    pub async fn backup_push(
        &self,
        data_dir: &Path,
        control: Arc<dyn BackupControl>,
        cancel: &CancellationToken,
    ) -> ArchiveResult<BackupManifest> {
        BackupCoordinator::new(
            Arc::clone(&self.engine),
            self.ctx.clone(),
            control,
            self.scheduler(),
        )
        .with_excludes(self.config.exclude.clone())
        .with_read_rate_limit(self.config.read_rate_limit)
        .backup_push(data_dir, cancel)
        .await
    }

    /// Restore backup `name` (label or `LATEST`) into `dest`.
    pub async fn backup_fetch(
        &self,
        name: &str,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> ArchiveResult<BackupManifest> {
        self.catalog().backup_fetch(name, dest, cancel).await
    }

    /// Complete backups, newest first.
    pub async fn backup_list(
        &self,
        query: Option<&str>,
        detail: bool,
        cancel: &CancellationToken,
    ) -> ArchiveResult<Vec<BackupInfo>> {
        self.catalog().backup_list(query, detail, cancel).await
    }

    /// Check WAL continuity over `range`, or audit the whole archive.
    pub async fn wal_verify(
        &self,
        range: Option<(SegmentName, SegmentName)>,
        cancel: &CancellationToken,
    ) -> ArchiveResult<WalVerification> {
        let tracker = self.continuity();
        match range {
            Some((start, end)) => Ok(WalVerification::Range {
                start,
                end,
                gap: tracker.find_gap(start, end, cancel).await?,
            }),
            None => Ok(WalVerification::Audit(tracker.audit(cancel).await?)),
        }
    }
}

fn wal_file_name(path: &Path) -> ArchiveResult<WalFileName> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| ArchiveError::InvalidIdentifier {
            kind: "wal file",
            identifier: path.display().to_string(),
        })?;
    file_name.parse()
}

fn mark_done(status_dir: &Path, name: &WalFileName) -> ArchiveResult<()> {
    let ready: PathBuf = status_dir.join(format!("{}{}", name, READY_SUFFIX));
    let done = status_dir.join(format!("{}{}", name, DONE_SUFFIX));
    match std::fs::rename(&ready, &done) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            // The server may have archived and cleaned up the file itself.
            warn!(name = %name, "ready marker vanished before it could be marked done");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
