//! Bounded parallel execution of transfer tasks.
//!
//! [`TransferScheduler`] runs a batch with at most N tasks in flight. Once a
//! task fails, tasks already running are allowed to finish and tasks not
//! yet started are skipped. [`WalPushPipeline`] overlaps compression of the
//! next segment with the upload of the previous ones.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::codec::CodecStats;
use crate::context::StorageContext;
use crate::error::{ArchiveError, ArchiveResult};
use crate::segment::WalFileName;
use crate::spool::SpoolHandle;
use crate::transfer::{ArtifactRef, TransferEngine};

/// Outcome of one batch.
#[derive(Debug)]
pub struct BatchReport<T> {
    /// Results of tasks that succeeded, in submission order.
    pub completed: Vec<T>,
    /// Tasks that ran and failed.
    pub failed: usize,
    /// Tasks never started because of an earlier failure or cancellation.
    pub skipped: usize,
    /// First failure observed, if any.
    pub first_error: Option<ArchiveError>,
}

impl<T> BatchReport<T> {
    /// Whether every task succeeded.
    pub fn is_success(&self) -> bool {
        self.first_error.is_none() && self.failed == 0 && self.skipped == 0
    }

    /// All results, or the first error.
    pub fn into_result(self) -> ArchiveResult<Vec<T>> {
        match self.first_error {
            Some(e) => Err(e),
            None if self.skipped > 0 => Err(ArchiveError::Cancelled),
            None => Ok(self.completed),
        }
    }
}

/// Runs independent tasks with a fixed concurrency limit.
#[derive(Debug, Clone)]
pub struct TransferScheduler {
    concurrency: usize,
}

impl TransferScheduler {
    /// Scheduler allowing `concurrency` tasks in flight (at least one).
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
        }
    }

    /// Concurrency limit.
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Run `tasks`, starting them in order.
    ///
    /// `cancel` stops new tasks from starting; tasks are expected to observe
    /// the same token themselves for prompt interruption.
    pub async fn run<T, F, Fut>(&self, tasks: Vec<F>, cancel: &CancellationToken) -> BatchReport<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ArchiveResult<T>> + Send + 'static,
    {
        let total = tasks.len();
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let abort = cancel.child_token();
        let mut set = JoinSet::new();
        let mut started = 0usize;

        for (idx, task) in tasks.into_iter().enumerate() {
            let permit = tokio::select! {
                biased;
                _ = abort.cancelled() => break,
                p = Arc::clone(&semaphore).acquire_owned() => match p {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };
            let abort = abort.clone();
            started += 1;
            set.spawn(async move {
                let result = task().await;
                if result.is_err() {
                    abort.cancel();
                }
                drop(permit);
                (idx, result)
            });
        }

        let mut slots: Vec<Option<T>> = (0..total).map(|_| None).collect();
        let mut failed = 0usize;
        let mut first_error = None;
        while let Some(joined) = set.join_next().await {
            let (idx, result) = match joined {
                Ok(r) => r,
                Err(e) => {
                    failed += 1;
                    abort.cancel();
                    first_error.get_or_insert(ArchiveError::permanent("transfer task", e));
                    continue;
                }
            };
            match result {
                Ok(value) => slots[idx] = Some(value),
                Err(e) => {
                    failed += 1;
                    debug!(task = idx, error = %e, "task failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        let skipped = total - started;
        if skipped > 0 {
            warn!(skipped, failed, "batch stopped early");
        }
        if first_error.is_none() && cancel.is_cancelled() && skipped > 0 {
            first_error = Some(ArchiveError::Cancelled);
        }
        BatchReport {
            completed: slots.into_iter().flatten().collect(),
            failed,
            skipped,
            first_error,
        }
    }
}

/// Per-file outcome of a pipelined WAL push.
#[derive(Debug)]
pub struct WalPushResult {
    /// The WAL file.
    pub name: WalFileName,
    /// Stored artifact and compression stats, or the failure.
    pub outcome: ArchiveResult<(ArtifactRef, CodecStats)>,
}

/// Compresses WAL files on the blocking pool and uploads them concurrently.
///
/// Compression of file k+1 proceeds while file k is being uploaded; a
/// bounded channel keeps at most `concurrency` staged files waiting.
pub struct WalPushPipeline {
    engine: Arc<TransferEngine>,
    ctx: StorageContext,
    concurrency: usize,
}

impl WalPushPipeline {
    /// Create a pipeline.
    pub fn new(engine: Arc<TransferEngine>, ctx: StorageContext, concurrency: usize) -> Self {
        Self {
            engine,
            ctx,
            concurrency: concurrency.max(1),
        }
    }

    /// Push every `(name, path)`. Results come back in completion order;
    /// every input yields exactly one result.
    pub async fn push_all(
        &self,
        files: Vec<(WalFileName, PathBuf)>,
        cancel: &CancellationToken,
    ) -> Vec<WalPushResult> {
        let (tx, mut rx) =
            mpsc::channel::<(WalFileName, ArchiveResult<(SpoolHandle, CodecStats)>)>(self.concurrency);

        let producer = {
            let engine = Arc::clone(&self.engine);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                for (name, path) in files {
                    let staged = if cancel.is_cancelled() {
                        Err(ArchiveError::Cancelled)
                    } else {
                        engine.stage_file(&path).await
                    };
                    if tx.send((name, staged)).await.is_err() {
                        break;
                    }
                }
            })
        };

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut uploads = JoinSet::new();
        let mut results = Vec::new();

        while let Some((name, staged)) = rx.recv().await {
            let (handle, stats) = match staged {
                Ok(s) => s,
                Err(e) => {
                    results.push(WalPushResult {
                        name,
                        outcome: Err(e),
                    });
                    continue;
                }
            };
            let permit = match Arc::clone(&semaphore).acquire_owned().await {
                Ok(p) => p,
                Err(_) => break,
            };
            let engine = Arc::clone(&self.engine);
            let key = self.ctx.wal_key(&name);
            let cancel = cancel.clone();
            uploads.spawn(async move {
                let outcome = engine
                    .push(&key, &handle, &cancel)
                    .await
                    .map(|artifact| (artifact, stats));
                drop(handle);
                drop(permit);
                WalPushResult { name, outcome }
            });
            while let Some(done) = uploads.try_join_next() {
                match done {
                    Ok(r) => results.push(r),
                    Err(e) => warn!(error = %e, "wal upload task failed"),
                }
            }
        }

        if let Err(e) = producer.await {
            warn!(error = %e, "wal staging task failed");
        }
        while let Some(done) = uploads.join_next().await {
            match done {
                Ok(r) => results.push(r),
                Err(e) => warn!(error = %e, "wal upload task failed"),
            }
        }
        results
    }
}
