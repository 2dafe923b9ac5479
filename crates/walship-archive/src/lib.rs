#![warn(missing_docs)]

//! walship: continuous archival of a database's write-ahead log and base
//! backups to an object store, and restoration from it.
//!
//! Every artifact lives under one [`StorageContext`]. A push compresses into
//! a spool, uploads, and verifies what the store reports before it counts as
//! done; a fetch checks integrity before anything is written locally. Base
//! backups are complete only once their manifest is stored.

pub mod archiver;
pub mod backup_control;
pub mod catalog;
pub mod cli;
pub mod codec;
pub mod config;
pub mod context;
pub mod continuity;
pub mod enumerate;
pub mod error;
pub mod lifecycle;
pub mod manifest;
pub mod retry;
pub mod scheduler;
pub mod segment;
pub mod spool;
pub mod store;
pub mod throttle;
pub mod transfer;

pub use archiver::{Archiver, WalVerification};
pub use backup_control::{BackupControl, PsqlBackupControl, ScriptedBackupControl};
pub use catalog::{BackupCatalog, BackupInfo, LATEST};
pub use config::{ArchiveConfig, StoreCredentials};
pub use context::{ArtifactKey, ArtifactKind, StorageContext, StoreLocation};
pub use continuity::{AbsentSegment, ContinuityTracker, Gap, TimelineAudit, WalFetchOutcome};
pub use error::{ArchiveError, ArchiveResult, ErrorKind};
pub use lifecycle::{BackupCoordinator, BackupState};
pub use manifest::{BackupManifest, EntryKind, ManifestEntry};
pub use retry::{RetryConfig, RetryExecutor};
pub use scheduler::{BatchReport, TransferScheduler, WalPushPipeline, WalPushResult};
pub use segment::{SegmentName, WalFileName, WalPosition};
pub use spool::{Spool, SpoolHandle, SpoolMode};
pub use store::{LocalObjectStore, MemoryObjectStore, ObjectStore, S3ObjectStore};
pub use throttle::ReadThrottle;
pub use transfer::{ArtifactRef, TransferEngine};
