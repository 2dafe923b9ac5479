//! `walship` command line.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::archiver::{Archiver, WalVerification};
use crate::backup_control::PsqlBackupControl;
use crate::catalog::LATEST;
use crate::config::ArchiveConfig;
use crate::context::StoreLocation;
use crate::continuity::WalFetchOutcome;
use crate::segment::SegmentName;

/// Exit status when there is nothing to fetch, or a gap was found.
pub const EXIT_ABSENT: i32 = 1;

/// Archive WAL and base backups to object storage.
#[derive(Debug, Parser)]
#[command(name = "walship", version)]
#[command(about = "WAL and base backup archival to object storage", long_about = None)]
pub struct Cli {
    /// Configuration file (.toml or .json).
    #[arg(short, long, env = "WALSHIP_CONFIG")]
    pub config: Option<PathBuf>,

    /// Context identifier, e.g. s3://bucket/cluster-a.
    #[arg(long, env = "WALSHIP_CONTEXT")]
    pub context: Option<String>,

    /// S3 access key id.
    #[arg(long, env = "AWS_ACCESS_KEY_ID", hide_env_values = true)]
    pub aws_access_key_id: Option<String>,

    /// S3 secret access key.
    #[arg(long, env = "AWS_SECRET_ACCESS_KEY", hide_env_values = true)]
    pub aws_secret_access_key: Option<String>,

    /// S3 region.
    #[arg(long, env = "AWS_REGION")]
    pub region: Option<String>,

    /// Custom S3 endpoint URL.
    #[arg(long, env = "WALSHIP_S3_ENDPOINT")]
    pub s3_endpoint: Option<String>,

    /// Transfers in flight at once.
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Attempts per store call, first try included.
    #[arg(long)]
    pub retry_limit: Option<u32>,

    /// Emit logs as JSON.
    #[arg(long)]
    pub log_json: bool,

    /// Operation to run.
    #[command(subcommand)]
    pub command: Command,
}

/// Archive operations.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Archive one WAL file (for archive_command).
    WalPush {
        /// Path of the WAL file, e.g. pg_xlog/000000010000000000000001.
        wal_path: PathBuf,
    },
    /// Restore one WAL file (for restore_command).
    WalFetch {
        /// WAL file name.
        wal_name: String,
        /// Destination path.
        dest: PathBuf,
    },
    /// Archive every WAL file the server has marked ready.
    WalPushReady {
        /// WAL directory containing archive_status/.
        wal_dir: PathBuf,
    },
    /// Take a base backup of a running cluster.
    BackupPush {
        /// Data directory.
        data_dir: PathBuf,
        /// psql binary used to open and close the backup window.
        #[arg(long, default_value = "psql")]
        psql: PathBuf,
        /// Cap on reading the data directory, in bytes per second.
        #[arg(long, value_name = "BYTES_PER_SECOND")]
        cluster_read_rate_limit: Option<u64>,
    },
    /// Restore a base backup into an empty directory.
    BackupFetch {
        /// Destination directory.
        dest: PathBuf,
        /// Backup label, or LATEST.
        #[arg(default_value = LATEST)]
        backup_name: String,
    },
    /// List complete base backups, newest first.
    BackupList {
        /// Only labels containing this text.
        query: Option<String>,
        /// Load each manifest for stop position and sizes.
        #[arg(long)]
        detail: bool,
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },
    /// Check the archive for missing WAL segments.
    WalVerify {
        /// First segment of the range to check.
        #[arg(requires = "end")]
        start: Option<String>,
        /// Last segment of the range to check.
        end: Option<String>,
    },
}

impl Cli {
    /// Configuration from file, then environment, then flags.
    pub fn load_config(&self) -> Result<ArchiveConfig> {
        let mut config = match &self.config {
            Some(path) => ArchiveConfig::from_file(path)
                .with_context(|| format!("loading config {}", path.display()))?,
            None => ArchiveConfig::default(),
        };
        if let Some(context) = &self.context {
            config.context = context.clone();
        }
        if let Some(id) = &self.aws_access_key_id {
            config.credentials.access_key_id = id.clone();
        }
        if let Some(secret) = &self.aws_secret_access_key {
            config.credentials.secret_access_key = secret.clone();
        }
        if let Some(region) = &self.region {
            config.region = region.clone();
        }
        if let Some(endpoint) = &self.s3_endpoint {
            config.endpoint = Some(endpoint.clone());
        }
        if let Some(n) = self.concurrency {
            config.concurrency = n;
        }
        if let Some(n) = self.retry_limit {
            config.retry_limit = n;
        }
        if let Command::BackupPush {
            cluster_read_rate_limit: Some(limit),
            ..
        } = &self.command
        {
            config.read_rate_limit = Some(*limit);
        }
        config.validate()?;
        Ok(config)
    }

    /// Run the command. Returns the exit status for outcomes that are not
    /// errors (0, or [`EXIT_ABSENT`]).
    pub async fn run(self, cancel: &CancellationToken) -> Result<i32> {
        let config = self.load_config()?;
        if matches!(
            config.storage_context()?.location(),
            StoreLocation::Memory { .. }
        ) {
            warn!("memory:// contexts do not outlive this process");
        }
        let archiver = Archiver::from_config(config)?;

        match self.command {
            Command::WalPush { wal_path } => {
                archiver.wal_push(&wal_path, cancel).await?;
                Ok(0)
            }
            Command::WalFetch { wal_name, dest } => {
                match archiver.wal_fetch(&wal_name, &dest, cancel).await? {
                    WalFetchOutcome::Restored { .. } => Ok(0),
                    WalFetchOutcome::NotArchived | WalFetchOutcome::Hole { .. } => Ok(EXIT_ABSENT),
                }
            }
            Command::WalPushReady { wal_dir } => {
                let archived = archiver.wal_push_ready(&wal_dir, cancel).await?;
                for name in archived {
                    println!("{}", name);
                }
                Ok(0)
            }
            Command::BackupPush { data_dir, psql, .. } => {
                let control = Arc::new(PsqlBackupControl::new(psql));
                let manifest = archiver.backup_push(&data_dir, control, cancel).await?;
                println!("{}", manifest.label);
                Ok(0)
            }
            Command::BackupFetch { dest, backup_name } => {
                let manifest = archiver.backup_fetch(&backup_name, &dest, cancel).await?;
                println!("{}", manifest.label);
                Ok(0)
            }
            Command::BackupList {
                query,
                detail,
                json,
            } => {
                let backups = archiver
                    .backup_list(query.as_deref(), detail, cancel)
                    .await?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&backups)?);
                    return Ok(0);
                }
                println!("{:<40} {:<34} {:<34} {:>14}", "name", "start", "stop", "expanded_bytes");
                for b in backups {
                    println!(
                        "{:<40} {:<34} {:<34} {:>14}",
                        b.label,
                        b.start.to_string(),
                        b.stop.map(|s| s.to_string()).unwrap_or_default(),
                        b.expanded_size_bytes.map(|s| s.to_string()).unwrap_or_default(),
                    );
                }
                Ok(0)
            }
            Command::WalVerify { start, end } => {
                let range = match (start, end) {
                    (Some(s), Some(e)) => Some((s.parse::<SegmentName>()?, e.parse::<SegmentName>()?)),
                    _ => None,
                };
                let verification = archiver.wal_verify(range, cancel).await?;
                print_verification(&verification);
                Ok(if verification.is_continuous() { 0 } else { EXIT_ABSENT })
            }
        }
    }
}

fn print_verification(verification: &WalVerification) {
    match verification {
        WalVerification::Range { start, end, gap } => match gap {
            None => println!("{}..{}: continuous", start, end),
            Some(g) => println!(
                "{}..{}: missing {} (last contiguous: {})",
                start,
                end,
                g.expected_next,
                g.last_contiguous
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "none".to_string())
            ),
        },
        WalVerification::Audit(timelines) => {
            if timelines.is_empty() {
                println!("no segments archived");
            }
            for t in timelines {
                println!(
                    "timeline {}: {} segments, {} .. {}, {} gap(s)",
                    t.timeline,
                    t.count,
                    t.first,
                    t.last,
                    t.gaps.len()
                );
                for g in &t.gaps {
                    println!("  missing from {}", g.expected_next);
                }
            }
        }
    }
}
