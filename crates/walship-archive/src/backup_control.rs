//! Backup-control collaborator: opens and closes the database's backup window.
//!
//! [`PsqlBackupControl`] drives a live server through `psql`; connection
//! parameters come from the usual `PG*` environment variables.
//! [`ScriptedBackupControl`] returns canned positions for tests.

use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{ArchiveError, ArchiveResult};
use crate::segment::{SegmentName, WalPosition};

/// Start and stop a base backup on the database server.
#[async_trait]
pub trait BackupControl: Send + Sync {
    /// Enter backup mode; returns the WAL position the backup starts at.
    async fn start_backup(&self, label: &str) -> ArchiveResult<WalPosition>;

    /// Leave backup mode; returns the WAL position the backup ends at.
    async fn stop_backup(&self) -> ArchiveResult<WalPosition>;

    /// Human-readable server version.
    async fn server_version(&self) -> ArchiveResult<String>;
}

/// Parse `"<24 hex segment>,<decimal offset>"` as printed by the position queries.
pub fn parse_position(op: &'static str, output: &str) -> ArchiveResult<WalPosition> {
    let bad = || ArchiveError::BackupControl {
        op,
        reason: format!("unexpected position output {:?}", output.trim()),
    };
    let line = output.lines().map(str::trim).find(|l| !l.is_empty()).ok_or_else(bad)?;
    let (segment, offset) = line.split_once(',').ok_or_else(bad)?;
    let segment: SegmentName = segment.trim().parse().map_err(|_| bad())?;
    let offset: u32 = offset.trim().parse().map_err(|_| bad())?;
    Ok(WalPosition::new(segment, offset))
}

/// Backup control through the `psql` command-line client.
#[derive(Debug, Clone)]
pub struct PsqlBackupControl {
    psql: PathBuf,
}

impl Default for PsqlBackupControl {
    fn default() -> Self {
        Self {
            psql: PathBuf::from("psql"),
        }
    }
}

impl PsqlBackupControl {
    /// Use a specific `psql` binary.
    pub fn new(psql: PathBuf) -> Self {
        Self { psql }
    }

    async fn query(&self, op: &'static str, sql: &str) -> ArchiveResult<String> {
        debug!(op, sql, "running psql");
        let output = Command::new(&self.psql)
            .args(["-X", "-A", "-t", "-v", "ON_ERROR_STOP=1", "-c", sql])
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ArchiveError::BackupControl {
                op,
                reason: format!("could not run {}: {}", self.psql.display(), e),
            })?;
        if !output.status.success() {
            return Err(ArchiveError::BackupControl {
                op,
                reason: format!(
                    "psql exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn version_num(&self, op: &'static str) -> ArchiveResult<u32> {
        let out = self.query(op, "SHOW server_version_num").await?;
        out.trim().parse().map_err(|_| ArchiveError::BackupControl {
            op,
            reason: format!("unexpected server_version_num {:?}", out.trim()),
        })
    }

    async fn position_function(&self, op: &'static str) -> ArchiveResult<&'static str> {
        match self.version_num(op).await? {
            v if v >= 150_000 => Err(ArchiveError::BackupControl {
                op,
                reason: "server requires session-bound backups (15+), which psql invocations cannot hold"
                    .to_string(),
            }),
            v if v >= 100_000 => Ok("pg_walfile_name_offset"),
            _ => Ok("pg_xlogfile_name_offset"),
        }
    }
}

fn quote_literal(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

#[async_trait]
impl BackupControl for PsqlBackupControl {
    async fn start_backup(&self, label: &str) -> ArchiveResult<WalPosition> {
        let func = self.position_function("start_backup").await?;
        let sql = format!(
            "SELECT file_name || ',' || file_offset FROM {}(pg_start_backup({}))",
            func,
            quote_literal(label)
        );
        let pos = parse_position("start_backup", &self.query("start_backup", &sql).await?)?;
        info!(label, start = %pos, "backup mode entered");
        Ok(pos)
    }

    async fn stop_backup(&self) -> ArchiveResult<WalPosition> {
        let func = self.position_function("stop_backup").await?;
        let sql = format!(
            "SELECT file_name || ',' || file_offset FROM {}(pg_stop_backup())",
            func
        );
        let pos = parse_position("stop_backup", &self.query("stop_backup", &sql).await?)?;
        info!(stop = %pos, "backup mode left");
        Ok(pos)
    }

    async fn server_version(&self) -> ArchiveResult<String> {
        Ok(self
            .query("server_version", "SELECT version()")
            .await?
            .trim()
            .to_string())
    }
}

/// Canned backup control for tests. Records every call.
#[derive(Debug)]
pub struct ScriptedBackupControl {
    start: WalPosition,
    stop: WalPosition,
    version: String,
    fail_start: bool,
    fail_stop: bool,
    calls: Mutex<Vec<String>>,
}

impl ScriptedBackupControl {
    /// Control that reports the given positions.
    pub fn new(start: WalPosition, stop: WalPosition) -> Self {
        Self {
            start,
            stop,
            version: "PostgreSQL 9.6.24 (scripted)".to_string(),
            fail_start: false,
            fail_stop: false,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Make `start_backup` fail.
    pub fn failing_start(mut self) -> Self {
        self.fail_start = true;
        self
    }

    /// Make `stop_backup` fail.
    pub fn failing_stop(mut self) -> Self {
        self.fail_stop = true;
        self
    }

    /// Calls made so far, e.g. `["start_backup", "stop_backup"]`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: &str) {
        self.calls.lock().unwrap().push(call.to_string());
    }
}

#[async_trait]
impl BackupControl for ScriptedBackupControl {
    async fn start_backup(&self, _label: &str) -> ArchiveResult<WalPosition> {
        self.record("start_backup");
        if self.fail_start {
            return Err(ArchiveError::BackupControl {
                op: "start_backup",
                reason: "scripted failure".to_string(),
            });
        }
        Ok(self.start)
    }

    async fn stop_backup(&self) -> ArchiveResult<WalPosition> {
        self.record("stop_backup");
        if self.fail_stop {
            return Err(ArchiveError::BackupControl {
                op: "stop_backup",
                reason: "scripted failure".to_string(),
            });
        }
        Ok(self.stop)
    }

    async fn server_version(&self) -> ArchiveResult<String> {
        Ok(self.version.clone())
    }
}
