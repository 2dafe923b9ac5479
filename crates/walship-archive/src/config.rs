//! Archive configuration.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::context::StorageContext;
use crate::error::{ArchiveError, ArchiveResult};
use crate::retry::RetryConfig;
use crate::segment::DEFAULT_SEGMENT_SIZE;
use crate::spool::SpoolMode;
use crate::throttle::MIN_READ_RATE;

/// Object store credentials.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreCredentials {
    /// Access key id.
    pub access_key_id: String,
    /// Secret access key.
    pub secret_access_key: String,
}

impl fmt::Debug for StoreCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .finish()
    }
}

/// Everything an archive operation needs besides its arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Context identifier, e.g. `s3://bucket/cluster-a`.
    pub context: String,
    /// Store credentials (S3 only).
    pub credentials: StoreCredentials,
    /// S3 region.
    pub region: String,
    /// Custom S3 endpoint, for S3-compatible stores.
    pub endpoint: Option<String>,
    /// Transfers in flight at once.
    pub concurrency: usize,
    /// Total attempts per store call, first try included.
    pub retry_limit: u32,
    /// First backoff delay in milliseconds.
    pub backoff_base_ms: u64,
    /// Backoff ceiling in milliseconds.
    pub backoff_max_ms: u64,
    /// Timeout for one store call attempt, in seconds.
    pub attempt_timeout_secs: u64,
    /// Overall bound on one artifact push or fetch, retries and
    /// verification included, in seconds.
    pub deadline_secs: Option<u64>,
    /// Where compressed payloads are staged.
    pub spool: SpoolMode,
    /// WAL segment size of the cluster.
    pub wal_segment_size: u64,
    /// Data directory paths left out of base backups.
    pub exclude: Vec<String>,
    /// Combined read rate limit for base backups, in bytes per second.
    pub read_rate_limit: Option<u64>,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            context: String::new(),
            credentials: StoreCredentials::default(),
            region: String::from("us-east-1"),
            endpoint: None,
            concurrency: 4,
            retry_limit: 3,
            backoff_base_ms: 100,
            backoff_max_ms: 10_000,
            attempt_timeout_secs: 60,
            deadline_secs: None,
            spool: SpoolMode::default(),
            wal_segment_size: DEFAULT_SEGMENT_SIZE,
            exclude: Vec::new(),
            read_rate_limit: None,
        }
    }
}

impl ArchiveConfig {
    /// Load from a `.toml` or `.json` file. Missing fields take defaults.
    pub fn from_file(path: &Path) -> ArchiveResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)
                .map_err(|e| ArchiveError::Config(format!("{}: {}", path.display(), e))),
            "json" => serde_json::from_str(&contents)
                .map_err(|e| ArchiveError::Config(format!("{}: {}", path.display(), e))),
            _ => Err(ArchiveError::Config(format!(
                "unsupported config file extension: {:?}",
                ext
            ))),
        }
    }

    /// Per-attempt timeout.
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    /// Retry policy for store calls.
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.retry_limit,
            initial_backoff: Duration::from_millis(self.backoff_base_ms),
            max_backoff: Duration::from_millis(self.backoff_max_ms.max(self.backoff_base_ms)),
            attempt_timeout: self.attempt_timeout(),
            deadline: self.deadline_secs.map(Duration::from_secs),
            ..RetryConfig::default()
        }
    }

    /// Parsed context.
    pub fn storage_context(&self) -> ArchiveResult<StorageContext> {
        StorageContext::parse(&self.context)
    }

    /// Reject settings no operation can run with.
    pub fn validate(&self) -> ArchiveResult<()> {
        self.storage_context()?;
        if self.concurrency == 0 {
            return Err(ArchiveError::Config("concurrency must be at least 1".into()));
        }
        if self.retry_limit == 0 {
            return Err(ArchiveError::Config("retry_limit must be at least 1".into()));
        }
        if self.attempt_timeout_secs == 0 {
            return Err(ArchiveError::Config(
                "attempt_timeout_secs must be at least 1".into(),
            ));
        }
        if !self.wal_segment_size.is_power_of_two() || self.wal_segment_size < 1024 * 1024 {
            return Err(ArchiveError::Config(format!(
                "wal_segment_size {} is not a power of two of at least 1 MiB",
                self.wal_segment_size
            )));
        }
        if let Some(limit) = self.read_rate_limit {
            if limit < MIN_READ_RATE {
                return Err(ArchiveError::Config(format!(
                    "read_rate_limit {} is below the minimum of {} bytes per second",
                    limit, MIN_READ_RATE
                )));
            }
        }
        Ok(())
    }
}
