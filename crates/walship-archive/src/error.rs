//! Error types for the archive engine.

use thiserror::Error;

/// Result type alias for archive operations.
pub type ArchiveResult<T> = Result<T, ArchiveError>;

/// Coarse failure classes the archiving protocol branches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Retryable network or service failure.
    Transient,
    /// Failure that retrying will not fix.
    Permanent,
    /// The requested artifact does not exist.
    NotFound,
    /// The artifact exists but failed integrity or decompression checks.
    CorruptArtifact,
}

/// Error variants for archive operations.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// Retryable store failure (timeout, connection reset, 5xx, throttling).
    #[error("transient failure during {op}: {reason}")]
    Transient {
        /// The operation that failed.
        op: String,
        /// Description of the failure.
        reason: String,
    },

    /// Non-retryable store failure.
    #[error("permanent failure during {op}: {reason}")]
    Permanent {
        /// The operation that failed.
        op: String,
        /// Description of the failure.
        reason: String,
    },

    /// Every allowed attempt failed with a transient error.
    #[error("retries exhausted for {op} after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        /// The operation that was retried.
        op: String,
        /// Number of attempts made.
        attempts: u32,
        /// Message of the final transient failure.
        last_error: String,
    },

    /// The store reported a different size or checksum than was uploaded.
    #[error("verification failed for {key}: {reason}")]
    VerificationFailed {
        /// The artifact key.
        key: String,
        /// What did not match.
        reason: String,
    },

    /// Fetch target absent.
    #[error("artifact not found: {key}")]
    NotFound {
        /// The missing key.
        key: String,
    },

    /// Stored payload failed checksum or decompression.
    #[error("corrupt artifact {key}: {reason}")]
    CorruptArtifact {
        /// The artifact key.
        key: String,
        /// Description of the corruption.
        reason: String,
    },

    /// Identifier does not match the syntax of its artifact kind.
    #[error("invalid {kind} identifier: {identifier:?}")]
    InvalidIdentifier {
        /// Artifact kind the identifier was given for.
        kind: &'static str,
        /// The rejected identifier.
        identifier: String,
    },

    /// Context string is empty or malformed.
    #[error("invalid context {context:?}: {reason}")]
    InvalidContext {
        /// The rejected context.
        context: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Configuration value out of range or unreadable.
    #[error("configuration error: {0}")]
    Config(String),

    /// The backup-control collaborator failed.
    #[error("backup control failed during {op}: {reason}")]
    BackupControl {
        /// `start_backup` or `stop_backup`.
        op: &'static str,
        /// Description of the failure.
        reason: String,
    },

    /// The backup or restore could not be carried out.
    #[error("backup {label}: {reason}")]
    Backup {
        /// Backup label, or the query used to find one.
        label: String,
        /// Description of the failure.
        reason: String,
    },

    /// Operation was cancelled by the caller.
    #[error("operation cancelled")]
    Cancelled,

    /// Local I/O error (source files, spool, restore target).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Manifest (de)serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ArchiveError {
    /// Build a transient error for `op`.
    pub fn transient(op: impl Into<String>, reason: impl ToString) -> Self {
        ArchiveError::Transient {
            op: op.into(),
            reason: reason.to_string(),
        }
    }

    /// Build a permanent error for `op`.
    pub fn permanent(op: impl Into<String>, reason: impl ToString) -> Self {
        ArchiveError::Permanent {
            op: op.into(),
            reason: reason.to_string(),
        }
    }

    /// Collapse this error onto the four protocol-visible classes.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ArchiveError::Transient { .. } => ErrorKind::Transient,
            ArchiveError::NotFound { .. } => ErrorKind::NotFound,
            ArchiveError::CorruptArtifact { .. } => ErrorKind::CorruptArtifact,
            ArchiveError::Permanent { .. }
            | ArchiveError::RetriesExhausted { .. }
            | ArchiveError::VerificationFailed { .. }
            | ArchiveError::InvalidIdentifier { .. }
            | ArchiveError::InvalidContext { .. }
            | ArchiveError::Config(_)
            | ArchiveError::BackupControl { .. }
            | ArchiveError::Backup { .. }
            | ArchiveError::Cancelled
            | ArchiveError::Io(_)
            | ArchiveError::Serialization(_) => ErrorKind::Permanent,
        }
    }

    /// Whether the retry loop may try again.
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Process exit status for this error. Never zero.
    pub fn exit_code(&self) -> i32 {
        if matches!(self, ArchiveError::Cancelled) {
            return 130;
        }
        match self.kind() {
            ErrorKind::NotFound => 1,
            ErrorKind::Transient | ErrorKind::Permanent => 2,
            ErrorKind::CorruptArtifact => 3,
        }
    }
}
