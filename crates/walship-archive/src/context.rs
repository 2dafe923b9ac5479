//! Addressing context: derives every artifact key from one root identifier.
//!
//! Layout under the context prefix (format version `005`):
//!
//! ```text
//! <prefix>/wal_005/<wal file name>.lz4
//! <prefix>/basebackups_005/<label>/files/<relative path>.lz4
//! <prefix>/basebackups_005/<label>_backup_stop_sentinel.json
//! ```

use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ArchiveError, ArchiveResult};
use crate::segment::{WalFileName, WalPosition};

/// Storage layout version embedded in key prefixes.
pub const LAYOUT_VERSION: &str = "005";

const COMPRESSED_SUFFIX: &str = ".lz4";
const MANIFEST_SUFFIX: &str = "_backup_stop_sentinel.json";

/// Where a context's artifacts live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    /// `s3://bucket/prefix`
    S3 {
        /// Bucket name.
        bucket: String,
    },
    /// `file:///absolute/dir`
    Local {
        /// Root directory.
        root: PathBuf,
    },
    /// `memory://name`, process-local.
    Memory {
        /// Store name.
        name: String,
    },
}

/// Artifact kinds addressable within a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    /// A WAL segment (or history file); identifier is the WAL file name.
    Segment,
    /// One file of a base backup; identifier is `<label>/<relative path>`.
    BackupFile,
    /// A base backup manifest; identifier is the backup label.
    Manifest,
}

impl ArtifactKind {
    fn name(&self) -> &'static str {
        match self {
            ArtifactKind::Segment => "segment",
            ArtifactKind::BackupFile => "backup-file",
            ArtifactKind::Manifest => "manifest",
        }
    }
}

/// A fully resolved object key, relative to the store root.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactKey(String);

impl ArtifactKey {
    /// The key as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Immutable key namespace for one database cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageContext {
    raw: String,
    location: StoreLocation,
    prefix: String,
}

impl StorageContext {
    /// Parse and validate a context identifier.
    pub fn parse(raw: &str) -> ArchiveResult<Self> {
        let invalid = |reason: &str| ArchiveError::InvalidContext {
            context: raw.to_string(),
            reason: reason.to_string(),
        };
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(invalid("context is empty"));
        }
        let (scheme, rest) = trimmed
            .split_once("://")
            .ok_or_else(|| invalid("expected <scheme>://<location>"))?;

        match scheme {
            "s3" => {
                let (bucket, prefix) = rest.split_once('/').unwrap_or((rest, ""));
                if bucket.is_empty() {
                    return Err(invalid("missing bucket name"));
                }
                if !bucket
                    .bytes()
                    .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'.')
                {
                    return Err(invalid("bucket name has invalid characters"));
                }
                Ok(Self {
                    raw: trimmed.to_string(),
                    location: StoreLocation::S3 {
                        bucket: bucket.to_string(),
                    },
                    prefix: normalize_prefix(prefix).map_err(|r| invalid(r))?,
                })
            }
            "file" => {
                let root = PathBuf::from(rest);
                if !root.is_absolute() {
                    return Err(invalid("file context must be an absolute path"));
                }
                if root.components().any(|c| c == Component::ParentDir) {
                    return Err(invalid("file context must not contain '..'"));
                }
                Ok(Self {
                    raw: trimmed.to_string(),
                    location: StoreLocation::Local { root },
                    prefix: String::new(),
                })
            }
            "memory" => {
                let (name, prefix) = rest.split_once('/').unwrap_or((rest, ""));
                if name.is_empty() {
                    return Err(invalid("missing memory store name"));
                }
                Ok(Self {
                    raw: trimmed.to_string(),
                    location: StoreLocation::Memory {
                        name: name.to_string(),
                    },
                    prefix: normalize_prefix(prefix).map_err(|r| invalid(r))?,
                })
            }
            other => Err(invalid(&format!("unsupported scheme {:?}", other))),
        }
    }

    /// The identifier this context was parsed from.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Store location.
    pub fn location(&self) -> &StoreLocation {
        &self.location
    }

    /// Key prefix inside the store (no leading or trailing slash).
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn rooted(&self, tail: &str) -> String {
        if self.prefix.is_empty() {
            tail.to_string()
        } else {
            format!("{}/{}", self.prefix, tail)
        }
    }

    /// Prefix under which all WAL artifacts live (ends in `/`).
    pub fn wal_prefix(&self) -> String {
        self.rooted(&format!("wal_{}/", LAYOUT_VERSION))
    }

    /// Prefix under which all base backup artifacts live (ends in `/`).
    pub fn basebackups_prefix(&self) -> String {
        self.rooted(&format!("basebackups_{}/", LAYOUT_VERSION))
    }

    /// Prefix of one backup's file artifacts (ends in `/`).
    pub fn backup_files_prefix(&self, label: &str) -> ArchiveResult<String> {
        validate_label(label)?;
        Ok(format!("{}{}/files/", self.basebackups_prefix(), label))
    }

    /// Resolve `(kind, identifier)` to a key.
    pub fn resolve_key(&self, kind: ArtifactKind, identifier: &str) -> ArchiveResult<ArtifactKey> {
        let invalid = || ArchiveError::InvalidIdentifier {
            kind: kind.name(),
            identifier: identifier.to_string(),
        };
        match kind {
            ArtifactKind::Segment => {
                let name: WalFileName = identifier.parse().map_err(|_| invalid())?;
                Ok(self.wal_key(&name))
            }
            ArtifactKind::BackupFile => {
                let (label, path) = identifier.split_once('/').ok_or_else(invalid)?;
                self.backup_file_key(label, path).map_err(|_| invalid())
            }
            ArtifactKind::Manifest => self.manifest_key(identifier).map_err(|_| invalid()),
        }
    }

    /// Key of a WAL file artifact.
    pub fn wal_key(&self, name: &WalFileName) -> ArtifactKey {
        ArtifactKey(format!("{}{}{}", self.wal_prefix(), name, COMPRESSED_SUFFIX))
    }

    /// Key of one base backup file artifact.
    pub fn backup_file_key(&self, label: &str, relative_path: &str) -> ArchiveResult<ArtifactKey> {
        validate_relative_path(relative_path)?;
        Ok(ArtifactKey(format!(
            "{}{}{}",
            self.backup_files_prefix(label)?,
            relative_path,
            COMPRESSED_SUFFIX
        )))
    }

    /// Key of a base backup manifest.
    pub fn manifest_key(&self, label: &str) -> ArchiveResult<ArtifactKey> {
        validate_label(label)?;
        Ok(ArtifactKey(format!(
            "{}{}{}",
            self.basebackups_prefix(),
            label,
            MANIFEST_SUFFIX
        )))
    }

    /// Recover `(kind, identifier)` from a key of this context.
    ///
    /// Returns `None` for keys this context does not own.
    pub fn parse_key(&self, key: &str) -> Option<(ArtifactKind, String)> {
        if let Some(rest) = key.strip_prefix(&self.wal_prefix()) {
            let name = rest.strip_suffix(COMPRESSED_SUFFIX)?;
            let parsed: WalFileName = name.parse().ok()?;
            return Some((ArtifactKind::Segment, parsed.to_string()));
        }
        let rest = key.strip_prefix(&self.basebackups_prefix())?;
        if let Some(label) = rest.strip_suffix(MANIFEST_SUFFIX) {
            if !label.contains('/') && validate_label(label).is_ok() {
                return Some((ArtifactKind::Manifest, label.to_string()));
            }
            return None;
        }
        let (label, tail) = rest.split_once('/')?;
        let path = tail.strip_prefix("files/")?.strip_suffix(COMPRESSED_SUFFIX)?;
        validate_label(label).ok()?;
        validate_relative_path(path).ok()?;
        Some((ArtifactKind::BackupFile, format!("{}/{}", label, path)))
    }
}

impl FromStr for StorageContext {
    type Err = ArchiveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for StorageContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

fn normalize_prefix(prefix: &str) -> Result<String, &'static str> {
    let trimmed = prefix.trim_matches('/');
    if trimmed.is_empty() {
        return Ok(String::new());
    }
    for part in trimmed.split('/') {
        if part.is_empty() || part == "." || part == ".." {
            return Err("prefix has empty or relative path components");
        }
    }
    Ok(trimmed.to_string())
}

fn validate_label(label: &str) -> ArchiveResult<()> {
    WalPosition::from_backup_label(label).map(|_| ())
}

/// Check a backup-relative path: non-empty, `/`-separated, no `.`/`..`/empty parts.
pub fn validate_relative_path(path: &str) -> ArchiveResult<()> {
    let invalid = || ArchiveError::InvalidIdentifier {
        kind: "backup-file",
        identifier: path.to_string(),
    };
    if path.is_empty() || path.contains('\0') {
        return Err(invalid());
    }
    for part in path.split('/') {
        if part.is_empty() || part == "." || part == ".." {
            return Err(invalid());
        }
    }
    Ok(())
}

/// Convert a path relative to a data directory into its `/`-separated form.
pub fn relative_path_string(path: &Path) -> ArchiveResult<String> {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(p) => parts.push(p.to_str().ok_or_else(|| {
                ArchiveError::InvalidIdentifier {
                    kind: "backup-file",
                    identifier: path.display().to_string(),
                }
            })?),
            _ => {
                return Err(ArchiveError::InvalidIdentifier {
                    kind: "backup-file",
                    identifier: path.display().to_string(),
                })
            }
        }
    }
    let joined = parts.join("/");
    validate_relative_path(&joined)?;
    Ok(joined)
}
