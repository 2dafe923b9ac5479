//! Data directory enumeration for base backups.

use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;
use walkdir::WalkDir;

use crate::context::relative_path_string;
use crate::error::{ArchiveError, ArchiveResult};

/// WAL directories: recorded, never descended into.
const WAL_DIRS: &[&str] = &["pg_xlog", "pg_wal"];

/// Top-level files that never belong in a base backup.
const SKIPPED_TOP_LEVEL: &[&str] = &["postmaster.pid", "postmaster.opts", "postgresql.conf"];

/// Kind of a source path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKind {
    /// Regular file with its size at enumeration time.
    File {
        /// Size in bytes.
        size: u64,
    },
    /// Directory.
    Directory,
    /// Symbolic link, not followed.
    Symlink {
        /// Link target.
        target: String,
    },
}

/// One path selected for backup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceEntry {
    /// `/`-separated path relative to the data directory.
    pub relative: String,
    /// Absolute path on disk.
    pub path: PathBuf,
    /// What the path is.
    pub kind: SourceKind,
}

fn is_excluded(relative: &str, excludes: &[String]) -> bool {
    excludes.iter().any(|ex| {
        let ex = ex.trim_matches('/');
        !ex.is_empty()
            && (relative == ex
                || relative
                    .strip_prefix(ex)
                    .map_or(false, |rest| rest.starts_with('/')))
    })
}

/// List everything under `root` that a base backup captures, sorted by path.
///
/// Files that disappear while the walk runs are skipped; the database
/// replays their removal from WAL on restore.
pub fn enumerate_data_dir(root: &Path, excludes: &[String]) -> ArchiveResult<Vec<SourceEntry>> {
    if !root.is_dir() {
        return Err(ArchiveError::Io(io::Error::new(
            io::ErrorKind::NotFound,
            format!("data directory {} does not exist", root.display()),
        )));
    }

    let mut entries = Vec::new();
    let mut walker = WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter();

    while let Some(next) = walker.next() {
        let entry = match next {
            Ok(e) => e,
            Err(e) if e.io_error().map(|io| io.kind()) == Some(io::ErrorKind::NotFound) => {
                debug!(error = %e, "path vanished during enumeration");
                continue;
            }
            Err(e) => return Err(ArchiveError::Io(io::Error::other(e))),
        };
        let rel_path = match entry.path().strip_prefix(root) {
            Ok(p) => p,
            Err(_) => continue,
        };
        let relative = relative_path_string(rel_path)?;
        let file_type = entry.file_type();
        let top_level = entry.depth() == 1;
        let name = entry.file_name().to_str().unwrap_or_default();

        if is_excluded(&relative, excludes) {
            if file_type.is_dir() {
                walker.skip_current_dir();
            }
            continue;
        }

        if file_type.is_dir() {
            entries.push(SourceEntry {
                relative,
                path: entry.path().to_path_buf(),
                kind: SourceKind::Directory,
            });
            if top_level && WAL_DIRS.contains(&name) {
                walker.skip_current_dir();
            }
        } else if file_type.is_symlink() {
            let target = std::fs::read_link(entry.path())?;
            let target = target.to_str().ok_or_else(|| ArchiveError::InvalidIdentifier {
                kind: "symlink target",
                identifier: target.display().to_string(),
            })?;
            entries.push(SourceEntry {
                relative,
                path: entry.path().to_path_buf(),
                kind: SourceKind::Symlink {
                    target: target.to_string(),
                },
            });
        } else if file_type.is_file() {
            if top_level && SKIPPED_TOP_LEVEL.contains(&name) {
                continue;
            }
            let size = match entry.metadata() {
                Ok(m) => m.len(),
                Err(e) if e.io_error().map(|io| io.kind()) == Some(io::ErrorKind::NotFound) => {
                    continue
                }
                Err(e) => return Err(ArchiveError::Io(io::Error::other(e))),
            };
            entries.push(SourceEntry {
                relative,
                path: entry.path().to_path_buf(),
                kind: SourceKind::File { size },
            });
        }
    }

    entries.sort_by(|a, b| a.relative.cmp(&b.relative));
    debug!(root = %root.display(), count = entries.len(), "data directory enumerated");
    Ok(entries)
}
