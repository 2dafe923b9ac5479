//! WAL continuity: segment fetch for recovery and gap detection.
//!
//! Recovery replays segments in order and stops at the first one it cannot
//! get, so a hole in the archive silently truncates every restore that
//! crosses it. These checks find such holes before a restore depends on them.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::context::{ArtifactKind, StorageContext};
use crate::error::{ArchiveError, ArchiveResult};
use crate::segment::{SegmentName, WalFileName};
use crate::transfer::TransferEngine;

/// Result of fetching one WAL file for recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalFetchOutcome {
    /// Written to the destination.
    Restored {
        /// Decompressed size.
        bytes: u64,
    },
    /// No artifact exists for the name; recovery should stop, not retry.
    NotArchived,
    /// The segment is missing although later segments of its timeline are
    /// archived. Recovery stops here and everything after the hole is lost.
    Hole {
        /// Next archived segment on the same timeline.
        next_available: SegmentName,
    },
}

impl WalFetchOutcome {
    /// Whether the destination was written.
    pub fn is_restored(&self) -> bool {
        matches!(self, WalFetchOutcome::Restored { .. })
    }
}

/// A hole in the segment sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gap {
    /// Last segment present before the hole, if any.
    pub last_contiguous: Option<SegmentName>,
    /// First missing segment.
    pub expected_next: SegmentName,
}

/// Archive summary for one timeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineAudit {
    /// Timeline id.
    pub timeline: u32,
    /// Lowest archived segment.
    pub first: SegmentName,
    /// Highest archived segment.
    pub last: SegmentName,
    /// Number of archived segments.
    pub count: usize,
    /// Holes between `first` and `last`, in order.
    pub gaps: Vec<Gap>,
}

/// What an absent segment means for recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbsentSegment {
    /// The segment is archived after all.
    Archived,
    /// Nothing later exists on its timeline; it may still arrive.
    NotYetArchived,
    /// Later segments exist, so this one will never arrive.
    Lost {
        /// First archived segment after the hole.
        next_available: SegmentName,
    },
}

/// First gap in `available` over `[start, end]`, walking with `segment_size`.
pub fn first_gap(
    available: &BTreeSet<SegmentName>,
    start: SegmentName,
    end: SegmentName,
    segment_size: u64,
) -> Option<Gap> {
    let mut last = None;
    let mut current = start;
    loop {
        if !available.contains(&current) {
            return Some(Gap {
                last_contiguous: last,
                expected_next: current,
            });
        }
        if current >= end {
            return None;
        }
        last = Some(current);
        current = current.next(segment_size);
    }
}

/// Per-timeline summary of an archived segment set.
pub fn audit_segments(available: &BTreeSet<SegmentName>, segment_size: u64) -> Vec<TimelineAudit> {
    let mut audits: Vec<TimelineAudit> = Vec::new();
    let mut previous: Option<SegmentName> = None;
    for &segment in available {
        match audits.last_mut() {
            Some(audit) if audit.timeline == segment.timeline() => {
                if let Some(prev) = previous {
                    let expected = prev.next(segment_size);
                    if expected != segment {
                        audit.gaps.push(Gap {
                            last_contiguous: Some(prev),
                            expected_next: expected,
                        });
                    }
                }
                audit.last = segment;
                audit.count += 1;
            }
            _ => audits.push(TimelineAudit {
                timeline: segment.timeline(),
                first: segment,
                last: segment,
                count: 1,
                gaps: Vec::new(),
            }),
        }
        previous = Some(segment);
    }
    audits
}

/// Answers "is the WAL needed for recovery actually there?".
pub struct ContinuityTracker {
    engine: Arc<TransferEngine>,
    ctx: StorageContext,
    segment_size: u64,
}

impl ContinuityTracker {
    /// Tracker over one context.
    pub fn new(engine: Arc<TransferEngine>, ctx: StorageContext, segment_size: u64) -> Self {
        Self {
            engine,
            ctx,
            segment_size,
        }
    }

    /// Fetch one WAL file into `dest`. A missing segment is classified:
    /// [`WalFetchOutcome::Hole`] when later segments of its timeline are
    /// archived, [`WalFetchOutcome::NotArchived`] otherwise.
    #[instrument(skip_all, fields(name = %name))]
    pub async fn wal_fetch(
        &self,
        name: &WalFileName,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> ArchiveResult<WalFetchOutcome> {
        let key = self.ctx.wal_key(name);
        match self.engine.fetch_to_path(&key, dest, cancel).await {
            Ok(bytes) => {
                info!(name = %name, bytes, "wal file restored");
                Ok(WalFetchOutcome::Restored { bytes })
            }
            Err(ArchiveError::NotFound { .. }) => match name.as_segment() {
                Some(segment) => self.explain_missing(segment, cancel).await,
                None => {
                    info!(name = %name, "wal file not archived");
                    Ok(WalFetchOutcome::NotArchived)
                }
            },
            Err(e) => Err(e),
        }
    }

    async fn explain_missing(
        &self,
        segment: SegmentName,
        cancel: &CancellationToken,
    ) -> ArchiveResult<WalFetchOutcome> {
        match self.classify_absent(segment, cancel).await {
            Ok(AbsentSegment::Lost { next_available }) => {
                error!(
                    segment = %segment,
                    next_available = %next_available,
                    "wal segment missing from the archive while later segments exist"
                );
                Ok(WalFetchOutcome::Hole { next_available })
            }
            Ok(_) => {
                info!(segment = %segment, "wal segment not archived");
                Ok(WalFetchOutcome::NotArchived)
            }
            Err(ArchiveError::Cancelled) => Err(ArchiveError::Cancelled),
            Err(e) => {
                warn!(segment = %segment, error = %e, "could not classify missing segment");
                Ok(WalFetchOutcome::NotArchived)
            }
        }
    }

    /// Every archived segment of the context, in segment order.
    pub async fn archived_segments(
        &self,
        cancel: &CancellationToken,
    ) -> ArchiveResult<BTreeSet<SegmentName>> {
        let objects = self.engine.list(&self.ctx.wal_prefix(), cancel).await?;
        Ok(objects
            .iter()
            .filter_map(|o| match self.ctx.parse_key(&o.key) {
                Some((ArtifactKind::Segment, name)) => name
                    .parse::<WalFileName>()
                    .ok()
                    .and_then(|n| n.as_segment()),
                _ => None,
            })
            .collect())
    }

    /// First gap in `[start, end]`, or `None` if every segment is archived.
    /// Both ends must be on the same timeline.
    pub async fn find_gap(
        &self,
        start: SegmentName,
        end: SegmentName,
        cancel: &CancellationToken,
    ) -> ArchiveResult<Option<Gap>> {
        if start.timeline() != end.timeline() || end < start {
            return Err(ArchiveError::InvalidIdentifier {
                kind: "segment range",
                identifier: format!("{}..{}", start, end),
            });
        }
        let available = self.archived_segments(cancel).await?;
        let gap = first_gap(&available, start, end, self.segment_size);
        if let Some(g) = &gap {
            warn!(
                last_contiguous = ?g.last_contiguous.map(|s| s.to_string()),
                expected_next = %g.expected_next,
                "wal gap found"
            );
        }
        Ok(gap)
    }

    /// Whole-archive audit, one entry per timeline.
    pub async fn audit(&self, cancel: &CancellationToken) -> ArchiveResult<Vec<TimelineAudit>> {
        let available = self.archived_segments(cancel).await?;
        Ok(audit_segments(&available, self.segment_size))
    }

    /// Classify a segment recovery could not fetch.
    pub async fn classify_absent(
        &self,
        segment: SegmentName,
        cancel: &CancellationToken,
    ) -> ArchiveResult<AbsentSegment> {
        let available = self.archived_segments(cancel).await?;
        if available.contains(&segment) {
            return Ok(AbsentSegment::Archived);
        }
        Ok(available
            .range(segment..)
            .find(|s| s.timeline() == segment.timeline())
            .map_or(AbsentSegment::NotYetArchived, |&next| AbsentSegment::Lost {
                next_available: next,
            }))
    }
}
