//! WAL file naming: segment codes, timeline history and backup history files.
//!
//! A segment code is 24 upper-case hex digits: timeline, log id and segment
//! number, 8 digits each. Only the canonical upper-case spelling is accepted
//! so that every name has exactly one textual form.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ArchiveError, ArchiveResult};

/// Default WAL segment size (16 MiB).
pub const DEFAULT_SEGMENT_SIZE: u64 = 16 * 1024 * 1024;

/// Span of WAL addresses covered by one log id.
const LOG_ID_SPAN: u64 = 0x1_0000_0000;

/// Number of segments per log id for a given segment size.
pub fn segments_per_log(segment_size: u64) -> u64 {
    LOG_ID_SPAN / segment_size.max(1)
}

fn parse_hex8(s: &str) -> Option<u32> {
    if s.len() != 8 || !s.bytes().all(|b| b.is_ascii_digit() || (b'A'..=b'F').contains(&b)) {
        return None;
    }
    u32::from_str_radix(s, 16).ok()
}

/// A WAL segment identifier. Ordering is timeline, then log id, then segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SegmentName {
    timeline: u32,
    log: u32,
    seg: u32,
}

impl SegmentName {
    /// Build a segment name; the timeline must be non-zero.
    pub fn new(timeline: u32, log: u32, seg: u32) -> ArchiveResult<Self> {
        if timeline == 0 {
            return Err(ArchiveError::InvalidIdentifier {
                kind: "segment",
                identifier: format!("{:08X}{:08X}{:08X}", timeline, log, seg),
            });
        }
        Ok(Self { timeline, log, seg })
    }

    /// Timeline id.
    pub fn timeline(&self) -> u32 {
        self.timeline
    }

    /// Log id (high half of the WAL address).
    pub fn log(&self) -> u32 {
        self.log
    }

    /// Segment number within the log id.
    pub fn seg(&self) -> u32 {
        self.seg
    }

    /// Position in the timeline-independent segment sequence.
    pub fn sequence_number(&self, segment_size: u64) -> u64 {
        self.log as u64 * segments_per_log(segment_size) + self.seg as u64
    }

    /// Inverse of [`SegmentName::sequence_number`].
    pub fn from_sequence_number(
        timeline: u32,
        number: u64,
        segment_size: u64,
    ) -> ArchiveResult<Self> {
        let per_log = segments_per_log(segment_size);
        let log = u32::try_from(number / per_log).map_err(|_| ArchiveError::InvalidIdentifier {
            kind: "segment",
            identifier: format!("sequence number {}", number),
        })?;
        Self::new(timeline, log, (number % per_log) as u32)
    }

    /// The segment that follows this one on the same timeline.
    pub fn next(&self, segment_size: u64) -> Self {
        let seg = self.seg as u64 + 1;
        if seg >= segments_per_log(segment_size) {
            Self {
                timeline: self.timeline,
                log: self.log.wrapping_add(1),
                seg: 0,
            }
        } else {
            Self {
                timeline: self.timeline,
                log: self.log,
                seg: seg as u32,
            }
        }
    }
}

impl fmt::Display for SegmentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08X}{:08X}{:08X}", self.timeline, self.log, self.seg)
    }
}

impl FromStr for SegmentName {
    type Err = ArchiveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ArchiveError::InvalidIdentifier {
            kind: "segment",
            identifier: s.to_string(),
        };
        if s.len() != 24 || !s.is_ascii() {
            return Err(invalid());
        }
        let timeline = parse_hex8(&s[0..8]).ok_or_else(invalid)?;
        let log = parse_hex8(&s[8..16]).ok_or_else(invalid)?;
        let seg = parse_hex8(&s[16..24]).ok_or_else(invalid)?;
        Self::new(timeline, log, seg).map_err(|_| invalid())
    }
}

impl TryFrom<String> for SegmentName {
    type Error = ArchiveError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SegmentName> for String {
    fn from(value: SegmentName) -> Self {
        value.to_string()
    }
}

/// Any file the database hands to its archive command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WalFileName {
    /// A WAL segment.
    Segment(SegmentName),
    /// `TTTTTTTT.history`, written on timeline switch.
    TimelineHistory(u32),
    /// `<segment>.<offset>.backup`, written at the end of a base backup.
    BackupHistory {
        /// Segment the backup started in.
        segment: SegmentName,
        /// Byte offset of the start position within that segment.
        offset: u32,
    },
}

impl WalFileName {
    /// The segment, if this name is one.
    pub fn as_segment(&self) -> Option<SegmentName> {
        match self {
            WalFileName::Segment(s) => Some(*s),
            _ => None,
        }
    }
}

impl fmt::Display for WalFileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WalFileName::Segment(s) => write!(f, "{}", s),
            WalFileName::TimelineHistory(tli) => write!(f, "{:08X}.history", tli),
            WalFileName::BackupHistory { segment, offset } => {
                write!(f, "{}.{:08X}.backup", segment, offset)
            }
        }
    }
}

impl FromStr for WalFileName {
    type Err = ArchiveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ArchiveError::InvalidIdentifier {
            kind: "wal file",
            identifier: s.to_string(),
        };
        if let Some(tli) = s.strip_suffix(".history") {
            return match parse_hex8(tli) {
                Some(t) if t > 0 => Ok(WalFileName::TimelineHistory(t)),
                _ => Err(invalid()),
            };
        }
        if let Some(rest) = s.strip_suffix(".backup") {
            let (seg, offset) = rest.split_once('.').ok_or_else(invalid)?;
            let segment: SegmentName = seg.parse().map_err(|_| invalid())?;
            let offset = parse_hex8(offset).ok_or_else(invalid)?;
            return Ok(WalFileName::BackupHistory { segment, offset });
        }
        s.parse::<SegmentName>()
            .map(WalFileName::Segment)
            .map_err(|_| invalid())
    }
}

/// A WAL position as returned by start/stop backup: segment plus byte offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WalPosition {
    /// Segment containing the position.
    pub segment: SegmentName,
    /// Byte offset inside the segment.
    pub offset: u32,
}

impl WalPosition {
    /// Build a position.
    pub fn new(segment: SegmentName, offset: u32) -> Self {
        Self { segment, offset }
    }

    /// Canonical backup label for a backup starting here: `base_<segment>_<offset>`.
    pub fn backup_label(&self) -> String {
        format!("base_{}_{:08X}", self.segment, self.offset)
    }

    /// Parse a label produced by [`WalPosition::backup_label`].
    pub fn from_backup_label(label: &str) -> ArchiveResult<Self> {
        let invalid = || ArchiveError::InvalidIdentifier {
            kind: "backup label",
            identifier: label.to_string(),
        };
        let rest = label.strip_prefix("base_").ok_or_else(invalid)?;
        let (seg, offset) = rest.split_once('_').ok_or_else(invalid)?;
        let segment: SegmentName = seg.parse().map_err(|_| invalid())?;
        let offset = parse_hex8(offset).ok_or_else(invalid)?;
        Ok(Self { segment, offset })
    }
}

impl fmt::Display for WalPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{:08X}", self.segment, self.offset)
    }
}
