//! LZ4 frame compression for artifact payloads.
//!
//! Frames are written with a content checksum so that any bit flip or
//! truncation inside the frame is caught on decompression.

use std::io::{self, Read, Write};

use lz4_flex::frame::{BlockSize, FrameDecoder, FrameEncoder, FrameInfo};
use tracing::debug;

use crate::error::{ArchiveError, ArchiveResult};

const COPY_BUF: usize = 64 * 1024;

/// Byte counts from one compression pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CodecStats {
    /// Uncompressed bytes read.
    pub raw_bytes: u64,
    /// Compressed bytes written.
    pub compressed_bytes: u64,
}

impl CodecStats {
    /// raw / compressed, or 1.0 for empty output.
    pub fn ratio(&self) -> f64 {
        if self.compressed_bytes == 0 {
            1.0
        } else {
            self.raw_bytes as f64 / self.compressed_bytes as f64
        }
    }
}

fn frame_info() -> FrameInfo {
    FrameInfo::new()
        .block_size(BlockSize::Max4MB)
        .content_checksum(true)
}

struct CountingWriter<W> {
    inner: W,
    count: u64,
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

struct CountingReader<R> {
    inner: R,
    count: u64,
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count += n as u64;
        Ok(n)
    }
}

/// Compress everything from `input` into `output` as one LZ4 frame.
pub fn compress<R: Read, W: Write>(mut input: R, output: W) -> ArchiveResult<CodecStats> {
    let counter = CountingWriter {
        inner: output,
        count: 0,
    };
    let mut encoder = FrameEncoder::with_frame_info(frame_info(), counter);
    let raw_bytes = io::copy(&mut input, &mut encoder)?;
    let mut counter = encoder
        .finish()
        .map_err(|e| ArchiveError::permanent("compress", e))?;
    counter.flush()?;
    let stats = CodecStats {
        raw_bytes,
        compressed_bytes: counter.count,
    };
    debug!(
        raw = stats.raw_bytes,
        compressed = stats.compressed_bytes,
        "payload compressed"
    );
    Ok(stats)
}

/// Decompress one LZ4 frame from `input` into `output`.
///
/// Truncated, empty or corrupted input yields `CorruptArtifact`; `key` only
/// labels the error. Failures writing `output` are reported as I/O errors.
pub fn decompress<R: Read, W: Write>(key: &str, input: R, mut output: W) -> ArchiveResult<u64> {
    let corrupt = |reason: String| ArchiveError::CorruptArtifact {
        key: key.to_string(),
        reason,
    };
    let mut counted = CountingReader {
        inner: input,
        count: 0,
    };
    let mut written = 0u64;
    {
        let mut decoder = FrameDecoder::new(&mut counted);
        let mut buf = vec![0u8; COPY_BUF];
        loop {
            let n = match decoder.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(corrupt(e.to_string())),
            };
            output.write_all(&buf[..n])?;
            written += n as u64;
        }
    }
    if counted.count == 0 {
        return Err(corrupt("empty payload".to_string()));
    }
    output.flush()?;
    Ok(written)
}

/// In-memory convenience wrapper around [`compress`].
pub fn compress_bytes(data: &[u8]) -> ArchiveResult<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len() / 2 + 64);
    compress(data, &mut out)?;
    Ok(out)
}

/// In-memory convenience wrapper around [`decompress`].
pub fn decompress_bytes(key: &str, data: &[u8]) -> ArchiveResult<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len() * 2);
    decompress(key, data, &mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn prop_lz4_roundtrip(data in prop::collection::vec(any::<u8>(), 0..100_000)) {
            let c = compress_bytes(&data).unwrap();
            let d = decompress_bytes("k", &c).unwrap();
            prop_assert_eq!(d, data);
        }

        #[test]
        fn prop_truncation_is_detected(
            data in prop::collection::vec(any::<u8>(), 1..20_000),
            cut in 1usize..64,
        ) {
            let c = compress_bytes(&data).unwrap();
            let keep = c.len().saturating_sub(cut);
            let err = decompress_bytes("k", &c[..keep]).unwrap_err();
            let is_corrupt = matches!(err, ArchiveError::CorruptArtifact { .. });
            prop_assert!(is_corrupt);
        }
    }

    #[test]
    fn test_empty_roundtrip() {
        let c = compress_bytes(&[]).unwrap();
        assert!(!c.is_empty());
        assert_eq!(decompress_bytes("k", &c).unwrap(), b"");
    }

    #[test]
    fn test_empty_payload_is_corrupt() {
        let err = decompress_bytes("wal/x", &[]).unwrap_err();
        assert!(matches!(err, ArchiveError::CorruptArtifact { ref key, .. } if key == "wal/x"));
    }

    #[test]
    fn test_bit_flip_is_detected() {
        let data: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();
        let mut c = compress_bytes(&data).unwrap();
        let mid = c.len() / 2;
        c[mid] ^= 0x40;
        assert!(matches!(
            decompress_bytes("k", &c),
            Err(ArchiveError::CorruptArtifact { .. })
        ));
    }

    #[test]
    fn test_garbage_is_rejected() {
        let garbage = b"this is definitely not an lz4 frame".to_vec();
        assert!(matches!(
            decompress_bytes("k", &garbage),
            Err(ArchiveError::CorruptArtifact { .. })
        ));
    }

    #[test]
    fn test_stats() {
        let data = vec![7u8; 1 << 20];
        let mut out = Vec::new();
        let stats = compress(&data[..], &mut out).unwrap();
        assert_eq!(stats.raw_bytes, data.len() as u64);
        assert_eq!(stats.compressed_bytes, out.len() as u64);
        assert!(stats.ratio() > 10.0);
    }
}
