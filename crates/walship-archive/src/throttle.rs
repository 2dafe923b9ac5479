//! Read throttling for base backups.
//!
//! A backup reads the whole data directory of a live server. The throttle
//! caps the combined read rate of every worker so the backup does not
//! starve the database of disk bandwidth.

use std::io::{self, Read};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Lowest accepted limit, in bytes per second.
pub const MIN_READ_RATE: u64 = 8192;

/// Token bucket that may go into debt. Capacity is one second of reads.
#[derive(Debug)]
struct Bucket {
    rate: f64,
    capacity: f64,
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(bytes_per_sec: u64, now: Instant) -> Self {
        let rate = bytes_per_sec as f64;
        Self {
            rate,
            capacity: rate,
            tokens: rate,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
            self.last_refill = now;
        }
    }

    /// Take `amount` tokens and return how long the caller must wait for
    /// the bucket to be out of debt again.
    fn reserve(&mut self, amount: u64, now: Instant) -> Duration {
        self.refill(now);
        self.tokens -= amount as f64;
        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / self.rate)
        }
    }
}

/// A byte-rate limit shared by every reader created from it.
#[derive(Debug, Clone)]
pub struct ReadThrottle {
    bytes_per_sec: u64,
    bucket: Arc<Mutex<Bucket>>,
}

impl ReadThrottle {
    /// Limit reads to `bytes_per_sec` in total.
    pub fn new(bytes_per_sec: u64) -> Self {
        let bytes_per_sec = bytes_per_sec.max(1);
        Self {
            bytes_per_sec,
            bucket: Arc::new(Mutex::new(Bucket::new(bytes_per_sec, Instant::now()))),
        }
    }

    /// Configured limit.
    pub fn bytes_per_sec(&self) -> u64 {
        self.bytes_per_sec
    }

    fn reserve(&self, amount: u64, now: Instant) -> Duration {
        self.bucket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .reserve(amount, now)
    }

    /// Wrap `inner` so its reads count against this limit.
    pub fn reader<R: Read>(&self, inner: R) -> ThrottledReader<R> {
        ThrottledReader {
            inner,
            throttle: self.clone(),
        }
    }
}

/// A reader that sleeps as needed to stay under its throttle.
///
/// Sleeping blocks the thread; use it on the blocking pool only.
#[derive(Debug)]
pub struct ThrottledReader<R> {
    inner: R,
    throttle: ReadThrottle,
}

impl<R: Read> Read for ThrottledReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        // No single read may exceed one second's worth of the limit.
        let max = buf.len().min(self.throttle.bytes_per_sec as usize);
        let n = self.inner.read(&mut buf[..max])?;
        if n > 0 {
            let wait = self.throttle.reserve(n as u64, Instant::now());
            if !wait.is_zero() {
                std::thread::sleep(wait);
            }
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_allows_one_second_burst() {
        let start = Instant::now();
        let mut bucket = Bucket::new(10_000, start);
        assert_eq!(bucket.reserve(10_000, start), Duration::ZERO);
        assert_eq!(bucket.reserve(5_000, start), Duration::from_millis(500));
    }

    #[test]
    fn test_bucket_refills_over_time() {
        let start = Instant::now();
        let mut bucket = Bucket::new(8192, start);
        bucket.reserve(8192, start);
        let later = start + Duration::from_millis(250);
        assert_eq!(bucket.reserve(2048, later), Duration::ZERO);
        assert_eq!(bucket.reserve(4096, later), Duration::from_millis(500));
    }

    #[test]
    fn test_bucket_never_exceeds_capacity() {
        let start = Instant::now();
        let mut bucket = Bucket::new(1_000, start);
        let much_later = start + Duration::from_secs(3600);
        assert_eq!(bucket.reserve(1_000, much_later), Duration::ZERO);
        assert!(bucket.reserve(500, much_later) > Duration::ZERO);
    }

    #[test]
    fn test_throttled_reader_is_slowed_and_lossless() {
        let data: Vec<u8> = (0..150_000u32).map(|i| (i % 251) as u8).collect();
        let throttle = ReadThrottle::new(100_000);
        let started = Instant::now();
        let mut out = Vec::new();
        throttle.reader(&data[..]).read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
        assert!(
            started.elapsed() >= Duration::from_millis(400),
            "elapsed {:?}",
            started.elapsed()
        );
    }

    #[test]
    fn test_readers_share_one_limit() {
        let throttle = ReadThrottle::new(50_000);
        let a = vec![1u8; 40_000];
        let b = vec![2u8; 40_000];
        let started = Instant::now();
        let mut sink = Vec::new();
        throttle.reader(&a[..]).read_to_end(&mut sink).unwrap();
        throttle.reader(&b[..]).read_to_end(&mut sink).unwrap();
        assert_eq!(sink.len(), 80_000);
        assert!(started.elapsed() >= Duration::from_millis(500));
    }
}
