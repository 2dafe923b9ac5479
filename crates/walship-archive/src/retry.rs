//! Retry with exponential backoff for store operations.
//!
//! Only `Transient` errors are retried. Each attempt runs under its own
//! timeout, clamped to an optional absolute deadline that callers may share
//! across several loops. Cancellation is observed both while an attempt is
//! in flight and while backing off.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ArchiveError, ArchiveResult};

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts allowed, first try included (default: 3).
    pub max_attempts: u32,
    /// Initial backoff duration (default: 100ms).
    pub initial_backoff: Duration,
    /// Maximum backoff duration (default: 10 seconds).
    pub max_backoff: Duration,
    /// Multiplier for exponential backoff (default: 2.0).
    pub backoff_multiplier: f64,
    /// Whether to add random jitter to backoff (default: true).
    pub jitter: bool,
    /// Timeout for a single attempt (default: 60 seconds).
    pub attempt_timeout: Duration,
    /// Bound on one whole operation, if any.
    pub deadline: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: true,
            attempt_timeout: Duration::from_secs(60),
            deadline: None,
        }
    }
}

/// Executor for retry operations.
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    /// Create a new RetryExecutor with the given configuration.
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// The active configuration.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Absolute deadline for an operation starting now, if one is configured.
    pub fn deadline_from_now(&self) -> Option<Instant> {
        self.config.deadline.map(|d| Instant::now() + d)
    }

    /// Run `operation` until it succeeds, fails non-transiently, runs out of
    /// attempts or deadline, or `cancel` fires.
    ///
    /// The closure receives the 1-based attempt number. Exhaustion is
    /// reported as `RetriesExhausted`, which is permanent.
    pub async fn execute<F, Fut, T>(
        &self,
        op: &str,
        cancel: &CancellationToken,
        operation: F,
    ) -> ArchiveResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = ArchiveResult<T>>,
    {
        self.execute_until(op, self.deadline_from_now(), cancel, operation)
            .await
    }

    /// Like [`execute`](Self::execute), bounded by a caller-supplied absolute
    /// deadline so several retry loops can share one budget. Each attempt's
    /// timeout is clamped to the time left.
    pub async fn execute_until<F, Fut, T>(
        &self,
        op: &str,
        deadline: Option<Instant>,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> ArchiveResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = ArchiveResult<T>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0u32;
        let mut last_error = String::from("no attempt made");

        loop {
            if cancel.is_cancelled() {
                return Err(ArchiveError::Cancelled);
            }
            let attempt_timeout = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(deadline_reached(op, attempt, &last_error));
                    }
                    remaining.min(self.config.attempt_timeout)
                }
                None => self.config.attempt_timeout,
            };
            attempt += 1;

            let timed = tokio::time::timeout(attempt_timeout, operation(attempt));
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ArchiveError::Cancelled),
                r = timed => match r {
                    Ok(inner) => inner,
                    Err(_) => Err(ArchiveError::transient(
                        op,
                        format!("attempt timed out after {:?}", attempt_timeout),
                    )),
                },
            };

            let err = match result {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(op, attempt, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) => e,
            };

            if attempt >= max_attempts {
                warn!(op, attempts = attempt, error = %err, "retries exhausted");
                return Err(ArchiveError::RetriesExhausted {
                    op: op.to_string(),
                    attempts: attempt,
                    last_error: err.to_string(),
                });
            }

            let backoff = self.compute_backoff(attempt - 1);
            if let Some(deadline) = deadline {
                if Instant::now() + backoff >= deadline {
                    return Err(deadline_reached(op, attempt, &err.to_string()));
                }
            }
            last_error = err.to_string();

            debug!(op, attempt, backoff_ms = backoff.as_millis() as u64, error = %err, "transient failure, backing off");
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ArchiveError::Cancelled),
                _ = tokio::time::sleep(backoff) => {}
            }
        }
    }

    /// Compute the exponential backoff duration for a given retry.
    ///
    /// Computes: `initial_backoff * backoff_multiplier^retry`, capped at
    /// `max_backoff`. Jitter adds up to 50% of the computed delay.
    fn compute_backoff(&self, retry: u32) -> Duration {
        let base_delay_ms = self.config.initial_backoff.as_millis() as f64;
        let max_delay_ms = self.config.max_backoff.as_millis() as f64;
        let computed = base_delay_ms * self.config.backoff_multiplier.powi(retry as i32);
        let capped = computed.min(max_delay_ms).max(0.0) as u64;

        if self.config.jitter && capped > 1 {
            let jitter_ms = rand::thread_rng().gen_range(0..=capped / 2);
            Duration::from_millis(capped.saturating_add(jitter_ms))
        } else {
            Duration::from_millis(capped)
        }
    }
}

fn deadline_reached(op: &str, attempts: u32, last_error: &str) -> ArchiveError {
    warn!(op, attempts, error = %last_error, "retry deadline reached");
    ArchiveError::RetriesExhausted {
        op: op.to_string(),
        attempts,
        last_error: format!("deadline reached: {}", last_error),
    }
}
