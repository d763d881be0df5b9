//! Fixed-interval pacing and 429-aware retry for remote calls.

use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rand::Rng;
use tokio::time::{Instant, sleep};
use tracing::{debug, warn};

use crate::config::RateLimitConfig;

/// Errors that can report upstream throttling.
pub trait Throttled {
    fn is_rate_limited(&self) -> bool;

    /// Server-provided wait hint, if any.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

/// One limiter per engine run. Nothing is shared across instances.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    operations: AtomicU64,
    started_at: Instant,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            operations: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    /// Sleep the configured inter-call interval.
    pub async fn delay(&self) {
        let delay = self.config.delay();
        if !delay.is_zero() {
            sleep(delay).await;
        }
    }

    /// Run `op`, retrying only rate-limited failures.
    ///
    /// Attempt `n` (zero-based) waits `backoff_base * 2^n`, stretched to the
    /// server's `Retry-After` when that is longer. After `max_retries` retries the
    /// last error is returned. Any other error is returned immediately.
    pub async fn execute_with_retry<T, E, F, Fut>(&self, name: &str, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Throttled + Display,
    {
        let mut attempt: u32 = 0;
        loop {
            self.operations.fetch_add(1, Ordering::Relaxed);
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_rate_limited() && attempt < self.config.max_retries => {
                    let wait = self.backoff_for(attempt, err.retry_after());
                    warn!(
                        operation = name,
                        attempt = attempt + 1,
                        max_retries = self.config.max_retries,
                        wait_ms = wait.as_millis() as u64,
                        "Rate limited, backing off"
                    );
                    sleep(wait).await;
                    attempt += 1;
                }
                Err(err) => {
                    if err.is_rate_limited() {
                        warn!(operation = name, error = %err, "Rate limit retries exhausted");
                    } else {
                        debug!(operation = name, error = %err, "Operation failed without retry");
                    }
                    return Err(err);
                }
            }
        }
    }

    fn backoff_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let exponential = self
            .config
            .backoff_base_ms
            .saturating_mul(1u64 << attempt.min(16));
        // Up to 10% jitter so parallel engines don't retry in lockstep.
        let jitter = if exponential >= 10 {
            rand::thread_rng().gen_range(0..=exponential / 10)
        } else {
            0
        };
        let backoff = Duration::from_millis(exponential + jitter);
        match retry_after {
            Some(hint) if hint > backoff => hint,
            _ => backoff,
        }
    }

    /// Calls issued through [`execute_with_retry`](Self::execute_with_retry), retries included.
    pub fn operation_count(&self) -> u64 {
        self.operations.load(Ordering::Relaxed)
    }

    /// Operations per second since construction.
    pub fn throughput(&self) -> f64 {
        let secs = self.started_at.elapsed().as_secs_f64();
        if secs <= f64::EPSILON {
            0.0
        } else {
            self.operation_count() as f64 / secs
        }
    }
}
