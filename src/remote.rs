//! Shared throttling and retry policy for every outbound call (knowledge graph
//! and LLM adjudication alike).

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum RemoteError {
    /// Timeouts, throttling and 5xx responses. Worth another attempt later.
    #[error("transient remote failure: {0}")]
    Transient(String),
    /// Anything retrying cannot fix: 4xx, undecodable bodies, bad configuration.
    #[error("remote failure: {0}")]
    Permanent(String),
}

impl RemoteError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Transient(_))
    }

    /// Classifies a reqwest failure.
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            RemoteError::Transient(err.to_string())
        } else if let Some(status) = err.status() {
            Self::from_status(status, &err.to_string())
        } else if err.is_decode() {
            RemoteError::Permanent(format!("malformed response: {}", err))
        } else {
            RemoteError::Transient(err.to_string())
        }
    }

    pub fn from_status(status: reqwest::StatusCode, context: &str) -> Self {
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            RemoteError::Transient(format!("HTTP {}: {}", status, context))
        } else {
            RemoteError::Permanent(format!("HTTP {}: {}", status, context))
        }
    }
}

/// Minimum-interval limiter shared by all workers.
///
/// Slots are handed out in acquisition order, so the outbound rate stays bounded
/// no matter how many workers are waiting.
#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    next_slot: Mutex<Instant>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            next_slot: Mutex::new(Instant::now()),
        }
    }

    /// A limiter that never waits.
    pub fn unlimited() -> Self {
        Self::new(Duration::ZERO)
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    pub async fn acquire(&self) {
        if self.min_interval.is_zero() {
            return;
        }
        let slot = {
            let mut next = self.next_slot.lock().await;
            let slot = (*next).max(Instant::now());
            *next = slot + self.min_interval;
            slot
        };
        sleep_until(slot).await;
    }
}

/// Exponential backoff with jitter, applied to transient failures only.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt` (0-based), capped at `max_delay`, with up
    /// to 25% random jitter on top.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        let delay = self.base_delay.saturating_mul(factor).min(self.max_delay);
        let jitter_ceiling = (delay.as_millis() / 4) as u64;
        if jitter_ceiling == 0 {
            return delay;
        }
        let jitter = rand::rng().random_range(0..=jitter_ceiling);
        delay + Duration::from_millis(jitter)
    }

    /// Runs `op`, retrying transient failures. Every attempt waits for a limiter slot.
    pub async fn run<T, F, Fut>(
        &self,
        limiter: &RateLimiter,
        label: &str,
        mut op: F,
    ) -> Result<T, RemoteError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let mut attempt = 0;
        loop {
            limiter.acquire().await;
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.max_retries => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        "{}: {} (retry {}/{} in {:?})",
                        label,
                        err,
                        attempt + 1,
                        self.max_retries,
                        delay
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    debug!("{}: giving up after {} attempt(s): {}", label, attempt + 1, err);
                    return Err(err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delay_is_capped() {
        let policy = BackoffPolicy {
            max_retries: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(400),
        };
        assert!(policy.delay_for(0) >= Duration::from_millis(100));
        assert!(policy.delay_for(0) <= Duration::from_millis(125));
        assert!(policy.delay_for(8) <= Duration::from_millis(500));
        assert!(policy.delay_for(8) >= Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_limiter_spaces_calls() {
        let limiter = RateLimiter::new(Duration::from_millis(25));
        let start = Instant::now();
        for _ in 0..4 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() >= Duration::from_millis(75));
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried_then_surface() {
        let policy = BackoffPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        };
        let limiter = RateLimiter::unlimited();
        let calls = AtomicU32::new(0);

        let result: Result<(), RemoteError> = policy
            .run(&limiter, "test", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(RemoteError::Transient("503".to_string())) }
            })
            .await;

        assert!(matches!(result, Err(RemoteError::Transient(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_failures_are_not_retried() {
        let policy = BackoffPolicy::default();
        let limiter = RateLimiter::unlimited();
        let calls = AtomicU32::new(0);

        let result: Result<(), RemoteError> = policy
            .run(&limiter, "test", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(RemoteError::Permanent("404".to_string())) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
