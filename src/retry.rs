//! Retry with exponential backoff for external I/O.
//!
//! The knowledge source fetch and the generative call both go through
//! [`retry_with_backoff`]; the caller decides which errors are worth retrying.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

/// Attempt limit and base delay. Delay doubles per attempt, plus up to one
/// base delay of jitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    max_attempts: usize,
    base_delay_ms: u64,
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay_ms: base_delay.as_millis() as u64,
        }
    }

    /// Exactly one attempt.
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO)
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// Backoff before retry number `attempt` (1-based), without jitter.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16) as u32;
        Duration::from_millis(self.base_delay_ms.saturating_mul(1u64 << exponent))
    }
}

/// Run `op` until it succeeds, returns a non-retryable error, or the attempt
/// limit is reached. The last error is returned as-is.
pub async fn retry_with_backoff<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    label: &str,
    retryable: P,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: Display,
{
    let mut attempt = 0usize;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= policy.max_attempts || !retryable(&err) {
                    return Err(err);
                }
                let jitter = if policy.base_delay_ms > 0 {
                    rand::thread_rng().gen_range(0..=policy.base_delay_ms)
                } else {
                    0
                };
                let delay = policy.delay_for_attempt(attempt) + Duration::from_millis(jitter);
                warn!(
                    "{label} failed (attempt {attempt}/{}): {err}; retrying in {delay:?}",
                    policy.max_attempts
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
