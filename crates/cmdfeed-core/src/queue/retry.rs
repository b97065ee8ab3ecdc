//! Retry policy: decides backoff delays for throttled or unavailable backends.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::ports::StorageError;

/// Retry policy for transient backend failures.
///
/// Used by collection initialization (with jitter, honouring the server's
/// retry-after hint) and by the flush loop when a batch is throttled.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    pub max_attempts: u32,

    /// Base delay for the first retry.
    pub base_delay: Duration,

    /// Backoff multiplier for exponential backoff.
    pub multiplier: f64,

    /// Each jittered step multiplies the delay by a factor drawn from
    /// `[multiplier - jitter, multiplier + jitter)`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            jitter: 0.5,
        }
    }
}

impl RetryPolicy {
    /// Calculate delay for the next retry based on attempt number.
    ///
    /// `attempts` is the number of attempts already made (1-indexed).
    /// delay = base_delay * multiplier^(attempts - 1)
    ///
    /// Example with base_delay=1s, multiplier=2.0:
    /// - attempt 1 (first failure): 1s
    /// - attempt 2: 2s
    /// - attempt 3: 4s
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let base_secs = self.base_delay.as_secs_f64();
        let delay_secs = base_secs * self.multiplier.powi(attempts.saturating_sub(1) as i32);
        Duration::from_secs_f64(delay_secs.max(0.0))
    }

    /// Grow `current` by a randomized backoff factor.
    pub fn jittered_step(&self, current: Duration) -> Duration {
        let low = (self.multiplier - self.jitter).max(1.0);
        let high = (self.multiplier + self.jitter).max(low);
        let factor = if high > low {
            rand::thread_rng().gen_range(low..high)
        } else {
            low
        };
        Duration::from_secs_f64(current.as_secs_f64() * factor)
    }

    pub fn has_attempts_left(&self, attempts: u32) -> bool {
        attempts < self.max_attempts.max(1)
    }
}

/// Run `op` until it succeeds, fails with a non-transient error, or the policy
/// runs out of attempts.
///
/// Each round waits for the longer of the computed delay and the server's
/// retry-after hint.
pub async fn retry_transient<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut op: F,
) -> Result<T, StorageError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StorageError>>,
{
    let mut attempts = 0u32;
    let mut delay = policy.base_delay;

    loop {
        attempts += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && policy.has_attempts_left(attempts) => {
                let wait = err.retry_after().map_or(delay, |hint| hint.max(delay));
                debug!(operation, attempts, wait_ms = wait.as_millis() as u64, error = %err, "transient failure, retrying");
                tokio::time::sleep(wait).await;
                delay = policy.jittered_step(delay);
            }
            Err(err) => {
                if err.is_transient() {
                    warn!(operation, attempts, error = %err, "giving up after repeated transient failures");
                }
                return Err(err);
            }
        }
    }
}
