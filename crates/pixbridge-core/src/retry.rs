//! Exponential backoff for connection warm-up.
//!
//! `ClientBridge::call` never backs off on its own; this is only used when a
//! caller explicitly waits for the host to come up (see
//! [`ClientBridge::connect_with_retry`](crate::ipc::ClientBridge::connect_with_retry)).

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Doubling backoff schedule, capped at `max_delay`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Attempts in total, the first one included.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Scale each pause by a random factor in `0.5..1.5`.
    pub jitter: bool,
}

impl Default for RetryConfig {
    /// Six attempts with 0.5, 1, 2, 4 and 8 second pauses between them.
    fn default() -> Self {
        Self {
            max_attempts: 6,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            jitter: false,
        }
    }
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Pause after failed attempt `attempt` (0-indexed).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let doubled = self
            .base_delay
            .checked_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX))
            .unwrap_or(self.max_delay);
        let delay = doubled.min(self.max_delay);

        if self.jitter {
            let scaled = delay.as_secs_f64() * rand::rng().random_range(0.5..1.5);
            Duration::try_from_secs_f64(scaled)
                .unwrap_or(self.max_delay)
                .min(self.max_delay)
        } else {
            delay
        }
    }
}

/// Run `operation` until it succeeds, fails with an error `should_retry`
/// rejects, or the attempts run out.
///
/// Returns the last result together with the number of attempts made.
pub async fn retry_async<F, Fut, T, E>(
    config: &RetryConfig,
    mut operation: F,
    should_retry: impl Fn(&E) -> bool,
) -> (Result<T, E>, u32)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        let err = match operation().await {
            Ok(value) => return (Ok(value), attempt + 1),
            Err(err) => err,
        };

        if !should_retry(&err) {
            debug!("Not retrying: {}", err);
            return (Err(err), attempt + 1);
        }
        if attempt + 1 >= max_attempts {
            warn!("Giving up after {} attempts: {}", max_attempts, err);
            return (Err(err), attempt + 1);
        }

        let delay = config.delay_for(attempt);
        debug!(
            "Attempt {}/{} failed: {}; retrying in {:?}",
            attempt + 1,
            max_attempts,
            err,
            delay
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}
