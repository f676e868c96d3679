//! Bounded retry with exponential backoff and jitter.
//!
//! Used by the IPC client while a pipe is busy or not yet listening: attempts
//! repeat with growing delays until they succeed, hit a non-retryable error,
//! or the overall deadline passes.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Initial delay between attempts.
    pub base_delay: Duration,
    /// Maximum delay cap.
    pub max_delay: Duration,
    /// Exponential base (typically 2.0 for doubling).
    pub exponential_base: f64,
    /// Whether to add random jitter to delays.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(500),
            exponential_base: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
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

    /// Calculate the delay after a failed attempt (0-indexed).
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let multiplier = self.exponential_base.powi(exponent);
        let delay_secs = self.base_delay.as_secs_f64() * multiplier;
        let capped_secs = delay_secs.min(self.max_delay.as_secs_f64());

        let final_secs = if self.jitter {
            // Factor in [0.5, 1.5) keeps the mean delay without near-zero waits.
            let mut rng = rand::rng();
            let jitter_factor = rng.random_range(0.5..1.5);
            (capped_secs * jitter_factor).min(self.max_delay.as_secs_f64())
        } else {
            capped_secs
        };

        Duration::from_secs_f64(final_secs)
    }
}

/// Why [`retry_until`] gave up.
#[derive(Debug)]
pub enum RetryError<E> {
    /// The operation failed with an error the predicate rejected.
    Fatal(E),
    /// The deadline passed; carries the last error seen, if any.
    DeadlineExceeded(Option<E>),
}

/// Retry `operation` until it succeeds, fails fatally, or `deadline` passes.
///
/// A single attempt still in flight at the deadline is abandoned.
pub async fn retry_until<F, Fut, T, E>(
    deadline: Instant,
    config: &RetryConfig,
    mut operation: F,
    should_retry: impl Fn(&E) -> bool,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;
    let mut last_error = None;

    loop {
        let result = match tokio::time::timeout_at(deadline, operation()).await {
            Ok(result) => result,
            Err(_) => return Err(RetryError::DeadlineExceeded(last_error)),
        };

        match result {
            Ok(value) => {
                if attempt > 0 {
                    debug!("Operation succeeded after {} attempts", attempt + 1);
                }
                return Ok(value);
            }
            Err(e) if !should_retry(&e) => {
                debug!("Error is not retryable: {}", e);
                return Err(RetryError::Fatal(e));
            }
            Err(e) => {
                let delay = config.calculate_delay(attempt);
                if Instant::now() + delay >= deadline {
                    return Err(RetryError::DeadlineExceeded(Some(e)));
                }
                debug!("Attempt {} failed: {}. Retrying in {:?}", attempt + 1, e, delay);
                last_error = Some(e);
                attempt += 1;
                tokio::time::sleep(delay).await;
            }
        }
    }
}
