//! Backoff helpers for operations that may fail transiently.
//!
//! Three shapes are provided:
//!
//! - [`retry_with_backoff`] re-runs a single async operation while a predicate
//!   says the error is worth retrying (binding writes that lose a race)
//! - [`Backoff`] hands out successive jittered delays for long-lived loops that
//!   re-establish a watch after it breaks
//! - [`RequeueLimiter`] counts failed reconciles per object and spaces out
//!   their requeues
//!
//! ```ignore
//! use canopy::retry::{retry_with_backoff, RetryConfig};
//!
//! let binding = retry_with_backoff(
//!     &RetryConfig::with_max_attempts(5),
//!     "ensure_role_binding",
//!     |e: &canopy::Error| e.is_conflict(),
//!     || async { ensure_binding(&store, &request).await },
//! ).await?;
//! ```

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tracing::{error, warn};

/// Backoff shape shared by retries and watch re-subscription.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = infinite)
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Upper bound on any single delay
    pub max_delay: Duration,
    /// Multiplier applied after every failed attempt
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Delays used when a watch stream has to be re-established
    pub fn watch_restart() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }
}

/// Successive jittered delays following a [`RetryConfig`].
#[derive(Debug)]
pub struct Backoff {
    config: RetryConfig,
    delay: Duration,
}

impl Backoff {
    /// Start at the config's initial delay
    pub fn new(config: RetryConfig) -> Self {
        let delay = config.initial_delay;
        Self { config, delay }
    }

    /// Next delay to wait, jittered to 0.5x..1.5x and then grown exponentially
    pub fn next_delay(&mut self) -> Duration {
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let jittered = Duration::from_secs_f64(self.delay.as_secs_f64() * jitter);

        self.delay = Duration::from_secs_f64(
            (self.delay.as_secs_f64() * self.config.backoff_multiplier)
                .min(self.config.max_delay.as_secs_f64()),
        );
        jittered
    }

    /// Go back to the initial delay after a success
    pub fn reset(&mut self) {
        self.delay = self.config.initial_delay;
    }
}

/// Per-key exponential requeue delay: `base * 2^(failures - 1)`, capped at `max`
#[derive(Debug)]
pub struct RequeueLimiter<T> {
    base_delay: Duration,
    max_delay: Duration,
    failures: Mutex<HashMap<T, u32>>,
}

impl<T: Hash + Eq + Clone> Default for RequeueLimiter<T> {
    fn default() -> Self {
        Self::new(Duration::from_millis(5), Duration::from_secs(1000))
    }
}

impl<T: Hash + Eq + Clone> RequeueLimiter<T> {
    /// Limiter with custom bounds
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Count a failure of `key`; returns the failure count and the delay
    /// before the next attempt
    pub fn record_failure(&self, key: &T) -> (u32, Duration) {
        let mut failures = self.failures.lock();
        let count = failures.entry(key.clone()).or_insert(0);
        *count += 1;
        (*count, self.delay_for(*count))
    }

    /// Failures of `key` since it last succeeded
    pub fn failures(&self, key: &T) -> u32 {
        self.failures.lock().get(key).copied().unwrap_or(0)
    }

    /// Reset `key` after a success or once it is given up on
    pub fn forget(&self, key: &T) {
        self.failures.lock().remove(key);
    }

    fn delay_for(&self, failures: u32) -> Duration {
        let factor = 2u32.saturating_pow(failures.saturating_sub(1).min(31));
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}

/// Execute an async operation, retrying with exponential backoff and jitter
/// while `retry_when` accepts the error.
///
/// Returns the first success, the first error `retry_when` rejects, or the last
/// error once `max_attempts` is exhausted.
pub async fn retry_with_backoff<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation_name: &str,
    retry_when: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0u32;
    let mut backoff = Backoff::new(config.clone());

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if !retry_when(&e) => return Err(e),
            Err(e) => {
                if config.max_attempts > 0 && attempt >= config.max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                let delay = backoff.next_delay();
                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = delay.as_millis(),
                    "Operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_config(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            backoff_multiplier: 2.0,
        }
    }

    #[tokio::test]
    async fn test_succeeds_immediately() {
        let result: Result<i32, &str> =
            retry_with_backoff(&fast_config(3), "op", |_| true, || async { Ok(42) }).await;
        assert_eq!(result, Ok(42));
    }

    #[tokio::test]
    async fn test_succeeds_after_retryable_failures() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<i32, &str> = retry_with_backoff(
            &fast_config(5),
            "op",
            |e| *e == "conflict",
            || {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("conflict")
                    } else {
                        Ok(42)
                    }
                }
            },
        )
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_error_returns_immediately() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<i32, &str> = retry_with_backoff(
            &fast_config(5),
            "op",
            |e| *e == "conflict",
            || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err("forbidden")
                }
            },
        )
        .await;

        assert_eq!(result, Err("forbidden"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhausts_max_attempts() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<i32, &str> = retry_with_backoff(
            &fast_config(3),
            "op",
            |_| true,
            || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err("always fails")
                }
            },
        )
        .await;

        assert_eq!(result, Err("always fails"));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn requeue_delay_doubles_and_caps() {
        let limiter = RequeueLimiter::default();
        let key = "team-a/ada".to_string();
        assert_eq!(limiter.record_failure(&key), (1, Duration::from_millis(5)));
        assert_eq!(limiter.record_failure(&key), (2, Duration::from_millis(10)));
        assert_eq!(limiter.record_failure(&key).1, Duration::from_millis(20));
        assert_eq!(limiter.failures(&key), 3);
        assert_eq!(limiter.delay_for(40), Duration::from_secs(1000));
    }

    #[test]
    fn requeue_limiter_keys_are_independent() {
        let limiter = RequeueLimiter::default();
        limiter.record_failure(&"team-a/ada");
        limiter.record_failure(&"team-a/ada");
        limiter.record_failure(&"team-b/bob");

        limiter.forget(&"team-a/ada");
        assert_eq!(limiter.failures(&"team-a/ada"), 0);
        assert_eq!(limiter.failures(&"team-b/bob"), 1);
        assert_eq!(limiter.record_failure(&"team-a/ada").1, Duration::from_millis(5));
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let mut backoff = Backoff::new(RetryConfig {
            max_attempts: 0,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(4),
            backoff_multiplier: 2.0,
        });

        let delays: Vec<Duration> = (0..5).map(|_| backoff.next_delay()).collect();
        // jitter keeps each delay within 0.5x..1.5x of the base
        assert!(delays[0] >= Duration::from_millis(500) && delays[0] < Duration::from_millis(1500));
        assert!(delays[4] >= Duration::from_secs(2) && delays[4] < Duration::from_secs(6));

        backoff.reset();
        assert!(backoff.next_delay() < Duration::from_millis(1500));
    }
}
