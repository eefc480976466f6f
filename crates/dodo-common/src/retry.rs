//! Retry with exponential backoff and jitter
//!
//! Used wherever dodo talks to something that comes up asynchronously: the
//! Git server right after its Helm release reports ready, the reconciler
//! admin endpoint, freshly created clusters.
//!
//! # Example
//!
//! ```ignore
//! use dodo_common::retry::{retry_with_backoff, RetryConfig};
//!
//! let keys = retry_with_backoff(&RetryConfig::with_max_attempts(10), "soft-serve pubkeys", || async {
//!     git_server.public_keys().await
//! })
//! .await?;
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

/// Backoff parameters
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = retry forever)
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts
    pub max_delay: Duration,
    /// Multiplier applied to the delay after every failure
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Retry at most `attempts` times
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Retry forever
    pub fn infinite() -> Self {
        Self::default()
    }

    fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts > 0 && attempt >= self.max_attempts
    }

    fn next_delay(&self, delay: Duration) -> Duration {
        Duration::from_secs_f64(
            (delay.as_secs_f64() * self.backoff_multiplier).min(self.max_delay.as_secs_f64()),
        )
    }
}

/// Run `operation` until it succeeds or the attempt budget is spent.
///
/// Returns the last error once `max_attempts` is exhausted.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_with_backoff_if(config, operation_name, operation, |_| true).await
}

/// Like [`retry_with_backoff`] but gives up immediately on errors for which
/// `is_transient` returns false.
pub async fn retry_with_backoff_if<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
    is_transient: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;
        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if !is_transient(&err) {
            error!(operation = %operation_name, attempt, error = %err, "Permanent failure");
            return Err(err);
        }
        if config.exhausted(attempt) {
            error!(operation = %operation_name, attempt, error = %err, "Giving up after max retries");
            return Err(err);
        }

        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let sleep_for = Duration::from_secs_f64(delay.as_secs_f64() * jitter);
        warn!(
            operation = %operation_name,
            attempt,
            error = %err,
            delay_ms = sleep_for.as_millis(),
            "Operation failed, retrying"
        );
        tokio::time::sleep(sleep_for).await;
        delay = config.next_delay(delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
        }
    }

    #[tokio::test]
    async fn returns_first_success() {
        let result: Result<u32, &str> =
            retry_with_backoff(&fast(3), "op", || async { Ok(7) }).await;
        assert_eq!(result, Ok(7));
    }

    #[tokio::test]
    async fn recovers_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let result: Result<&str, &str> = retry_with_backoff(&fast(5), "op", || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("not yet")
                } else {
                    Ok("ready")
                }
            }
        })
        .await;

        assert_eq!(result, Ok("ready"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn stops_after_budget() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let result: Result<(), &str> = retry_with_backoff(&fast(3), "op", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err("down")
            }
        })
        .await;

        assert_eq!(result, Err("down"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let result: Result<(), &str> = retry_with_backoff_if(
            &fast(10),
            "op",
            || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err("forbidden")
                }
            },
            |e| *e != "forbidden",
        )
        .await;

        assert_eq!(result, Err("forbidden"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn delay_is_capped() {
        let config = fast(0);
        assert_eq!(
            config.next_delay(Duration::from_millis(4)),
            Duration::from_millis(5)
        );
    }
}
