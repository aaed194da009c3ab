//! Bounded retry with a fixed pause between attempts.
//!
//! Used for the optimistic-concurrency status loop, driver teardown and
//! the driver log relay. Attempt counts and pauses are configuration, not
//! protocol guarantees.

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// How many times to try and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first (minimum 1)
    pub attempts: u32,
    /// Pause between consecutive attempts
    pub pause: Duration,
}

impl RetryPolicy {
    /// Creates a policy.
    #[must_use]
    pub const fn new(attempts: u32, pause: Duration) -> Self {
        Self { attempts, pause }
    }

    /// A single attempt and no pause.
    #[must_use]
    pub const fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }
}

/// Runs `op` until it succeeds or `policy.attempts` is exhausted.
///
/// `op` receives the 1-based attempt number. The last error is returned
/// after exhaustion.
pub async fn retry<T, E, F, Fut>(policy: RetryPolicy, operation: &str, op: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_if(policy, operation, |_| true, op).await
}

/// Like [`retry`], but stops early on errors `should_retry` rejects.
pub async fn retry_if<T, E, F, Fut, P>(
    policy: RetryPolicy,
    operation: &str,
    should_retry: P,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        match op(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation = %operation, attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) => {
                if attempt >= attempts || !should_retry(&e) {
                    warn!(operation = %operation, attempt, error = %e, "Operation failed, giving up");
                    return Err(e);
                }
                debug!(
                    operation = %operation,
                    attempt,
                    error = %e,
                    pause_ms = policy.pause.as_millis(),
                    "Operation failed, retrying"
                );
                tokio::time::sleep(policy.pause).await;
            }
        }
    }
}
