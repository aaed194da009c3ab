//! # Fibonacci Backoff
//!
//! Progressive backoff that grows more slowly than exponential backoff.
//! Used twice: to space requeues of resources whose reconciliation keeps
//! failing (1m, 1m, 2m, 3m, 5m, 8m, 10m) and to hold off re-submitting a
//! cluster spec the driver already rejected (30s up to 10m).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Fibonacci backoff calculator
///
/// Each backoff is the sum of the previous two, capped at the maximum.
#[derive(Debug, Clone)]
pub struct FibonacciBackoff {
    min: Duration,
    prev: Duration,
    current: Duration,
    max: Duration,
}

impl FibonacciBackoff {
    /// Create a backoff starting at `min` and capped at `max`
    #[must_use]
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            prev: Duration::ZERO,
            current: min,
            max,
        }
    }

    /// Get the next backoff duration and advance the sequence
    pub fn next_backoff(&mut self) -> Duration {
        let result = self.current;
        let next = self.prev + self.current;
        self.prev = self.current;
        self.current = std::cmp::min(next, self.max);
        result
    }

    /// Reset the backoff to the initial state
    pub fn reset(&mut self) {
        self.prev = Duration::ZERO;
        self.current = self.min;
    }
}

/// Backoff state for a resource
#[derive(Debug, Clone)]
struct BackoffState {
    backoff: FibonacciBackoff,
    error_count: u32,
    retry_at: Option<Instant>,
}

/// Per-resource backoff bookkeeping, keyed by `namespace/name`.
#[derive(Debug, Clone)]
pub struct BackoffTracker {
    min: Duration,
    max: Duration,
    states: Arc<Mutex<HashMap<String, BackoffState>>>,
}

impl BackoffTracker {
    #[must_use]
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max,
            states: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Requeue spacing for failing reconciliations.
    #[must_use]
    pub fn for_errors() -> Self {
        Self::new(Duration::from_secs(60), Duration::from_secs(600))
    }

    /// Spacing between re-submissions of a rejected driver spec.
    #[must_use]
    pub fn for_failed_specs() -> Self {
        Self::new(Duration::from_secs(30), Duration::from_secs(600))
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, BackoffState>> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records a failure and returns how long to wait before the next attempt.
    pub fn record_failure(&self, key: &str) -> Duration {
        let (min, max) = (self.min, self.max);
        let mut states = self.lock();
        let state = states.entry(key.to_string()).or_insert_with(|| BackoffState {
            backoff: FibonacciBackoff::new(min, max),
            error_count: 0,
            retry_at: None,
        });
        state.error_count += 1;
        let delay = state.backoff.next_backoff();
        state.retry_at = Some(Instant::now() + delay);
        delay
    }

    /// Time left before the resource may be retried, if it is backing off.
    pub fn remaining(&self, key: &str) -> Option<Duration> {
        let states = self.lock();
        let retry_at = states.get(key)?.retry_at?;
        let now = Instant::now();
        (retry_at > now).then(|| retry_at - now)
    }

    /// Consecutive failures recorded for the resource.
    pub fn error_count(&self, key: &str) -> u32 {
        self.lock().get(key).map_or(0, |s| s.error_count)
    }

    /// Forgets the resource's failures (on success).
    pub fn reset(&self, key: &str) {
        self.lock().remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fibonacci_backoff_sequence() {
        let mut backoff = FibonacciBackoff::new(Duration::from_secs(60), Duration::from_secs(600));

        let seq: Vec<u64> = (0..8).map(|_| backoff.next_backoff().as_secs()).collect();
        assert_eq!(seq, vec![60, 60, 120, 180, 300, 480, 600, 600]);
    }

    #[test]
    fn test_fibonacci_backoff_reset() {
        let mut backoff = FibonacciBackoff::new(Duration::from_secs(30), Duration::from_secs(600));

        assert_eq!(backoff.next_backoff(), Duration::from_secs(30));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(30));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(60));

        backoff.reset();

        assert_eq!(backoff.next_backoff(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tracker_holds_off_until_delay_elapses() {
        let tracker = BackoffTracker::for_failed_specs();
        assert_eq!(tracker.remaining("c1"), None);

        assert_eq!(tracker.record_failure("c1"), Duration::from_secs(30));
        assert_eq!(tracker.remaining("c1"), Some(Duration::from_secs(30)));
        assert_eq!(tracker.error_count("c1"), 1);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(tracker.remaining("c1"), None);

        tracker.reset("c1");
        assert_eq!(tracker.error_count("c1"), 0);
    }
}
