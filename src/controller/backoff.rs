//! # Fibonacci Backoff
//!
//! Per-resource retry delays for failed reconcile passes. The sequence grows
//! more slowly than exponential backoff: with a 5s floor and a 300s cap it
//! runs 5s, 5s, 10s, 15s, 25s, 40s, 65s, 105s, 170s, 275s, 300s.
//!
//! ## Usage
//!
//! ```rust
//! use stack_operator::controller::backoff::FibonacciBackoff;
//! use std::time::Duration;
//!
//! let mut backoff = FibonacciBackoff::new(Duration::from_secs(5), Duration::from_secs(300));
//! assert_eq!(backoff.next_backoff(), Duration::from_secs(5));
//! assert_eq!(backoff.next_backoff(), Duration::from_secs(5));
//! assert_eq!(backoff.next_backoff(), Duration::from_secs(10));
//! ```

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Fibonacci backoff calculator
///
/// Each delay is the sum of the previous two, capped at `max`.
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

    /// Get the next delay and advance the sequence
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

/// Backoff state for a specific resource
#[derive(Debug, Clone)]
pub struct BackoffState {
    pub backoff: FibonacciBackoff,
    pub error_count: u32,
}

/// Backoff state per resource key (`kind/namespace/name`)
///
/// Kept outside the reconcile pass so a failing resource never delays others.
#[derive(Debug)]
pub struct BackoffRegistry {
    min: Duration,
    max: Duration,
    states: Mutex<HashMap<String, BackoffState>>,
}

impl BackoffRegistry {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Record a failure and return the delay before the next attempt and the error count
    pub fn next(&self, key: &str) -> (Duration, u32) {
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        let state = states
            .entry(key.to_string())
            .or_insert_with(|| BackoffState {
                backoff: FibonacciBackoff::new(self.min, self.max),
                error_count: 0,
            });
        state.error_count += 1;
        (state.backoff.next_backoff(), state.error_count)
    }

    /// Forget the failure history after a successful pass
    pub fn reset(&self, key: &str) {
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        states.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(values: &[u64]) -> Vec<Duration> {
        values.iter().copied().map(Duration::from_secs).collect()
    }

    #[test]
    fn test_fibonacci_backoff_sequence_and_cap() {
        let mut backoff = FibonacciBackoff::new(Duration::from_secs(5), Duration::from_secs(60));
        let delays: Vec<_> = (0..8).map(|_| backoff.next_backoff()).collect();
        assert_eq!(delays, secs(&[5, 5, 10, 15, 25, 40, 60, 60]));
    }

    #[test]
    fn test_fibonacci_backoff_reset() {
        let mut backoff = FibonacciBackoff::new(Duration::from_secs(1), Duration::from_secs(10));
        backoff.next_backoff();
        backoff.next_backoff();
        backoff.next_backoff();

        backoff.reset();

        // Should restart from beginning after success
        assert_eq!(backoff.next_backoff(), Duration::from_secs(1));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(1));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(2));
    }

    #[test]
    fn test_registry_keeps_independent_state_per_resource() {
        let registry = BackoffRegistry::new(Duration::from_secs(5), Duration::from_secs(300));

        assert_eq!(registry.next("kibana/ns/a"), (Duration::from_secs(5), 1));
        assert_eq!(registry.next("kibana/ns/a"), (Duration::from_secs(5), 2));
        assert_eq!(registry.next("kibana/ns/a"), (Duration::from_secs(10), 3));

        // Second resource starts fresh
        assert_eq!(registry.next("kibana/ns/b"), (Duration::from_secs(5), 1));

        registry.reset("kibana/ns/a");
        assert_eq!(registry.next("kibana/ns/a"), (Duration::from_secs(5), 1));
        assert_eq!(registry.next("kibana/ns/b"), (Duration::from_secs(5), 2));
    }
}
