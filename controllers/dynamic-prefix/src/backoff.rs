//! Fibonacci requeue backoff for failed reconciliations.
//!
//! Grows more slowly than exponential backoff, which suits reconciles that
//! fail while the network side (DHCPv6 server, router) is catching up.
//! Sequence with the defaults: 1m, 1m, 2m, 3m, 5m, 8m, 10m (cap).

use std::time::Duration;

/// Per-resource Fibonacci backoff state.
#[derive(Debug, Clone)]
pub struct FibonacciBackoff {
    min: Duration,
    max: Duration,
    prev: Duration,
    current: Duration,
}

impl FibonacciBackoff {
    /// Defaults used by all controllers: 1 minute floor, 10 minute cap.
    pub fn for_reconcile_errors() -> Self {
        Self::new(Duration::from_secs(60), Duration::from_secs(600))
    }

    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max,
            prev: Duration::ZERO,
            current: min,
        }
    }

    /// The next backoff duration, advancing the sequence (capped at `max`).
    pub fn next_backoff(&mut self) -> Duration {
        let result = self.current;
        let next = self.prev + self.current;
        self.prev = self.current;
        self.current = std::cmp::min(next, self.max);
        result
    }

    /// Restart the sequence after a successful reconcile.
    pub fn reset(&mut self) {
        self.prev = Duration::ZERO;
        self.current = self.min;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn follows_the_fibonacci_sequence_to_the_cap() {
        let mut backoff = FibonacciBackoff::for_reconcile_errors();

        let minutes: Vec<u64> = (0..8).map(|_| backoff.next_backoff().as_secs() / 60).collect();
        assert_eq!(minutes, vec![1, 1, 2, 3, 5, 8, 10, 10]);
    }

    #[test]
    fn reset_restarts_from_the_floor() {
        let mut backoff = FibonacciBackoff::for_reconcile_errors();
        for _ in 0..4 {
            backoff.next_backoff();
        }

        backoff.reset();
        assert_eq!(backoff.next_backoff(), Duration::from_secs(60));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(60));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(120));
    }
}
