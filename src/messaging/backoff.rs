//! Reconnect backoff.
//!
//! Delays grow along a Fibonacci sequence seeded with `(base, 2 * base)`:
//! with a one second base the waits are 2s, 3s, 5s, 8s, ... Every delay is
//! clamped to the configured maximum, after which it holds steady.

use std::time::Duration;

use crate::types::ReconnectConfig;

/// Fibonacci retry delay pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryState {
    base: Duration,
    max: Duration,
    previous: Duration,
    current: Duration,
    attempts: u32,
}

impl RetryState {
    pub fn new(base: Duration, max: Duration) -> Self {
        let max = max.max(base);
        Self {
            base,
            max,
            previous: base,
            current: (base * 2).min(max),
            attempts: 0,
        }
    }

    pub fn from_config(config: &ReconnectConfig) -> Self {
        Self::new(config.base_delay(), config.max_delay())
    }

    /// Return the delay to wait now and advance the sequence.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        let next = (self.previous + self.current).min(self.max);
        self.previous = self.current;
        self.current = next;
        self.attempts = self.attempts.saturating_add(1);
        delay
    }

    /// Delay the next call to [`next_delay`](Self::next_delay) will return.
    pub fn peek(&self) -> Duration {
        self.current
    }

    /// Failed attempts since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Restart the sequence after a successful reconnect.
    pub fn reset(&mut self) {
        *self = Self::new(self.base, self.max);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn secs(values: &[u64]) -> Vec<Duration> {
        values.iter().map(|s| Duration::from_secs(*s)).collect()
    }

    #[test]
    fn test_fibonacci_growth() {
        let mut retry = RetryState::new(Duration::from_secs(1), Duration::from_secs(3600));
        let delays: Vec<_> = (0..6).map(|_| retry.next_delay()).collect();

        assert_eq!(delays, secs(&[2, 3, 5, 8, 13, 21]));
        assert_eq!(retry.attempts(), 6);
    }

    #[test]
    fn test_delay_is_capped() {
        let mut retry = RetryState::new(Duration::from_secs(1), Duration::from_secs(10));
        let delays: Vec<_> = (0..7).map(|_| retry.next_delay()).collect();

        assert_eq!(delays, secs(&[2, 3, 5, 8, 10, 10, 10]));
    }

    #[test]
    fn test_reset_restarts_sequence() {
        let mut retry = RetryState::new(Duration::from_millis(500), Duration::from_secs(60));
        retry.next_delay();
        retry.next_delay();
        retry.reset();

        assert_eq!(retry.attempts(), 0);
        assert_eq!(retry.peek(), Duration::from_secs(1));
    }

    #[test]
    fn test_max_below_base_is_raised() {
        let mut retry = RetryState::new(Duration::from_secs(5), Duration::from_secs(1));
        assert_eq!(retry.next_delay(), Duration::from_secs(5));
        assert_eq!(retry.next_delay(), Duration::from_secs(5));
    }
}
