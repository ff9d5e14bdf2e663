//! Exponential backoff for failed flushes.

use std::time::Duration;

/// Delay doubling per consecutive failure, capped, reset on success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    failures: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            failures: 0,
        }
    }

    /// Record a failure and return how long to wait before retrying.
    pub fn fail(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        self.current()
    }

    /// Delay for the current failure streak; `None` when not backing off.
    pub fn delay(&self) -> Option<Duration> {
        (self.failures > 0).then(|| self.current())
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    fn current(&self) -> Duration {
        let exponent = self.failures.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(300))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_cap() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(10));
        assert_eq!(backoff.delay(), None);

        let delays: Vec<_> = (0..6).map(|_| backoff.fail().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 10, 10]);
    }

    #[test]
    fn reset_on_success() {
        let mut backoff = Backoff::default();
        backoff.fail();
        backoff.fail();
        assert_eq!(backoff.delay(), Some(Duration::from_secs(2)));

        backoff.reset();
        assert_eq!(backoff.delay(), None);
        assert_eq!(backoff.fail(), Duration::from_secs(1));
    }

    #[test]
    fn long_streak_does_not_overflow() {
        let mut backoff = Backoff::default();
        for _ in 0..100 {
            backoff.fail();
        }
        assert_eq!(backoff.delay(), Some(Duration::from_secs(300)));
    }
}
