// Reconnect delay schedule.
//
// Starts at the configured initial delay and doubles after every failed
// attempt until it reaches the cap. A successful handshake resets it.

use std::time::Duration;

use crate::config::ReconnectPolicy;

#[derive(Clone, Debug)]
pub(crate) struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub(crate) fn new(policy: &ReconnectPolicy) -> Self {
        let base = policy.initial_delay();
        Self {
            base,
            max: policy.max_delay().max(base),
            current: base,
        }
    }

    /// Delay before the next attempt; advances the schedule.
    pub(crate) fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        let next = self.current.checked_mul(2).unwrap_or(self.max);
        self.current = next.min(self.max);
        delay
    }

    pub(crate) fn reset(&mut self) {
        self.current = self.base;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(initial: u64, max: u64) -> ReconnectPolicy {
        ReconnectPolicy {
            initial_delay_ms: initial,
            max_delay_ms: max,
        }
    }

    #[test]
    fn doubles_until_capped() {
        let mut backoff = Backoff::new(&policy(10, 40));
        assert_eq!(backoff.next_delay(), Duration::from_millis(10));
        assert_eq!(backoff.next_delay(), Duration::from_millis(20));
        assert_eq!(backoff.next_delay(), Duration::from_millis(40));
        assert_eq!(backoff.next_delay(), Duration::from_millis(40));
    }

    #[test]
    fn reset_starts_over() {
        let mut backoff = Backoff::new(&policy(500, 30_000));
        for _ in 0..10 {
            backoff.next_delay();
        }
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
    }

    #[test]
    fn cap_below_initial_delay_is_raised() {
        let mut backoff = Backoff::new(&policy(100, 10));
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn huge_delays_do_not_overflow() {
        let mut backoff = Backoff::new(&policy(u64::MAX / 2, u64::MAX));
        for _ in 0..4 {
            assert!(backoff.next_delay() >= Duration::from_millis(u64::MAX / 2));
        }
    }
}
