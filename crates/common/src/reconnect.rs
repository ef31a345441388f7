// Client reconnection contract.
//
// Clients reconnect with capped exponential backoff plus jitter. The relay
// tolerates bursts of reconnects because `join_room` is idempotent per user
// and stale presences expire after a bounded TTL.

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
    /// Fraction of the computed delay (0-100) that may be randomised away.
    pub jitter_percent: u8,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(30),
            max_attempts: u32::MAX, // retry indefinitely
            jitter_percent: 50,
        }
    }
}

impl ReconnectPolicy {
    /// Deterministic backoff for a 0-based attempt number, before jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.min(16); // cap exponent to avoid overflow
        let nanos = self.base_delay.as_nanos().saturating_mul(1u128 << exp);
        let capped = nanos.min(self.max_delay.as_nanos());
        Duration::from_nanos(u64::try_from(capped).unwrap_or(u64::MAX))
    }

    /// Backoff with jitter drawn from `rng`: the delay lies in
    /// `[backoff * (1 - jitter), backoff]`.
    pub fn delay_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let backoff = self.backoff(attempt);
        let jitter_percent = u32::from(self.jitter_percent.min(100));
        if jitter_percent == 0 || backoff.is_zero() {
            return backoff;
        }

        let max_jitter = backoff.mul_f64(f64::from(jitter_percent) / 100.0);
        let jitter = max_jitter.mul_f64(rng.gen_range(0.0..=1.0));
        backoff.saturating_sub(jitter)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with_rng(attempt, &mut rand::thread_rng())
    }
}

/// Client-side bookkeeping for consecutive connection failures.
#[derive(Debug, Clone, Default)]
pub struct ReconnectState {
    policy: ReconnectPolicy,
    consecutive_failures: u32,
}

impl ReconnectState {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self { policy, consecutive_failures: 0 }
    }

    pub fn record_failure(&mut self) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn should_reconnect(&self) -> bool {
        self.consecutive_failures < self.policy.max_attempts
    }

    /// Delay before the next attempt, or `None` once attempts are exhausted.
    pub fn next_delay(&self) -> Option<Duration> {
        self.should_reconnect().then(|| self.policy.delay(self.consecutive_failures))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    fn no_jitter() -> ReconnectPolicy {
        ReconnectPolicy { jitter_percent: 0, ..ReconnectPolicy::default() }
    }

    #[test]
    fn backoff_starts_at_base_and_doubles() {
        let policy = no_jitter();
        assert_eq!(policy.backoff(0), Duration::from_millis(250));
        assert_eq!(policy.backoff(1), Duration::from_millis(500));
        assert_eq!(policy.backoff(2), Duration::from_millis(1000));
    }

    #[test]
    fn backoff_caps_at_max_delay() {
        let policy = no_jitter();
        assert_eq!(policy.backoff(20), Duration::from_secs(30));
        assert_eq!(policy.backoff(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = ReconnectPolicy::default();
        let mut rng = StdRng::seed_from_u64(7);
        for attempt in 0..10 {
            let backoff = policy.backoff(attempt);
            let delay = policy.delay_with_rng(attempt, &mut rng);
            assert!(delay <= backoff);
            assert!(delay >= backoff / 2);
        }
    }

    #[test]
    fn success_resets_failures() {
        let mut state = ReconnectState::new(no_jitter());
        state.record_failure();
        state.record_failure();
        assert_eq!(state.next_delay(), Some(Duration::from_millis(1000)));

        state.record_success();
        assert_eq!(state.consecutive_failures(), 0);
        assert_eq!(state.next_delay(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn max_attempts_stops_reconnecting() {
        let mut state =
            ReconnectState::new(ReconnectPolicy { max_attempts: 2, ..no_jitter() });
        state.record_failure();
        assert!(state.should_reconnect());
        state.record_failure();
        assert!(!state.should_reconnect());
        assert_eq!(state.next_delay(), None);
    }
}
