//! Exponential reconnect backoff with jitter.
//!
//! The delay before reconnect attempt `n` (zero-based) is
//! `min(initial * 2^n, max) + uniform(0..=max_jitter)`. The jitter keeps a
//! fleet of devices that dropped at the same moment from reconnecting in
//! lockstep.
//!
//! # Examples
//!
//! ```
//! use pethub_core::Backoff;
//! use std::time::Duration;
//!
//! let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(8))
//!     .with_jitter(Duration::ZERO);
//!
//! assert_eq!(backoff.base_delay(0), Duration::from_secs(1));
//! assert_eq!(backoff.base_delay(2), Duration::from_secs(4));
//! assert_eq!(backoff.base_delay(10), Duration::from_secs(8));
//! ```

use crate::constants::{
    DEFAULT_RECONNECT_INITIAL_MS, DEFAULT_RECONNECT_JITTER_MS, DEFAULT_RECONNECT_MAX_ATTEMPTS,
    DEFAULT_RECONNECT_MAX_MS,
};
use rand::Rng;
use std::time::Duration;

/// Reconnect delay policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    /// Delay before the first reconnect attempt.
    pub initial: Duration,

    /// Cap applied to the exponential part of the delay.
    pub max: Duration,

    /// Upper bound of the random jitter added on top of the capped delay.
    pub max_jitter: Duration,

    /// Attempts after which automatic reconnection stops (`None` retries forever).
    pub max_attempts: Option<u32>,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(DEFAULT_RECONNECT_INITIAL_MS),
            max: Duration::from_millis(DEFAULT_RECONNECT_MAX_MS),
            max_jitter: Duration::from_millis(DEFAULT_RECONNECT_JITTER_MS),
            max_attempts: Some(DEFAULT_RECONNECT_MAX_ATTEMPTS),
        }
    }
}

impl Backoff {
    /// Create a policy with the given initial delay and cap, default jitter
    /// and attempt limit.
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            ..Default::default()
        }
    }

    /// Set the jitter upper bound.
    pub fn with_jitter(mut self, max_jitter: Duration) -> Self {
        self.max_jitter = max_jitter;
        self
    }

    /// Set the attempt limit.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Retry forever.
    pub fn unlimited(mut self) -> Self {
        self.max_attempts = None;
        self
    }

    /// Capped exponential delay without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial
            .checked_mul(factor)
            .map_or(self.max, |delay| delay.min(self.max))
    }

    /// Delay before reconnect attempt `attempt`, jitter drawn from `rng`.
    pub fn delay_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let jitter_ms = u64::try_from(self.max_jitter.as_millis()).unwrap_or(u64::MAX);
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rng.gen_range(0..=jitter_ms))
        };
        self.base_delay(attempt) + jitter
    }

    /// Delay before reconnect attempt `attempt`, using the thread RNG.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with(attempt, &mut rand::thread_rng())
    }

    /// Whether `attempts` already reached the attempt limit.
    pub fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }

    /// Largest delay this policy can produce.
    pub fn ceiling(&self) -> Duration {
        self.max + self.max_jitter
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rstest::rstest;

    #[rstest]
    #[case(0, 1_000)]
    #[case(1, 2_000)]
    #[case(2, 4_000)]
    #[case(5, 32_000)]
    #[case(6, 60_000)]
    #[case(40, 60_000)]
    fn test_base_delay_doubles_until_cap(#[case] attempt: u32, #[case] expected_ms: u64) {
        let backoff = Backoff::default();
        assert_eq!(backoff.base_delay(attempt), Duration::from_millis(expected_ms));
    }

    #[test]
    fn test_exhausted() {
        let backoff = Backoff::default().with_max_attempts(3);
        assert!(!backoff.exhausted(2));
        assert!(backoff.exhausted(3));
        assert!(!backoff.unlimited().exhausted(u32::MAX));
    }

    #[test]
    fn test_zero_jitter_is_deterministic() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(1))
            .with_jitter(Duration::ZERO);
        assert_eq!(backoff.delay(3), Duration::from_millis(800));
    }

    proptest! {
        /// Delays never exceed the ceiling, for any attempt and seed.
        #[test]
        fn prop_delay_bounded(attempt in 0u32..64, seed in any::<u64>()) {
            let backoff = Backoff::default();
            let mut rng = StdRng::seed_from_u64(seed);
            let delay = backoff.delay_with(attempt, &mut rng);
            prop_assert!(delay <= backoff.ceiling());
            prop_assert!(delay >= backoff.base_delay(attempt));
        }

        /// Consecutive delays are non-decreasing while the cap is not reached,
        /// as long as jitter stays below the initial delay.
        #[test]
        fn prop_delays_non_decreasing_until_cap(seed in any::<u64>()) {
            let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(64))
                .with_jitter(Duration::from_millis(900));
            let mut rng = StdRng::seed_from_u64(seed);

            let mut previous = Duration::ZERO;
            for attempt in 0..=6 {
                let delay = backoff.delay_with(attempt, &mut rng);
                prop_assert!(delay >= previous);
                prop_assert!(delay <= backoff.ceiling());
                previous = delay;
            }
        }
    }
}
