//! Exponential backoff with jitter.
//!
//! Two independent generators drive the delivery cycle: the cycle backoff,
//! consulted after an empty or failed claim, and the delivery backoff,
//! consulted between failed attempts to reach the remote endpoint. Each owns
//! its own random source.

use std::time::Duration;

use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Parameters of an exponential backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay after the first failure.
    pub min: Duration,

    /// Upper bound on any delay.
    pub max: Duration,

    /// Growth factor per consecutive failure.
    pub factor: f64,

    /// Jitter fraction (0.0 to 1.0) applied around the computed delay.
    pub jitter_factor: f64,
}

impl BackoffPolicy {
    /// Backoff between cycles that claimed nothing: 10s doubling to 5m.
    pub fn cycle_default() -> Self {
        Self {
            min: Duration::from_secs(10),
            max: Duration::from_secs(300),
            factor: 2.0,
            jitter_factor: 0.25,
        }
    }

    /// Backoff between delivery attempts: 1s growing by 10% to 5m.
    pub fn delivery_default() -> Self {
        Self {
            min: Duration::from_secs(1),
            max: Duration::from_secs(300),
            factor: 1.1,
            jitter_factor: 0.25,
        }
    }

    /// Delay for `failures` consecutive failures before jitter.
    ///
    /// `min * factor^failures`, capped at `max`. Non-decreasing in `failures`.
    pub fn computed_delay(&self, failures: u32) -> Duration {
        let exponent = i32::try_from(failures).unwrap_or(i32::MAX);
        let secs = self.min.as_secs_f64() * self.factor.max(1.0).powi(exponent);

        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            return self.max;
        }
        Duration::from_secs_f64(secs).max(self.min).min(self.max)
    }

    /// Delay for `failures` consecutive failures with jitter applied.
    ///
    /// Randomizes the computed delay by ±`jitter_factor` and clamps the
    /// result to `[min, max]`, so the value is always within
    /// `computed * jitter_factor` of the computed delay.
    pub fn delay<R: Rng + ?Sized>(&self, failures: u32, rng: &mut R) -> Duration {
        let computed = self.computed_delay(failures);
        let jitter = self.jitter_factor.clamp(0.0, 1.0);
        if jitter <= 0.0 || computed.is_zero() {
            return computed;
        }

        let range = computed.as_secs_f64() * jitter;
        let offset = rng.random_range(-range..=range);
        let jittered = Duration::from_secs_f64((computed.as_secs_f64() + offset).max(0.0));

        jittered.clamp(self.min.min(self.max), self.max)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::cycle_default()
    }
}

/// Stateful backoff generator.
///
/// Counts consecutive failures and produces the next delay from its policy.
/// [`Backoff::reset`] returns it to the minimum after a success.
#[derive(Debug, Clone)]
pub struct Backoff<R = StdRng> {
    policy: BackoffPolicy,
    failures: u32,
    rng: R,
}

impl Backoff<StdRng> {
    /// Creates a generator seeded from the operating system.
    pub fn new(policy: BackoffPolicy) -> Self {
        Self::with_rng(policy, StdRng::from_os_rng())
    }
}

impl<R: Rng> Backoff<R> {
    /// Creates a generator with an explicit random source.
    pub fn with_rng(policy: BackoffPolicy, rng: R) -> Self {
        Self { policy, failures: 0, rng }
    }

    /// Returns the delay for the current failure count and counts one more
    /// failure.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.policy.delay(self.failures, &mut self.rng);
        self.failures = self.failures.saturating_add(1);
        delay
    }

    /// Forgets all failures.
    pub fn reset(&mut self) {
        self.failures = 0;
    }

    /// Consecutive failures counted since the last reset.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// The policy this generator follows.
    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter(mut policy: BackoffPolicy) -> BackoffPolicy {
        policy.jitter_factor = 0.0;
        policy
    }

    #[test]
    fn cycle_backoff_doubles_to_cap() {
        let policy = no_jitter(BackoffPolicy::cycle_default());

        let delays: Vec<_> = (0..7).map(|n| policy.computed_delay(n).as_secs()).collect();

        assert_eq!(delays, [10, 20, 40, 80, 160, 300, 300]);
    }

    #[test]
    fn delivery_backoff_grows_slowly() {
        let policy = no_jitter(BackoffPolicy::delivery_default());

        assert_eq!(policy.computed_delay(0), Duration::from_secs(1));
        assert_eq!(policy.computed_delay(1).as_millis(), 1100);
        assert_eq!(policy.computed_delay(2).as_millis(), 1210);
        assert_eq!(policy.computed_delay(u32::MAX), Duration::from_secs(300));
    }

    #[test]
    fn reset_returns_to_minimum() {
        let mut backoff =
            Backoff::with_rng(no_jitter(BackoffPolicy::cycle_default()), StdRng::seed_from_u64(7));

        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.failures(), 2);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(10));
    }

    #[test]
    fn seeded_generators_are_reproducible() {
        let policy = BackoffPolicy::cycle_default();
        let mut a = Backoff::with_rng(policy.clone(), StdRng::seed_from_u64(42));
        let mut b = Backoff::with_rng(policy, StdRng::seed_from_u64(42));

        for _ in 0..10 {
            assert_eq!(a.next_delay(), b.next_delay());
        }
    }
}
