//! Retry and periodic timing.

use chrono::{DateTime, Utc};
use core_runtime::config::RetryPolicy;
use rand::Rng;
use std::time::Duration;

/// Exponential backoff derived from a [`RetryPolicy`].
pub trait Backoff {
    /// Delay before retry number `attempt` (0-based): `min(base * factor^attempt, cap)`.
    fn delay_for(&self, attempt: u32) -> Duration;
}

impl Backoff for RetryPolicy {
    fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.factor.max(1.0);
        // Past 2^32 every realistic cap is long exceeded.
        let exponent = attempt.min(32) as i32;
        let secs = self.base_delay.as_secs_f64() * factor.powi(exponent);
        let capped = secs.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }
}

/// Periodic interval plus a uniform jitter in `jitter_min..=jitter_max`.
pub fn periodic_delay<R: Rng + ?Sized>(
    interval: Duration,
    jitter_min: Duration,
    jitter_max: Duration,
    rng: &mut R,
) -> Duration {
    let min = jitter_min.as_millis() as u64;
    let max = jitter_max.as_millis() as u64;
    let jitter = if max > min {
        rng.gen_range(min..=max)
    } else {
        min
    };
    interval + Duration::from_millis(jitter)
}

/// Enforces a minimum spacing between retries. Manual passes are checked
/// against it; manual and backoff retry starts are both recorded.
#[derive(Debug, Clone)]
pub struct MinIntervalGate {
    min_interval: Duration,
    last: Option<DateTime<Utc>>,
}

impl MinIntervalGate {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: None,
        }
    }

    /// Whether a pass may start at `now`.
    pub fn allows(&self, now: DateTime<Utc>) -> bool {
        match self.last {
            None => true,
            Some(last) => match (now - last).to_std() {
                Ok(elapsed) => elapsed >= self.min_interval,
                // Clock went backwards; do not lock the user out.
                Err(_) => true,
            },
        }
    }

    pub fn record(&mut self, now: DateTime<Utc>) {
        self.last = Some(now);
    }

    pub fn last(&self) -> Option<DateTime<Utc>> {
        self.last
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_default_policy_sequence() {
        let policy = RetryPolicy::default();
        let delays: Vec<u64> = (0..6).map(|n| policy.delay_for(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 8, 8]);
    }

    #[test]
    fn test_backoff_monotonic_and_capped() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(8),
            factor: 2.0,
            ..RetryPolicy::default()
        };

        let mut previous = Duration::ZERO;
        for attempt in 0..200 {
            let delay = policy.delay_for(attempt);
            assert!(delay >= previous, "attempt {attempt} decreased");
            assert!(delay <= policy.max_delay);
            previous = delay;
        }
        assert_eq!(previous, policy.max_delay);
    }

    #[test]
    fn test_factor_below_one_never_shrinks() {
        let policy = RetryPolicy {
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(8),
            factor: 0.5,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_for(5), Duration::from_secs(2));
    }

    #[test]
    fn test_periodic_delay_within_jitter_bounds() {
        let mut rng = StdRng::seed_from_u64(7);
        let interval = Duration::from_secs(15 * 60);
        let min = Duration::from_secs(30);
        let max = Duration::from_secs(180);

        for _ in 0..500 {
            let delay = periodic_delay(interval, min, max, &mut rng);
            assert!(delay >= interval + min);
            assert!(delay <= interval + max);
        }
    }

    #[test]
    fn test_min_interval_gate() {
        let start = DateTime::from_timestamp(1_000, 0).unwrap();
        let mut gate = MinIntervalGate::new(Duration::from_secs(3));
        assert!(gate.allows(start));

        gate.record(start);
        assert!(!gate.allows(start + chrono::Duration::seconds(2)));
        assert!(gate.allows(start + chrono::Duration::seconds(3)));
        assert!(gate.allows(start - chrono::Duration::seconds(10)));
    }
}
