use std::time::Duration;

use rand::{Rng, SeedableRng, rngs::SmallRng};

use super::config::BackoffReconnectConfig;

/// Exponential backoff between connection attempts.
///
/// `next_delay` is a pure function of the attempt index (apart from jitter); the retry
/// budget and the attempt counter live in [`ReconnectAttempt`], owned by the client.
#[derive(Clone, Copy, Debug)]
pub struct BackoffPolicy {
    min_ms: u64,
    max_ms: u64,
    factor: f64,
    jitter: bool,
    num_reconnect: u32,
}

impl BackoffPolicy {
    pub fn new(cfg: &BackoffReconnectConfig) -> Self {
        let factor = if cfg.factor.is_finite() && cfg.factor >= 1.0 {
            cfg.factor
        } else {
            1.0
        };
        Self {
            min_ms: cfg.min_milliseconds.min(cfg.max_milliseconds),
            max_ms: cfg.max_milliseconds,
            factor,
            jitter: cfg.jitter,
            num_reconnect: cfg.num_reconnect,
        }
    }

    /// Delay before retry number `attempt` (0-indexed).
    ///
    /// `base = min(max, min * factor^attempt)`; with jitter the result is uniform in
    /// `[min, base]`.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base_ms(attempt);
        if !self.jitter || base_ms <= self.min_ms {
            return Duration::from_millis(base_ms);
        }
        let mut rng = SmallRng::from_entropy();
        Duration::from_millis(rng.gen_range(self.min_ms..=base_ms))
    }

    fn base_ms(&self, attempt: u32) -> u64 {
        let scaled = self.min_ms as f64 * self.factor.powf(f64::from(attempt));
        if !scaled.is_finite() || scaled >= self.max_ms as f64 {
            return self.max_ms;
        }
        (scaled as u64).clamp(self.min_ms, self.max_ms)
    }

    /// Whether another attempt is allowed after `failed` consecutive failures.
    #[inline]
    pub fn allows(&self, failed: u32) -> bool {
        self.num_reconnect == 0 || failed < self.num_reconnect
    }

    pub fn num_reconnect(&self) -> u32 {
        self.num_reconnect
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(&BackoffReconnectConfig::default())
    }
}

/// Outcome of recording a failed connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPlan {
    /// Wait this long, then open a new session.
    RetryAfter(Duration),
    /// The configured attempt budget is spent.
    Exhausted,
}

/// Consecutive-failure counter for one connect cycle.
///
/// Reset to zero on every successful connection; discarded on terminal close.
#[derive(Clone, Copy, Debug, Default)]
pub struct ReconnectAttempt {
    failed: u32,
}

impl ReconnectAttempt {
    #[inline]
    pub fn failed(&self) -> u32 {
        self.failed
    }

    pub fn reset(&mut self) {
        self.failed = 0;
    }

    /// Count a failed open and decide whether (and when) to try again.
    pub fn record_failure(&mut self, policy: &BackoffPolicy) -> RetryPlan {
        self.failed = self.failed.saturating_add(1);
        if !policy.allows(self.failed) {
            return RetryPlan::Exhausted;
        }
        RetryPlan::RetryAfter(policy.next_delay(self.failed - 1))
    }

    /// Delay before reopening after an established session dropped.
    pub fn after_drop(&self, policy: &BackoffPolicy) -> Duration {
        policy.next_delay(self.failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(min: u64, max: u64, factor: f64, jitter: bool) -> BackoffReconnectConfig {
        BackoffReconnectConfig {
            num_reconnect: 0,
            factor,
            jitter,
            min_milliseconds: min,
            max_milliseconds: max,
        }
    }

    #[test]
    fn doubles_from_min_and_clamps_at_max() {
        let policy = BackoffPolicy::new(&cfg(100, 20_000, 2.0, false));
        let delays: Vec<u64> = (0..5)
            .map(|n| policy.next_delay(n).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1600]);

        assert_eq!(policy.next_delay(8), Duration::from_millis(20_000));
        assert_eq!(policy.next_delay(64), Duration::from_millis(20_000));
        assert_eq!(policy.next_delay(u32::MAX), Duration::from_millis(20_000));
    }

    #[test]
    fn jittered_delay_stays_within_bounds() {
        let policy = BackoffPolicy::new(&cfg(100, 20_000, 2.0, true));
        for attempt in 0..20 {
            let upper = policy.base_ms(attempt);
            for _ in 0..50 {
                let delay = policy.next_delay(attempt).as_millis() as u64;
                assert!(delay >= 100, "attempt {attempt}: {delay} below min");
                assert!(delay <= upper, "attempt {attempt}: {delay} above {upper}");
                assert!(delay <= 20_000);
            }
        }
    }

    #[test]
    fn jittered_mean_grows_until_clamped() {
        let policy = BackoffPolicy::new(&cfg(100, 20_000, 2.0, true));
        let mean = |attempt: u32| -> f64 {
            (0..400)
                .map(|_| policy.next_delay(attempt).as_millis() as f64)
                .sum::<f64>()
                / 400.0
        };
        assert!(mean(6) > mean(1));
        assert!(mean(10) > mean(4));
    }

    #[test]
    fn equal_bounds_collapse_to_constant() {
        let policy = BackoffPolicy::new(&cfg(250, 250, 2.0, true));
        for attempt in [0, 1, 7, 100] {
            assert_eq!(policy.next_delay(attempt), Duration::from_millis(250));
        }
    }

    #[test]
    fn unit_factor_disables_growth() {
        let policy = BackoffPolicy::new(&cfg(300, 5_000, 1.0, false));
        for attempt in [0, 1, 2, 50] {
            assert_eq!(policy.next_delay(attempt), Duration::from_millis(300));
        }

        let jittered = BackoffPolicy::new(&cfg(300, 5_000, 1.0, true));
        assert_eq!(jittered.next_delay(9), Duration::from_millis(300));
    }

    #[test]
    fn attempt_budget_exhausts_after_num_reconnect_failures() {
        let mut backoff = cfg(10, 100, 2.0, false);
        backoff.num_reconnect = 3;
        let policy = BackoffPolicy::new(&backoff);
        let mut attempt = ReconnectAttempt::default();

        assert_eq!(
            attempt.record_failure(&policy),
            RetryPlan::RetryAfter(Duration::from_millis(10))
        );
        assert_eq!(
            attempt.record_failure(&policy),
            RetryPlan::RetryAfter(Duration::from_millis(20))
        );
        assert_eq!(attempt.record_failure(&policy), RetryPlan::Exhausted);
        assert_eq!(attempt.failed(), 3);

        attempt.reset();
        assert_eq!(attempt.failed(), 0);
        assert_eq!(attempt.after_drop(&policy), Duration::from_millis(10));
    }

    #[test]
    fn zero_num_reconnect_retries_forever() {
        let policy = BackoffPolicy::new(&cfg(1, 2, 2.0, false));
        let mut attempt = ReconnectAttempt::default();
        for _ in 0..1_000 {
            assert!(matches!(
                attempt.record_failure(&policy),
                RetryPlan::RetryAfter(_)
            ));
        }
    }
}
