//! Retry delays after transient failures.

use std::time::Duration;

use rand::Rng;
use serde::Deserialize;

/// Exponential backoff with additive jitter.
///
/// Jitter is kept below half of the growth between two consecutive steps,
/// so the delay for `k + 1` failures is always longer than the delay for
/// `k` until both reach `max_delay`.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Must be greater than 1.
    pub multiplier: f64,
    pub jitter: bool,
    /// Failures after which polling falls back to the normal interval.
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: true,
            max_attempts: 5,
        }
    }
}

/// Backoff settings as they appear in the gateway configuration file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub jitter: bool,
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self { initial_delay_ms: 1_000, max_delay_ms: 60_000, multiplier: 2.0, jitter: true, max_attempts: 5 }
    }
}

impl From<&BackoffConfig> for BackoffPolicy {
    fn from(config: &BackoffConfig) -> Self {
        Self {
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            multiplier: config.multiplier,
            jitter: config.jitter,
            max_attempts: config.max_attempts,
        }
    }
}

impl BackoffPolicy {
    /// Delay before the retry that follows `failures` consecutive failures.
    pub fn delay_for(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let initial = self.initial_delay.as_secs_f64();
        let max = self.max_delay.as_secs_f64();
        let multiplier = self.multiplier.max(1.0);

        let base = (initial * multiplier.powi(failures.saturating_sub(1).min(i32::MAX as u32) as i32)).min(max);
        let spread = base * (multiplier - 1.0) / 2.0;
        let jitter = if self.jitter && spread > 0.0 {
            rand::thread_rng().gen_range(0.0..spread)
        } else {
            0.0
        };
        Duration::from_secs_f64((base + jitter).min(max))
    }

    /// Time until the next poll after `failures` consecutive transient failures.
    ///
    /// Past `max_attempts` the device is simply polled at its normal interval.
    pub fn next_delay(&self, failures: u32, poll_interval: Duration) -> Duration {
        if failures == 0 || failures > self.max_attempts {
            poll_interval
        } else {
            self.delay_for(failures)
        }
    }
}

#[test]
fn test_delay_strictly_increases_until_cap() {
    let policy = BackoffPolicy {
        initial_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(30),
        multiplier: 2.0,
        jitter: true,
        max_attempts: 10,
    };
    for _ in 0..50 {
        // 100ms * 2^8 = 25.6s is the last step below the cap
        for k in 1..9 {
            assert!(policy.delay_for(k + 1) > policy.delay_for(k), "k = {k}");
        }
    }
}

#[test]
fn test_delay_is_capped() {
    let policy = BackoffPolicy { max_delay: Duration::from_secs(10), ..Default::default() };
    for k in 1..40 {
        assert!(policy.delay_for(k) <= Duration::from_secs(10));
    }
    assert_eq!(policy.delay_for(30), Duration::from_secs(10));
}

#[test]
fn test_without_jitter_is_exact() {
    let policy = BackoffPolicy { jitter: false, ..Default::default() };
    assert_eq!(policy.delay_for(0), Duration::ZERO);
    assert_eq!(policy.delay_for(1), Duration::from_secs(1));
    assert_eq!(policy.delay_for(2), Duration::from_secs(2));
    assert_eq!(policy.delay_for(4), Duration::from_secs(8));
}

#[test]
fn test_falls_back_to_poll_interval() {
    let policy = BackoffPolicy { jitter: false, max_attempts: 3, ..Default::default() };
    let interval = Duration::from_secs(30);
    assert_eq!(policy.next_delay(0, interval), interval);
    assert_eq!(policy.next_delay(3, interval), Duration::from_secs(4));
    assert_eq!(policy.next_delay(4, interval), interval);
}
