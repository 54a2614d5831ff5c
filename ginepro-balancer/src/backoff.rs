//! Exponential backoff with jitter.

use std::time::Duration;

/// Parameters of the exponential backoff applied between connection attempts
/// and between re-resolutions.
///
/// The delay before retry `n` is `min(base_delay * multiplier^n, max_delay)`,
/// randomised by `±jitter`.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    pub base_delay: Duration,
    pub multiplier: f64,
    /// Relative randomisation, `0.2` spreads delays over ±20%.
    pub jitter: f64,
    pub max_delay: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            multiplier: 1.6,
            jitter: 0.2,
            max_delay: Duration::from_secs(120),
        }
    }
}

impl BackoffConfig {
    /// How long to wait before retry number `retries` (starting at zero).
    pub fn backoff(&self, retries: u32) -> Duration {
        if retries == 0 {
            return self.base_delay;
        }

        let max = self.max_delay.as_secs_f64();
        let mut backoff = self.base_delay.as_secs_f64();
        let mut remaining = retries;
        while backoff < max && remaining > 0 {
            backoff *= self.multiplier;
            remaining -= 1;
        }
        backoff = backoff.min(max);

        // Spread over [1 - jitter, 1 + jitter).
        backoff *= 1.0 + self.jitter * (fastrand::f64() * 2.0 - 1.0);
        if !backoff.is_finite() || backoff < 0.0 {
            return Duration::ZERO;
        }
        Duration::try_from_secs_f64(backoff).unwrap_or(self.max_delay)
    }
}
