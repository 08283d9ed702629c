//! Reconnection delay policy

use std::time::Duration;

/// Capped exponential backoff between connection attempts.
///
/// The n-th consecutive failure waits `min(initial * 2^(n-1), max)`.
/// Reaching `warn_after` failures only raises the log level; the
/// watcher keeps retrying forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub warn_after: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(300),
            warn_after: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the next attempt after `failures` consecutive
    /// failures. Zero failures means no delay.
    #[must_use]
    pub fn delay(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(failures - 1).unwrap_or(u32::MAX);
        self.initial_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    /// Whether `failures` has reached the loud-warning threshold.
    #[must_use]
    pub const fn exhausted(&self, failures: u32) -> bool {
        failures >= self.warn_after
    }
}
