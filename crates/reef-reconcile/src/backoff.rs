//! Bounded exponential backoff with jitter for pending-cleanup retries.
//!
//! Agent errors and timeouts against a node the registry lists as
//! reachable are rescheduled through [`Backoff`]; entries waiting for an
//! unreachable node are replayed by the node's recovery event instead.

use rand::Rng;
use reef_types::ReconcileConfig;

/// Retry delay calculator.
///
/// The ceiling for attempt `n` (1-based) is `base * 2^(n-1)`, capped at
/// `max`. The actual delay is drawn uniformly from `[ceiling / 2, ceiling]`
/// so entries that failed together do not retry in lockstep.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base_ms: u64,
    max_ms: u64,
}

impl Backoff {
    /// Create a backoff with the given base and cap, in milliseconds.
    pub fn new(base_ms: u64, max_ms: u64) -> Self {
        let base_ms = base_ms.max(1);
        Self {
            base_ms,
            max_ms: max_ms.max(base_ms),
        }
    }

    /// Backoff configured from a [`ReconcileConfig`].
    pub fn from_config(config: &ReconcileConfig) -> Self {
        Self::new(config.retry_base_ms, config.retry_max_ms)
    }

    /// Upper bound of the delay after `attempts` failures.
    pub fn ceiling_ms(&self, attempts: u32) -> u64 {
        let exponent = attempts.saturating_sub(1).min(32);
        self.base_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_ms)
    }

    /// Jittered delay after `attempts` failures.
    pub fn delay_ms(&self, attempts: u32) -> u64 {
        let ceiling = self.ceiling_ms(attempts);
        let floor = ceiling / 2;
        if floor >= ceiling {
            return ceiling;
        }
        rand::rng().random_range(floor..=ceiling)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ceiling_doubles() {
        let backoff = Backoff::new(100, 10_000);
        assert_eq!(backoff.ceiling_ms(1), 100);
        assert_eq!(backoff.ceiling_ms(2), 200);
        assert_eq!(backoff.ceiling_ms(3), 400);
    }

    #[test]
    fn test_ceiling_capped() {
        let backoff = Backoff::new(100, 1_000);
        assert_eq!(backoff.ceiling_ms(10), 1_000);
        assert_eq!(backoff.ceiling_ms(u32::MAX), 1_000);
    }

    #[test]
    fn test_delay_within_jitter_window() {
        let backoff = Backoff::new(100, 60_000);
        for attempts in 1..12 {
            let ceiling = backoff.ceiling_ms(attempts);
            for _ in 0..50 {
                let delay = backoff.delay_ms(attempts);
                assert!(delay >= ceiling / 2 && delay <= ceiling, "{delay} outside window");
            }
        }
    }

    #[test]
    fn test_degenerate_config() {
        let backoff = Backoff::new(0, 0);
        assert_eq!(backoff.ceiling_ms(1), 1);
        assert!(backoff.delay_ms(1) <= 1);
    }

    #[test]
    fn test_from_config() {
        let backoff = Backoff::from_config(&ReconcileConfig::default());
        assert_eq!(backoff.ceiling_ms(1), 500);
        assert_eq!(backoff.ceiling_ms(100), 60_000);
    }
}
