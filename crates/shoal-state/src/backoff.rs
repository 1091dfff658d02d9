//! Exponential backoff shared by launch and registration retries.

use std::time::Duration;

/// Doubling backoff with a ceiling.
///
/// `delay(1)` is the base delay, each further attempt doubles it until
/// `max` is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    pub const fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay to wait after the `attempt`-th consecutive failure (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Epoch-millisecond timestamp at which the next attempt may run.
    pub fn next_attempt_at(&self, now_ms: u64, attempt: u32) -> u64 {
        now_ms.saturating_add(self.delay(attempt).as_millis() as u64)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_cap() {
        let b = Backoff::default();
        let secs: Vec<u64> = (1..=8).map(|a| b.delay(a).as_secs()).collect();
        // 1 → 2 → 4 → 8 → 16 → 32 → 60 → 60
        assert_eq!(secs, vec![1, 2, 4, 8, 16, 32, 60, 60]);
    }

    #[test]
    fn huge_attempt_counts_saturate() {
        let b = Backoff::default();
        assert_eq!(b.delay(200), Duration::from_secs(60));
        assert_eq!(b.delay(0), Duration::ZERO);
    }

    #[test]
    fn next_attempt_is_offset_from_now() {
        let b = Backoff::new(Duration::from_millis(250), Duration::from_secs(5));
        assert_eq!(b.next_attempt_at(10_000, 1), 10_250);
        assert_eq!(b.next_attempt_at(10_000, 3), 11_000);
    }
}
