//! Jittered exponential backoff.

use std::time::Duration;

/// Retry delay policy shared by reconnects and mutation retries.
///
/// `delay(attempt) = floor((capped + r * capped) / 2)` with
/// `capped = min(base * 2^attempt, cap)` and `r` uniform in `[0, 1)`, so
/// every delay lies in `[capped / 2, capped)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    /// Delay unit before doubling.
    pub base: Duration,
    /// Upper bound on the exponential term.
    pub cap: Duration,
}

impl Backoff {
    /// Creates a policy with the given base and cap.
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    /// Delay before retry number `attempt`, with random jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with(attempt, rand::random::<f64>())
    }

    /// Delay before retry number `attempt` for an explicit jitter draw in
    /// `[0, 1)`.
    pub fn delay_with(&self, attempt: u32, unit: f64) -> Duration {
        let capped = self.capped_millis(attempt) as f64;
        let unit = if unit.is_finite() {
            unit.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Duration::from_millis(((capped + unit * capped) / 2.0).floor() as u64)
    }

    fn capped_millis(&self, attempt: u32) -> u64 {
        let base = u64::try_from(self.base.as_millis()).unwrap_or(u64::MAX);
        let cap = u64::try_from(self.cap.as_millis()).unwrap_or(u64::MAX);
        base.saturating_mul(2u64.saturating_pow(attempt)).min(cap)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(1_000), Duration::from_millis(30_000))
    }
}
