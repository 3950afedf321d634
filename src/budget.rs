use std::time::Duration;

/// Remaining validity of a lock after a fan-out round, in milliseconds.
///
/// `ttl_ms - elapsed_ms - (ttl_ms * drift_factor + fixed_slack_ms)`. The
/// proportional drift is truncated toward zero. A result `<= 0` means the
/// round consumed the whole budget.
pub fn remaining_validity_ms(ttl_ms: i64, elapsed_ms: i64, drift_factor: f64, fixed_slack_ms: i64) -> i64 {
    let drift = (ttl_ms as f64 * drift_factor) as i64 + fixed_slack_ms;
    ttl_ms - elapsed_ms - drift
}

/// Drift-adjusted validity accounting for one coordinator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeBudget {
    drift_factor: f64,
    fixed_slack: Duration,
}

impl TimeBudget {
    pub fn new(drift_factor: f64, fixed_slack: Duration) -> Self {
        Self { drift_factor, fixed_slack }
    }

    pub fn drift_ms(&self, ttl: Duration) -> i64 {
        (millis(ttl) as f64 * self.drift_factor) as i64 + millis(self.fixed_slack)
    }

    pub fn remaining_ms(&self, ttl: Duration, elapsed: Duration) -> i64 {
        remaining_validity_ms(millis(ttl), millis(elapsed), self.drift_factor, millis(self.fixed_slack))
    }

    /// The validity left after `elapsed`, or `None` once it is exhausted.
    pub fn validity(&self, ttl: Duration, elapsed: Duration) -> Option<Duration> {
        let remaining = self.remaining_ms(ttl, elapsed);
        (remaining > 0).then(|| Duration::from_millis(remaining as u64))
    }
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}
