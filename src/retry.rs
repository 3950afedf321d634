use std::time::Duration;

use rand::Rng;

pub const DEFAULT_RETRY_COUNT: u32 = 3;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(200);

/// How many extra rounds a coordinator call may take and how long to wait
/// between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retry_count: u32,
    pub retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_count: DEFAULT_RETRY_COUNT,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn new(retry_count: u32, retry_delay: Duration) -> Self {
        Self { retry_count, retry_delay }
    }

    pub fn max_attempts(&self) -> u32 {
        self.retry_count.saturating_add(1)
    }

    /// A uniformly random delay in `[retry_delay / 2, retry_delay]`.
    pub fn backoff(&self) -> Duration {
        let max = self.retry_delay.as_millis() as u64;
        let min = max / 2;
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }

    pub fn schedule(&self) -> RetrySchedule {
        RetrySchedule {
            policy: *self,
            started: 0,
        }
    }
}

/// Per-call attempt counter.
///
/// `next_attempt` hands out `retry_count + 1` attempts; `backoff` returns a
/// delay only while another attempt remains, so no caller sleeps after its
/// final round.
#[derive(Debug)]
pub struct RetrySchedule {
    policy: RetryPolicy,
    started: u32,
}

impl RetrySchedule {
    pub fn next_attempt(&mut self) -> Option<u32> {
        if self.started >= self.policy.max_attempts() {
            return None;
        }
        self.started += 1;
        Some(self.started)
    }

    pub fn attempts(&self) -> u32 {
        self.started
    }

    pub fn has_remaining(&self) -> bool {
        self.started < self.policy.max_attempts()
    }

    pub fn backoff(&self) -> Option<Duration> {
        self.has_remaining().then(|| self.policy.backoff())
    }
}
