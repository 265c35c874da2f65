use crate::errors::ExecutionError;
use crate::model::RetrySettings;
use rand::Rng;
use std::time::Duration;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 2;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(120);
pub const DEFAULT_SOFT_TIME_LIMIT: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_HARD_TIME_LIMIT: Duration = Duration::from_secs(10 * 60);

/// Bounded retry policy carried by every submitted unit.
///
/// The soft limit bounds one attempt; exceeding it fails the unit without a
/// further attempt. The hard limit bounds the whole unit, scoring included.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub soft_time_limit: Duration,
    pub hard_time_limit: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            soft_time_limit: DEFAULT_SOFT_TIME_LIMIT,
            hard_time_limit: DEFAULT_HARD_TIME_LIMIT,
            jitter: true,
        }
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(s: &RetrySettings) -> Self {
        let d = RetryPolicy::default();
        let soft_time_limit = s
            .soft_time_limit_secs
            .map(Duration::from_secs)
            .unwrap_or(d.soft_time_limit);
        // soft can never outlive hard
        let hard_time_limit = s
            .hard_time_limit_secs
            .map(Duration::from_secs)
            .unwrap_or(d.hard_time_limit)
            .max(soft_time_limit);
        Self {
            max_attempts: s.max_attempts.unwrap_or(d.max_attempts).max(1),
            base_delay: s.base_delay_ms.map(Duration::from_millis).unwrap_or(d.base_delay),
            max_delay: s.max_delay_secs.map(Duration::from_secs).unwrap_or(d.max_delay),
            soft_time_limit,
            hard_time_limit,
            jitter: s.jitter.unwrap_or(d.jitter),
        }
    }
}

impl RetryPolicy {
    /// Policy with no waiting between attempts; used by tests and dry runs.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: false,
            ..Self::default()
        }
    }

    /// Whether attempt number `attempt_no` (1-based) may be followed by another.
    pub fn should_retry(&self, attempt_no: u32, err: &ExecutionError) -> bool {
        err.is_retryable() && attempt_no < self.max_attempts
    }

    /// Delay before the attempt following `attempt_no`.
    ///
    /// Exponential from `base_delay`, capped at `max_delay`. With jitter the
    /// delay is drawn uniformly from the upper half of that window.
    pub fn backoff(&self, attempt_no: u32) -> Duration {
        let exp = attempt_no.saturating_sub(1).min(31);
        let capped = self
            .base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay);
        if !self.jitter || capped.is_zero() {
            return capped;
        }
        let ms = capped.as_millis() as u64;
        let low = ms / 2;
        Duration::from_millis(rand::thread_rng().gen_range(low..=ms))
    }
}
