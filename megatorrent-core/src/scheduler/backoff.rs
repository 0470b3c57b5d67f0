//! Refresh and retry delays.

use std::time::Duration;

use crate::config::{MAX_SCHEDULE_DELAY, SchedulerConfig};
use crate::resolver::FailureKind;

/// Computes when a subscription should next be attempted.
///
/// Failures back off exponentially from `retry_base`, scaled by failure
/// severity and capped at `retry_max`. Successes return to the plain
/// refresh interval. Both are jittered by `jitter_ratio` in either
/// direction so that many feeds do not retry in lockstep. No delay ever
/// exceeds [`MAX_SCHEDULE_DELAY`].
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub refresh_interval: Duration,
    pub retry_base: Duration,
    pub retry_max: Duration,
    pub jitter_ratio: f64,
}

impl BackoffPolicy {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            refresh_interval: config.refresh_interval.min(MAX_SCHEDULE_DELAY),
            retry_base: config.retry_base.min(MAX_SCHEDULE_DELAY),
            retry_max: config.retry_max.min(MAX_SCHEDULE_DELAY),
            jitter_ratio: config.jitter_ratio.clamp(0.0, 1.0),
        }
    }

    /// Delay after a verified resolution.
    pub fn refresh_delay(&self) -> Duration {
        self.jittered(self.refresh_interval)
    }

    /// Delay after the `failures`-th consecutive failure.
    pub fn failure_delay(&self, failures: u32, kind: FailureKind) -> Duration {
        self.jittered(self.base_failure_delay(failures, kind))
    }

    /// Unjittered failure delay.
    pub fn base_failure_delay(&self, failures: u32, kind: FailureKind) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        let base_ms = u64::try_from(self.retry_base.as_millis()).unwrap_or(u64::MAX);
        let delay_ms = base_ms
            .saturating_mul(2_u64.pow(exponent))
            .saturating_mul(u64::from(kind.severity()));
        let max_ms = u64::try_from(self.retry_max.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(delay_ms.min(max_ms))
    }

    fn jittered(&self, delay: Duration) -> Duration {
        let delay = delay.min(MAX_SCHEDULE_DELAY);
        if self.jitter_ratio <= 0.0 || delay.is_zero() {
            return delay;
        }
        let spread = rand::random::<f64>() * 2.0 - 1.0;
        let factor = (1.0 + spread * self.jitter_ratio.min(1.0)).max(0.0);
        delay.mul_f64(factor).min(MAX_SCHEDULE_DELAY)
    }
}
