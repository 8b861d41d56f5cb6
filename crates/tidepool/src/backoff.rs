//! Connect-backoff delay policy.

use std::time::Duration;

use tidepool_core::BackoffConfig;

/// Computes retry delays for failed connection attempts.
///
/// Delays grow exponentially per attempt and are capped at the configured
/// maximum. A random jitter of up to `jitter_factor` stretches each delay so
/// that many pools recovering from the same outage do not reconnect in
/// lockstep.
#[derive(Debug, Clone)]
pub(crate) struct BackoffPolicy {
    config: BackoffConfig,
}

impl BackoffPolicy {
    pub(crate) fn new(config: BackoffConfig) -> Self {
        Self { config }
    }

    /// Delay before retrying after `attempt` consecutive failures
    /// (`attempt >= 1`).
    pub(crate) fn delay(&self, attempt: u32) -> Duration {
        let base_ms = self.config.base_delay.as_millis() as f64;
        let exponent = attempt.saturating_sub(1).min(32);
        let delay_ms = base_ms * self.config.multiplier.powi(exponent as i32);
        self.jittered(delay_ms)
    }

    /// Delay used when the pool is below its minimum or requests are
    /// waiting: the base delay with jitter, no exponential growth.
    pub(crate) fn eager_delay(&self) -> Duration {
        self.jittered(self.config.base_delay.as_millis() as f64)
    }

    /// Whether the attempt budget for one connection slot is spent.
    pub(crate) fn attempts_exhausted(&self, attempts: u32) -> bool {
        self.config
            .max_attempts
            .is_some_and(|budget| attempts >= budget)
    }

    fn jittered(&self, delay_ms: f64) -> Duration {
        let jitter = fastrand::f64() * self.config.jitter_factor;
        let stretched = delay_ms * (1.0 + jitter);
        let capped = stretched.min(self.config.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}
