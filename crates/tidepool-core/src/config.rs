//! Pool and manager configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default idle timeout before an above-minimum connection is closed.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Default base delay for connect backoff.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(100);

/// Default cap for connect backoff delays.
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Configuration for a single pool instance.
///
/// Immutable once the pool is constructed. The soft limit is a preferred
/// ceiling that sizing decisions aim for; the hard limit is never exceeded,
/// counting in-flight connection attempts as well as live connections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of connections the pool keeps open even without demand.
    pub min_connections: usize,
    /// Preferred ceiling on the connection count.
    pub soft_max_connections: usize,
    /// Absolute ceiling on the connection count.
    pub hard_max_connections: usize,
    /// How long a connection above the minimum may sit idle before it is
    /// closed.
    pub idle_timeout: Duration,
    /// Retry policy for failed connection attempts.
    pub backoff: BackoffConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 0,
            soft_max_connections: 10,
            hard_max_connections: 10,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            backoff: BackoffConfig::default(),
        }
    }
}

impl PoolConfig {
    /// Create a configuration with the given hard connection limit.
    #[must_use]
    pub fn new(hard_max_connections: usize) -> Self {
        Self {
            soft_max_connections: hard_max_connections,
            hard_max_connections,
            ..Default::default()
        }
    }

    /// Set the minimum connection count.
    #[must_use]
    pub fn min_connections(mut self, min: usize) -> Self {
        self.min_connections = min;
        self
    }

    /// Set the soft connection limit.
    #[must_use]
    pub fn soft_max_connections(mut self, soft: usize) -> Self {
        self.soft_max_connections = soft;
        self
    }

    /// Set the idle timeout.
    #[must_use]
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set the backoff policy.
    #[must_use]
    pub fn backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Validate limit relationships.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hard_max_connections == 0 {
            return Err(ConfigError::ZeroHardLimit);
        }
        if self.soft_max_connections > self.hard_max_connections {
            return Err(ConfigError::SoftAboveHard {
                soft: self.soft_max_connections,
                hard: self.hard_max_connections,
            });
        }
        if self.min_connections > self.hard_max_connections {
            return Err(ConfigError::MinimumAboveHard {
                min: self.min_connections,
                hard: self.hard_max_connections,
            });
        }
        Ok(())
    }
}

/// Retry policy for failed connection attempts.
///
/// Delays grow exponentially per attempt, are capped at `max_delay`, and are
/// stretched by a random jitter of up to `jitter_factor` to avoid thundering
/// herds. When the pool is below its minimum or requests are waiting, retries
/// are scheduled eagerly at `base_delay` without exponential growth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Exponential growth factor applied per failed attempt.
    pub multiplier: f64,
    /// Upper bound on the computed delay.
    pub max_delay: Duration,
    /// Random jitter fraction (0.0 - 1.0) applied on top of the delay.
    pub jitter_factor: f64,
    /// Attempt budget per connection slot. `None` retries indefinitely.
    pub max_attempts: Option<u32>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_BACKOFF_BASE,
            multiplier: 2.0,
            max_delay: DEFAULT_BACKOFF_MAX,
            jitter_factor: 0.1,
            max_attempts: None,
        }
    }
}

impl BackoffConfig {
    /// A deterministic policy with no jitter, useful in tests.
    #[must_use]
    pub fn without_jitter(mut self) -> Self {
        self.jitter_factor = 0.0;
        self
    }
}

/// Configuration for a multi-executor pool manager.
///
/// The limits are global; [`ManagerConfig::shard_config`] splits them evenly
/// across shards, handing the remainder to the lowest-indexed shards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Global minimum connection count.
    pub min_connections: usize,
    /// Global soft connection limit.
    pub soft_max_connections: usize,
    /// Global hard connection limit.
    pub hard_max_connections: usize,
    /// Idle timeout applied to every shard.
    pub idle_timeout: Duration,
    /// Backoff policy applied to every shard.
    pub backoff: BackoffConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            min_connections: 0,
            soft_max_connections: 10,
            hard_max_connections: 10,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            backoff: BackoffConfig::default(),
        }
    }
}

impl ManagerConfig {
    /// Create a configuration with the given global hard limit.
    #[must_use]
    pub fn new(hard_max_connections: usize) -> Self {
        Self {
            soft_max_connections: hard_max_connections,
            hard_max_connections,
            ..Default::default()
        }
    }

    /// Set the global minimum connection count.
    #[must_use]
    pub fn min_connections(mut self, min: usize) -> Self {
        self.min_connections = min;
        self
    }

    /// Set the global soft connection limit.
    #[must_use]
    pub fn soft_max_connections(mut self, soft: usize) -> Self {
        self.soft_max_connections = soft;
        self
    }

    /// Set the idle timeout.
    #[must_use]
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set the backoff policy.
    #[must_use]
    pub fn backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Validate limit relationships.
    pub fn validate(&self) -> Result<(), ConfigError> {
        PoolConfig {
            min_connections: self.min_connections,
            soft_max_connections: self.soft_max_connections,
            hard_max_connections: self.hard_max_connections,
            idle_timeout: self.idle_timeout,
            backoff: self.backoff.clone(),
        }
        .validate()
    }

    /// Derive the configuration of one shard out of `shard_count`.
    ///
    /// Limits divide evenly; the remainder goes to the lowest-indexed
    /// shards, one extra each. A shard whose share of the hard limit would
    /// be zero is still given one connection so every shard stays usable.
    #[must_use]
    pub fn shard_config(&self, shard: usize, shard_count: usize) -> PoolConfig {
        let hard = split_share(self.hard_max_connections, shard, shard_count).max(1);
        let soft = split_share(self.soft_max_connections, shard, shard_count)
            .clamp(1, hard);
        let min = split_share(self.min_connections, shard, shard_count).min(hard);
        PoolConfig {
            min_connections: min,
            soft_max_connections: soft,
            hard_max_connections: hard,
            idle_timeout: self.idle_timeout,
            backoff: self.backoff.clone(),
        }
    }
}

/// Even split of `total` across `count` shards, remainder to low indexes.
fn split_share(total: usize, shard: usize, count: usize) -> usize {
    debug_assert!(count > 0);
    total / count + usize::from(shard < total % count)
}
