//! Server configuration types and defaults.
//!
//! This module contains the runtime configuration consumed by the core. Every
//! field is already a typed value (`Duration`, counts); parsing and validating
//! user-facing settings is the binary's job.

use std::time::Duration;

/// Configuration structure for the game server.
///
/// Groups the settings of each background-maintained component plus the
/// state-update deadline.
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    /// Session lifecycle settings
    pub sessions: SessionConfig,

    /// Per-client rate limiting
    pub rate_limit: RateLimitConfig,

    /// Settings applied to every circuit breaker the server creates
    pub circuit_breaker: BreakerConfig,

    /// State container settings
    pub state: StateConfig,
}

/// Session registry settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Idle time after which an unreferenced session is evicted
    pub timeout: Duration,

    /// How often the reaper sweeps the registry
    pub cleanup_interval: Duration,

    /// Capacity of each session's outbound message queue
    pub outbound_queue_capacity: usize,

    /// How long a send waits on a full queue before dropping the message
    pub send_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30 * 60),
            cleanup_interval: Duration::from_secs(60),
            outbound_queue_capacity: 256,
            send_timeout: Duration::from_millis(50),
        }
    }
}

/// Token-bucket rate limiter settings.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Sustained refill rate in tokens per second
    pub requests_per_second: f64,

    /// Bucket capacity, i.e. the largest allowed burst
    pub burst: u32,

    /// How often idle buckets are swept
    pub cleanup_interval: Duration,

    /// Retry hint handed to rejected clients
    pub retry_after: Duration,
}

impl RateLimitConfig {
    /// Buckets idle this long are dropped by the cleanup sweep.
    pub fn max_age(&self) -> Duration {
        self.cleanup_interval * 5
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 10.0,
            burst: 20,
            cleanup_interval: Duration::from_secs(60),
            retry_after: Duration::from_secs(1),
        }
    }
}

/// Circuit breaker settings.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures that trip the breaker
    pub max_failures: u32,

    /// Time the breaker stays open before letting a trial call through
    pub open_timeout: Duration,

    /// Concurrent trial calls allowed while half-open; this many successes close the breaker
    pub max_half_open_trials: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: 5,
            open_timeout: Duration::from_secs(30),
            max_half_open_trials: 3,
        }
    }
}

/// State container settings.
#[derive(Debug, Clone)]
pub struct StateConfig {
    /// Deadline for the apply step of a single update
    pub update_timeout: Duration,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            update_timeout: Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.sessions.timeout, Duration::from_secs(1800));
        assert_eq!(config.sessions.send_timeout, Duration::from_millis(50));
        assert_eq!(config.rate_limit.burst, 20);
        assert_eq!(config.circuit_breaker.max_failures, 5);
        assert_eq!(config.circuit_breaker.max_half_open_trials, 3);
        assert_eq!(config.state.update_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_rate_limit_max_age() {
        let config = RateLimitConfig {
            cleanup_interval: Duration::from_millis(200),
            ..Default::default()
        };
        assert_eq!(config.max_age(), Duration::from_secs(1));
    }
}
