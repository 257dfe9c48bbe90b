//! Configuration management for the realm server.
//!
//! This module handles loading, validation, and conversion of server
//! configuration from TOML files. Every section and field is optional in the
//! file; anything missing falls back to the defaults below.

use anyhow::{Context, Result};
use realm_core::config::{BreakerConfig, RateLimitConfig, SessionConfig, StateConfig};
use realm_core::ServerConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Application configuration loaded from TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Process-level settings
    pub server: ServerSettings,
    /// Session lifecycle settings
    pub sessions: SessionSettings,
    /// Per-client rate limiting
    pub rate_limit: RateLimitSettings,
    /// Settings shared by every circuit breaker
    pub circuit_breaker: BreakerSettings,
    /// State container settings
    pub state: StateSettings,
    /// Logging configuration settings
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Name shown in logs
    pub name: String,
    /// Seconds between health summaries in the log (0 to disable)
    pub health_interval_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            name: "realm".to_string(),
            health_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Idle seconds before an unreferenced session is evicted
    pub timeout_secs: u64,
    /// Seconds between reaper sweeps
    pub cleanup_interval_secs: u64,
    /// Outbound messages buffered per session
    pub outbound_queue_capacity: usize,
    /// Milliseconds a send waits on a full queue
    pub send_timeout_ms: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 30 * 60,
            cleanup_interval_secs: 60,
            outbound_queue_capacity: 256,
            send_timeout_ms: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub requests_per_second: f64,
    pub burst: u32,
    /// Seconds between idle-bucket sweeps
    pub cleanup_interval_secs: u64,
    /// Retry hint given to throttled clients, in seconds
    pub retry_after_secs: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            requests_per_second: 10.0,
            burst: 20,
            cleanup_interval_secs: 60,
            retry_after_secs: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    pub max_failures: u32,
    /// Seconds an open breaker waits before admitting trial calls
    pub open_timeout_secs: u64,
    pub max_half_open_trials: u32,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            max_failures: 5,
            open_timeout_secs: 30,
            max_half_open_trials: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateSettings {
    /// Deadline for one state update, in milliseconds
    pub update_timeout_ms: u64,
}

impl Default for StateSettings {
    fn default() -> Self {
        Self {
            update_timeout_ms: 5_000,
        }
    }
}

/// Logging system configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log level filter (trace, debug, info, warn, error)
    pub level: String,
    /// Whether to output logs in JSON format
    pub json_format: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

impl AppConfig {
    /// Loads configuration from a TOML file.
    ///
    /// If the file doesn't exist, writes the default configuration to that
    /// path and returns it.
    pub async fn load_from_file(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            let config: AppConfig =
                toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
            Ok(config)
        } else {
            let default_config = AppConfig::default();
            let toml_content = toml::to_string_pretty(&default_config)?;
            tokio::fs::write(path, toml_content)
                .await
                .with_context(|| format!("writing {}", path.display()))?;
            info!("Created default configuration file: {}", path.display());
            Ok(default_config)
        }
    }

    /// Converts the file settings into the core's typed configuration.
    pub fn to_server_config(&self) -> ServerConfig {
        ServerConfig {
            sessions: SessionConfig {
                timeout: Duration::from_secs(self.sessions.timeout_secs),
                cleanup_interval: Duration::from_secs(self.sessions.cleanup_interval_secs),
                outbound_queue_capacity: self.sessions.outbound_queue_capacity,
                send_timeout: Duration::from_millis(self.sessions.send_timeout_ms),
            },
            rate_limit: RateLimitConfig {
                requests_per_second: self.rate_limit.requests_per_second,
                burst: self.rate_limit.burst,
                cleanup_interval: Duration::from_secs(self.rate_limit.cleanup_interval_secs),
                retry_after: Duration::from_secs(self.rate_limit.retry_after_secs),
            },
            circuit_breaker: BreakerConfig {
                max_failures: self.circuit_breaker.max_failures,
                open_timeout: Duration::from_secs(self.circuit_breaker.open_timeout_secs),
                max_half_open_trials: self.circuit_breaker.max_half_open_trials,
            },
            state: StateConfig {
                update_timeout: Duration::from_millis(self.state.update_timeout_ms),
            },
        }
    }

    /// Validates the configuration for consistency and correctness.
    ///
    /// # Returns
    ///
    /// `Ok(())` if the configuration is valid, or an error string describing the issue.
    pub fn validate(&self) -> Result<(), String> {
        if self.sessions.timeout_secs == 0 {
            return Err("Session timeout must be greater than zero".to_string());
        }
        if self.sessions.cleanup_interval_secs == 0 {
            return Err("Session cleanup interval must be greater than zero".to_string());
        }
        if self.sessions.outbound_queue_capacity == 0 {
            return Err("Outbound queue capacity must be greater than zero".to_string());
        }

        let rps = self.rate_limit.requests_per_second;
        if !rps.is_finite() || rps <= 0.0 {
            return Err(format!("Invalid requests_per_second: {rps}"));
        }
        if self.rate_limit.burst == 0 {
            return Err("Rate limit burst must be at least 1".to_string());
        }
        if self.rate_limit.cleanup_interval_secs == 0 {
            return Err("Rate limit cleanup interval must be greater than zero".to_string());
        }

        if self.circuit_breaker.max_failures == 0 {
            return Err("Circuit breaker max_failures must be at least 1".to_string());
        }
        if self.circuit_breaker.max_half_open_trials == 0 {
            return Err("Circuit breaker max_half_open_trials must be at least 1".to_string());
        }

        if self.state.update_timeout_ms == 0 {
            return Err("State update timeout must be greater than zero".to_string());
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(format!(
                "Invalid log level: {}. Must be one of: {valid_levels:?}",
                &self.logging.level
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{NamedTempFile, TempDir};
    use tokio::fs;

    #[test]
    fn test_app_config_default() {
        let config = AppConfig::default();

        assert_eq!(config.server.name, "realm");
        assert_eq!(config.sessions.timeout_secs, 1800);
        assert_eq!(config.sessions.send_timeout_ms, 50);
        assert_eq!(config.rate_limit.burst, 20);
        assert_eq!(config.circuit_breaker.max_half_open_trials, 3);
        assert_eq!(config.state.update_timeout_ms, 5_000);
        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.json_format);
        assert!(config.validate().is_ok());
    }

    #[tokio::test]
    async fn test_load_from_nonexistent_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");

        let config = AppConfig::load_from_file(&path).await.unwrap();
        assert_eq!(config.sessions.timeout_secs, 1800);
        assert!(path.exists());

        // The written file must load back to the same values.
        let reloaded = AppConfig::load_from_file(&path).await.unwrap();
        assert_eq!(reloaded.rate_limit.burst, config.rate_limit.burst);
    }

    #[tokio::test]
    async fn test_load_from_existing_file() {
        let toml_content = r#"
[server]
name = "shard-7"

[sessions]
timeout_secs = 600
send_timeout_ms = 20

[rate_limit]
requests_per_second = 2.0
burst = 3

[circuit_breaker]
open_timeout_secs = 5

[logging]
level = "debug"
json_format = true
"#;

        let temp_file = NamedTempFile::new().unwrap();
        fs::write(temp_file.path(), toml_content).await.unwrap();

        let config = AppConfig::load_from_file(temp_file.path()).await.unwrap();
        assert_eq!(config.server.name, "shard-7");
        assert_eq!(config.sessions.timeout_secs, 600);
        assert_eq!(config.sessions.send_timeout_ms, 20);
        // Unset fields keep their defaults.
        assert_eq!(config.sessions.cleanup_interval_secs, 60);
        assert_eq!(config.rate_limit.burst, 3);
        assert_eq!(config.circuit_breaker.max_failures, 5);
        assert_eq!(config.state.update_timeout_ms, 5_000);
        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.json_format);
    }

    #[tokio::test]
    async fn test_load_rejects_malformed_file() {
        let temp_file = NamedTempFile::new().unwrap();
        fs::write(temp_file.path(), "[sessions]\ntimeout_secs = \"soon\"\n")
            .await
            .unwrap();
        assert!(AppConfig::load_from_file(temp_file.path()).await.is_err());
    }

    #[test]
    fn test_to_server_config_conversion() {
        let mut app_config = AppConfig::default();
        app_config.sessions.timeout_secs = 120;
        app_config.rate_limit.cleanup_interval_secs = 10;
        app_config.circuit_breaker.open_timeout_secs = 7;
        app_config.state.update_timeout_ms = 250;

        let server_config = app_config.to_server_config();
        assert_eq!(server_config.sessions.timeout, Duration::from_secs(120));
        assert_eq!(server_config.sessions.send_timeout, Duration::from_millis(50));
        assert_eq!(server_config.rate_limit.max_age(), Duration::from_secs(50));
        assert_eq!(server_config.rate_limit.retry_after, Duration::from_secs(1));
        assert_eq!(server_config.circuit_breaker.open_timeout, Duration::from_secs(7));
        assert_eq!(server_config.state.update_timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_validation_rejects_zero_durations() {
        let mut config = AppConfig::default();
        config.sessions.timeout_secs = 0;
        assert!(config.validate().unwrap_err().contains("Session timeout"));

        let mut config = AppConfig::default();
        config.state.update_timeout_ms = 0;
        assert!(config.validate().unwrap_err().contains("State update timeout"));
    }

    #[test]
    fn test_validation_rejects_bad_rate() {
        for rps in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let mut config = AppConfig::default();
            config.rate_limit.requests_per_second = rps;
            assert!(config.validate().is_err(), "rate {rps} should be rejected");
        }

        let mut config = AppConfig::default();
        config.rate_limit.burst = 0;
        assert!(config.validate().unwrap_err().contains("burst"));
    }

    #[test]
    fn test_validation_breaker_limits() {
        let mut config = AppConfig::default();
        config.circuit_breaker.max_half_open_trials = 0;
        assert!(config.validate().unwrap_err().contains("max_half_open_trials"));
    }

    #[test]
    fn test_validation_log_levels() {
        for level in ["trace", "debug", "info", "warn", "error"] {
            let mut config = AppConfig::default();
            config.logging.level = level.to_string();
            assert!(config.validate().is_ok(), "Level '{}' should be valid", level);
        }

        let mut config = AppConfig::default();
        config.logging.level = "invalid_level".to_string();
        assert!(config.validate().unwrap_err().contains("Invalid log level"));
    }
}
