//! Small helpers shared across the core.

use crate::config::ServerConfig;
use crate::server::GameServer;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Shortest period a maintenance loop will tick at.
pub const MIN_TICK_PERIOD: Duration = Duration::from_millis(1);

/// Creates a server with default configuration.
pub fn create_server() -> Arc<GameServer> {
    GameServer::new(ServerConfig::default())
}

/// Creates a server with the given configuration.
pub fn create_server_with_config(config: ServerConfig) -> Arc<GameServer> {
    GameServer::new(config)
}

/// Current unix time in milliseconds.
pub fn current_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Period for a background `interval`, which panics on zero.
pub(crate) fn tick_period(what: &str, period: Duration) -> Duration {
    if period < MIN_TICK_PERIOD {
        warn!("{} interval {:?} is too short, using {:?}", what, period, MIN_TICK_PERIOD);
        return MIN_TICK_PERIOD;
    }
    period
}

/// Best-effort text of a panic captured by a tokio task.
pub(crate) fn panic_message(error: tokio::task::JoinError) -> String {
    match error.try_into_panic() {
        Ok(payload) => payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string()),
        Err(error) => error.to_string(),
    }
}
