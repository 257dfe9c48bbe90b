//! Logging system setup and configuration
//!
//! Installs the global `tracing` subscriber. `RUST_LOG` takes precedence over
//! the configured level when set.

use anyhow::Result;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingSettings;

/// Filter honouring `RUST_LOG`, falling back to `level`.
fn filter_for(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Initialize the logging system
///
/// Fails if a global subscriber is already installed.
pub fn setup_logging(settings: &LoggingSettings) -> Result<()> {
    let registry = tracing_subscriber::registry().with(filter_for(&settings.level));

    if settings.json_format {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(false)
                    .with_thread_ids(true)
                    .with_thread_names(true),
            )
            .try_init()?;
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(true)
                    .with_thread_names(true),
            )
            .try_init()?;
    }

    tracing::info!("🔧 Logging initialized with level: {}", settings.level);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_fails() {
        let settings = LoggingSettings::default();
        // Whichever call runs first in this process wins; later ones must error
        // rather than panic.
        let _ = setup_logging(&settings);
        assert!(setup_logging(&settings).is_err());
    }
}
