//! Main application entry point for the realm server
//!
//! Parses the CLI, loads configuration, starts the server core and its
//! background tasks, then runs until a shutdown signal arrives.

mod cli;
mod config;
mod logging;
mod signals;

use anyhow::{anyhow, Result};
use realm_core::GameServer;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tracing::info;

use cli::CliArgs;
use config::AppConfig;

/// Main application struct
pub struct Application {
    config: AppConfig,
    server: Arc<GameServer>,
}

impl Application {
    /// Loads configuration, applies CLI overrides and builds the server.
    pub async fn new(args: CliArgs) -> Result<Self> {
        // Load configuration first (before logging setup)
        let mut config = AppConfig::load_from_file(&args.config_path).await?;
        args.apply_to(&mut config);

        config
            .validate()
            .map_err(|e| anyhow!("Configuration validation failed: {e}"))?;

        logging::setup_logging(&config.logging)?;
        display_banner(&config.server.name);

        let server = GameServer::new(config.to_server_config());
        info!("📂 Config: {}", args.config_path.display());

        Ok(Self { config, server })
    }

    /// Runs until SIGINT/SIGTERM, then shuts the server down.
    pub async fn run(self) -> Result<()> {
        info!("📋 Configuration Summary:");
        info!(
            "  👥 Sessions: timeout {}s, sweep every {}s, queue {} msgs",
            self.config.sessions.timeout_secs,
            self.config.sessions.cleanup_interval_secs,
            self.config.sessions.outbound_queue_capacity
        );
        info!(
            "  🚦 Rate limit: {} req/s, burst {}",
            self.config.rate_limit.requests_per_second, self.config.rate_limit.burst
        );
        info!(
            "  🔌 Breakers: trip after {} failures, open {}s, {} trials",
            self.config.circuit_breaker.max_failures,
            self.config.circuit_breaker.open_timeout_secs,
            self.config.circuit_breaker.max_half_open_trials
        );
        info!("  ⏱️ State update timeout: {}ms", self.config.state.update_timeout_ms);

        self.server.start()?;
        let monitoring_handle = self.spawn_health_monitor();

        let snapshot = self.server.get_state().await;
        info!(
            "🌍 State at version {} with {} player(s)",
            snapshot.version,
            snapshot.world.players.len()
        );

        info!("✅ Realm server is now running!");
        info!("🛑 Press Ctrl+C to gracefully shutdown");

        signals::wait_for_shutdown_signal().await?;

        info!("🛑 Shutdown signal received, initiating graceful shutdown...");
        if let Some(handle) = monitoring_handle {
            handle.abort();
        }
        self.server.shutdown().await?;

        let report = self.server.health_report().await;
        info!(
            "📊 Final state version {} | {} session(s) | {} breaker(s)",
            report.state_version,
            report.sessions,
            report.breakers.len()
        );
        info!("👋 Realm server shutdown complete");
        Ok(())
    }

    fn spawn_health_monitor(&self) -> Option<JoinHandle<()>> {
        let period = self.config.server.health_interval_secs;
        if period == 0 {
            return None;
        }

        let server = self.server.clone();
        Some(tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(period));
            // Skip the immediate first tick.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let report = server.health_report().await;
                info!(
                    "📊 System Health - version {} | {} session(s) | {} rate bucket(s)",
                    report.state_version, report.sessions, report.rate_limit_buckets
                );
                for breaker in &report.breakers {
                    info!(
                        "  🔌 {} is {} ({} consecutive failures)",
                        breaker.name, breaker.state, breaker.consecutive_failures
                    );
                }
            }
        }))
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    let app = match Application::new(args).await {
        Ok(app) => app,
        Err(e) => {
            eprintln!("❌ Failed to start application: {e:?}");
            std::process::exit(1);
        }
    };

    app.run().await
}

/// Display startup banner using proper logging
fn display_banner(name: &str) {
    let version = option_env!("CARGO_PKG_VERSION").unwrap_or("UNK");
    info!("╔══════════════════════════════════════════╗");
    info!("║              🌟 REALM SERVER 🌟           ║");
    info!("║                 v{:<24}║", version);
    info!("╚══════════════════════════════════════════╝");
    info!("🏷️ Instance: {}", name);
}
