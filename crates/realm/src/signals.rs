//! Signal handling for graceful server shutdown.

use anyhow::Result;
use tokio::signal;
use tracing::info;

/// Waits for a termination signal.
///
/// Listens for SIGINT and SIGTERM on Unix and Ctrl+C on Windows, returning
/// once one arrives so the caller can shut the server down cleanly.
pub async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = sigint.recv() => {
                info!("📡 Received SIGINT");
            }
            _ = sigterm.recv() => {
                info!("📡 Received SIGTERM");
            }
        }
    }

    #[cfg(windows)]
    {
        signal::ctrl_c().await?;
        info!("📡 Received Ctrl+C");
    }

    Ok(())
}
