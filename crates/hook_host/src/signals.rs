//! Signal handling for graceful shutdown.
//!
//! A termination signal cancels the root lifetime token. Every session token
//! descends from it, so outstanding continuations are dropped at their next
//! checkpoint and the tick loop notices on its next iteration.

use hook_bridge::LifetimeToken;
use tokio::signal;
use tracing::{error, info};

/// Waits for SIGINT or SIGTERM (Ctrl+C on Windows).
pub async fn wait_for_shutdown_signal() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    #[cfg(unix)]
    {
        use signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = sigint.recv() => (),
            _ = sigterm.recv() => ()
        }
    }

    #[cfg(windows)]
    signal::ctrl_c().await?;

    Ok(())
}

/// Spawns a task that cancels `root` on the first termination signal.
///
/// Returns immediately. If `root` is cancelled for another reason first (the
/// tick limit was reached) the task exits quietly.
pub fn cancel_on_signal(runtime: &tokio::runtime::Handle, root: LifetimeToken) {
    drop(runtime.spawn(async move {
        tokio::select! {
            result = wait_for_shutdown_signal() => match result {
                Ok(()) => {
                    info!("📡 Received shutdown signal - initiating graceful shutdown");
                    root.cancel();
                }
                Err(e) => error!("❌ Failed to install signal handlers: {}", e),
            },
            _ = root.cancelled() => {}
        }
    }));
}
