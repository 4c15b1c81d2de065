//! Process lifecycle: termination signals and bounded graceful shutdown

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Resolves once SIGINT or SIGTERM is received
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let (mut sigterm, mut sigint) = match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
            (Err(e), _) | (_, Err(e)) => {
                warn!("failed to install signal handlers ({e}), falling back to ctrl-c");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("received ctrl-c");
    }
}

/// Cancel `token` when a termination signal arrives
pub fn cancel_on_signal(token: CancellationToken) {
    tokio::spawn(async move {
        tokio::select! {
            _ = shutdown_signal() => {
                info!("shutdown requested");
                token.cancel();
            }
            _ = token.cancelled() => {}
        }
    });
}

/// Wait for `work` for at most `grace`
///
/// Returns `false` when the grace period ran out first.
pub async fn with_grace<F: Future>(grace: Duration, work: F) -> bool {
    match tokio::time::timeout(grace, work).await {
        Ok(_) => true,
        Err(_) => {
            warn!("graceful shutdown exceeded {}s, forcing exit", grace.as_secs());
            false
        }
    }
}
