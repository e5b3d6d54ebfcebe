//! Graceful shutdown handling for SIGTERM and SIGINT.
//!
//! In-flight backups are never interrupted: the cron driver stops adding
//! new fires and the blocking pool drains on runtime shutdown.

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Shutdown coordinator
#[derive(Clone, Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token cancelled once shutdown starts
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Wait for SIGINT or SIGTERM, then cancel the token.
    pub async fn wait_for_signal(&self) {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    warn!("Failed to listen for SIGTERM: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT (Ctrl+C), initiating graceful shutdown..."),
            _ = terminate => info!("Received SIGTERM, initiating graceful shutdown..."),
            _ = self.token.cancelled() => {}
        }

        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancel_wakes_subscribers() {
        let coordinator = ShutdownCoordinator::new();
        let token = coordinator.token();

        let handle = tokio::spawn(async move {
            token.cancelled().await;
        });

        coordinator.token().cancel();
        handle.await.unwrap();
        // Already cancelled: returns without a signal
        coordinator.wait_for_signal().await;
    }
}
