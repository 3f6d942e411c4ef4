//! Process-wide stop signal.

use tokio_util::sync::CancellationToken;
use tracing::info;

/// The single cancellation signal every loop of the agent observes.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    token: CancellationToken,
}

impl StopSignal {
    /// Signal that has not fired.
    pub fn new() -> Self {
        Self::default()
    }

    /// Token handed to loops; cancelled when the agent stops.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Fire the signal; later calls only repeat the cancellation.
    pub fn stop(&self, reason: &str) {
        if !self.token.is_cancelled() {
            info!(reason, "stopping agent");
        }
        self.token.cancel();
    }

    /// Whether the signal fired.
    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Wait until the signal fires.
    pub async fn stopped(&self) {
        self.token.cancelled().await;
    }

    /// Trigger the signal on Ctrl+C or SIGTERM.
    pub fn install_signal_handlers(&self) {
        let signal = self.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                signal.stop("interrupt received");
            }
        });

        #[cfg(unix)]
        {
            let signal = self.clone();
            tokio::spawn(async move {
                use tokio::signal::unix::{signal as unix_signal, SignalKind};
                if let Ok(mut sigterm) = unix_signal(SignalKind::terminate()) {
                    tokio::select! {
                        _ = sigterm.recv() => signal.stop("SIGTERM received"),
                        () = signal.stopped() => {}
                    }
                }
            });
        }
    }
}
