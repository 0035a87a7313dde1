//! Turns SIGINT/SIGTERM into a single cancellation signal.

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// One-shot cancellation fired by the first interrupt or terminate signal.
#[derive(Debug, Clone, Default)]
pub struct Terminator {
    token: CancellationToken,
}

impl Terminator {
    /// A terminator that only fires when `terminate` is called.
    pub fn new() -> Self {
        Self::default()
    }

    /// Listen for SIGINT and SIGTERM. Must be called inside a tokio runtime.
    pub fn install() -> std::io::Result<Self> {
        let terminator = Self::new();
        let token = terminator.token.clone();

        #[cfg(unix)]
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

        tokio::spawn(async move {
            loop {
                #[cfg(unix)]
                let name = tokio::select! {
                    result = tokio::signal::ctrl_c() => match result {
                        Ok(()) => "SIGINT",
                        Err(_) => return,
                    },
                    _ = sigterm.recv() => "SIGTERM",
                };
                #[cfg(not(unix))]
                let name = match tokio::signal::ctrl_c().await {
                    Ok(()) => "ctrl-c",
                    Err(_) => return,
                };

                if token.is_cancelled() {
                    debug!(signal = name, "Already shutting down");
                } else {
                    info!(signal = name, "Shutdown signal received");
                    token.cancel();
                }
            }
        });

        Ok(terminator)
    }

    /// Non-blocking check; stays true once fired.
    pub fn is_terminated(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn terminate(&self) {
        self.token.cancel();
    }

    /// Token for stages that need to wait on cancellation alongside other events.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub async fn terminated(&self) {
        self.token.cancelled().await
    }
}
