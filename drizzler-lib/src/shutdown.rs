use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::warn;

/// Cooperative shutdown flag shared by the orchestrator and its workers.
///
/// Once raised it stays raised. Workers observe it between dequeue attempts
/// and between retry attempts; in-flight attempts are allowed to complete.
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag {
    raised: Arc<AtomicBool>,
}

impl ShutdownFlag {
    /// Create a lowered flag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether shutdown has been requested.
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.raised.load(Ordering::Relaxed)
    }

    /// Request shutdown.
    pub fn trigger(&self) {
        self.raised.store(true, Ordering::Relaxed);
    }

    /// Spawn a background task raising the flag on SIGINT or SIGTERM.
    ///
    /// The task lives until a signal arrives or the runtime shuts down.
    pub fn listen_for_signals(&self) {
        let flag = self.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            warn!("Received shutdown signal. Cleaning up...");
            flag.trigger();
        });
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let (Ok(mut interrupt), Ok(mut terminate)) = (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
    ) else {
        warn!("Unable to install signal handlers; graceful shutdown disabled");
        // Park forever rather than raising the flag spuriously
        std::future::pending::<()>().await;
        unreachable!()
    };
    tokio::select! {
        _ = interrupt.recv() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        warn!("Unable to install signal handler; graceful shutdown disabled");
        std::future::pending::<()>().await;
    }
}
