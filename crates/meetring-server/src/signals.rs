//! Shutdown signalling.
//!
//! SIGTERM and SIGINT (Ctrl+C elsewhere) flip a watch channel that the socket
//! server, the timer driver and the wake loop all observe.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};

pub struct SignalHandler {
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Default for SignalHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalHandler {
    pub fn new() -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
        }
    }

    /// Spawns the OS signal listener. Call once at startup.
    #[cfg(unix)]
    pub fn spawn_listener(&self) {
        let shutdown_tx = self.shutdown_tx.clone();

        tokio::spawn(async move {
            use tokio::signal::unix::{SignalKind, signal};

            let (mut sigterm, mut sigint) =
                match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                    (Ok(term), Ok(int)) => (term, int),
                    (Err(e), _) | (_, Err(e)) => {
                        warn!(error = %e, "could not install signal handlers");
                        return;
                    }
                };

            tokio::select! {
                _ = sigterm.recv() => info!(signal = "SIGTERM", "shutting down"),
                _ = sigint.recv() => info!(signal = "SIGINT", "shutting down"),
            }
            let _ = shutdown_tx.send(true);
            debug!("signal listener stopped");
        });
    }

    #[cfg(not(unix))]
    pub fn spawn_listener(&self) {
        let shutdown_tx = self.shutdown_tx.clone();

        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                info!(signal = "ctrl-c", "shutting down");
                let _ = shutdown_tx.send(true);
            }
        });
    }

    pub fn shutdown(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.shutdown_rx.clone(),
        }
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// Completes once shutdown is signalled. Cheap to clone.
#[derive(Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub async fn wait(mut self) {
        loop {
            if *self.rx.borrow() {
                return;
            }
            // A dropped sender counts as shutdown.
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}
