//! Cooperative shutdown signalling.
//!
//! A [`ShutdownSignal`] is cloned into every task that must stop on
//! shutdown: the accept loop, each client session, and the blocking
//! interface readers. Triggering is idempotent and observable both
//! synchronously (`is_triggered`) and asynchronously (`notified`).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tracing::info;

use crate::error::Result;

/// Shared one-shot shutdown flag with async notification.
#[derive(Clone)]
pub struct ShutdownSignal {
    triggered: Arc<AtomicBool>,
    notify: broadcast::Sender<()>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (notify, _) = broadcast::channel(1);
        Self {
            triggered: Arc::new(AtomicBool::new(false)),
            notify,
        }
    }

    /// Request shutdown. Only the first call sends the notification.
    pub fn trigger(&self) {
        if !self.triggered.swap(true, Ordering::SeqCst) {
            let _ = self.notify.send(());
        }
    }

    /// Whether shutdown has been requested.
    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Resolve once shutdown is requested, immediately if it already was.
    pub async fn notified(&self) {
        // Subscribe before checking the flag so a trigger landing
        // between the two is not missed.
        let mut rx = self.notify.subscribe();
        if self.is_triggered() {
            return;
        }
        let _ = rx.recv().await;
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Trigger `shutdown` when SIGINT or SIGTERM arrives.
pub async fn watch_signals(shutdown: ShutdownSignal) -> Result<()> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down");
        }
    }

    shutdown.trigger();
    Ok(())
}
