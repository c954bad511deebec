//! Shutdown signalling shared by the flusher, consumers and reporter

use tokio::sync::watch;
use tracing::info;

/// One-way stop signal broadcast over a `watch` channel
///
/// Receivers observe the flag at their own suspension points; tasks that
/// are mid-operation finish that operation before looking.
#[derive(Debug)]
pub struct ShutdownSignal {
    name: &'static str,
    tx: watch::Sender<bool>,
}

impl ShutdownSignal {
    /// Create an untriggered signal
    pub fn new(name: &'static str) -> Self {
        let (tx, _) = watch::channel(false);
        Self { name, tx }
    }

    /// New receiver for the signal
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Trigger shutdown; later calls are no-ops
    pub fn trigger(&self) {
        let changed = self.tx.send_if_modified(|stopped| {
            if *stopped {
                false
            } else {
                *stopped = true;
                true
            }
        });
        if changed {
            info!(component = self.name, "shutdown signalled");
        }
    }

    /// Whether shutdown has been triggered
    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Resolve once `rx` reports shutdown, or its sender is gone
pub async fn stopped(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stopped| *stopped).await;
}
