//! Utility functions and helpers.

pub mod http;
pub mod retry;

use tokio::sync::watch;

/// Observer side of the process-wide shutdown flag.
///
/// Source fetches and message delivery check it between retries; the
/// scheduler checks it between ticks.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
    // Keeps the channel open for observers created without a handle.
    _keepalive: Option<std::sync::Arc<watch::Sender<bool>>>,
}

impl Shutdown {
    /// A shutdown observer that never fires (single-shot commands).
    pub fn inert() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            rx,
            _keepalive: Some(std::sync::Arc::new(tx)),
        }
    }

    /// Whether shutdown has been requested.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once shutdown is requested.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                // Sender gone without triggering: treat as "never".
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Trigger side of the shutdown flag.
#[derive(Debug)]
pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

impl ShutdownHandle {
    /// Request shutdown. Idempotent.
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }
}

/// Create a linked shutdown handle/observer pair.
pub fn shutdown_channel() -> (ShutdownHandle, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (
        ShutdownHandle { tx },
        Shutdown {
            rx,
            _keepalive: None,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_flag() {
        let (handle, shutdown) = shutdown_channel();
        assert!(!shutdown.is_cancelled());

        handle.trigger();
        assert!(shutdown.is_cancelled());
        shutdown.cancelled().await; // must resolve immediately
    }

    #[tokio::test]
    async fn test_inert_never_cancelled() {
        let shutdown = Shutdown::inert();
        assert!(!shutdown.is_cancelled());

        let pending = tokio::time::timeout(
            std::time::Duration::from_millis(10),
            shutdown.cancelled(),
        )
        .await;
        assert!(pending.is_err());
    }
}
