use std::sync::Arc;

use tokio::sync::watch;

/// Sending side of the shutdown signal.
///
/// Cloning is cheap and every clone signals the same receivers.
#[derive(Debug, Clone)]
pub struct ShutdownTx(Arc<watch::Sender<bool>>);

impl ShutdownTx {
    /// Requests shutdown of every subscribed worker.
    ///
    /// The request is retained, so receivers subscribed later observe it as well.
    pub fn shutdown(&self) {
        self.0.send_replace(true);
    }

    pub fn subscribe(&self) -> ShutdownRx {
        ShutdownRx(self.0.subscribe())
    }
}

/// Receiving side of the shutdown signal.
#[derive(Debug, Clone)]
pub struct ShutdownRx(watch::Receiver<bool>);

impl ShutdownRx {
    /// Returns `true` once shutdown was requested.
    pub fn is_shutdown(&self) -> bool {
        *self.0.borrow()
    }

    /// Waits until shutdown is requested.
    ///
    /// A dropped sender counts as a shutdown request.
    pub async fn wait(&mut self) {
        let _ = self.0.wait_for(|shutdown| *shutdown).await;
    }
}

pub fn create_shutdown_channel() -> (ShutdownTx, ShutdownRx) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTx(Arc::new(tx)), ShutdownRx(rx))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn late_subscribers_observe_shutdown() {
        let (tx, _rx) = create_shutdown_channel();
        tx.shutdown();

        let mut rx = tx.subscribe();
        assert!(rx.is_shutdown());
        tokio::time::timeout(Duration::from_secs(1), rx.wait())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn dropped_sender_releases_waiters() {
        let (tx, mut rx) = create_shutdown_channel();
        drop(tx);

        tokio::time::timeout(Duration::from_secs(1), rx.wait())
            .await
            .unwrap();
        assert!(!rx.is_shutdown());
    }
}
