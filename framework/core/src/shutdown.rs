use std::sync::Arc;

use tokio::sync::watch::{Receiver, Sender};

/// Broadcasts a one-way shutdown signal to every [DelegatedShutdownListener] created from it.
///
/// The signal is latched, so a listener created after [ShutdownHandle::shutdown] has been called
/// still observes it.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    sender: Arc<Sender<bool>>,
}

impl Default for ShutdownHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownHandle {
    pub fn new() -> Self {
        Self {
            sender: Arc::new(tokio::sync::watch::channel(false).0),
        }
    }

    pub fn shutdown(&self) {
        let previous = self.sender.send_replace(true);
        if !previous {
            log::debug!("Shutdown signal sent");
        }
    }

    pub fn is_shutdown(&self) -> bool {
        *self.sender.borrow()
    }

    pub fn new_listener(&self) -> DelegatedShutdownListener {
        DelegatedShutdownListener::new(self.sender.subscribe())
    }
}

#[derive(Clone, Debug)]
pub struct DelegatedShutdownListener {
    receiver: Receiver<bool>,
}

impl DelegatedShutdownListener {
    pub(crate) fn new(receiver: Receiver<bool>) -> Self {
        Self { receiver }
    }

    /// Point in time check if the shutdown signal has been received. If this returns true then work
    /// should be stopped so that the scenario can shut down.
    pub fn should_shutdown(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Wait for the shutdown signal to be received. It is safe to race this with another future so
    /// that the shutdown signal can be used to cancel other work in progress.
    ///
    /// If the [ShutdownHandle] is dropped without signalling then no signal can ever arrive and
    /// this future never resolves.
    pub async fn wait_for_shutdown(&self) {
        let mut receiver = self.receiver.clone();
        if receiver.wait_for(|shutdown| *shutdown).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn late_listener_sees_shutdown() {
        let handle = ShutdownHandle::new();
        handle.shutdown();

        let listener = handle.new_listener();
        assert!(listener.should_shutdown());
        listener.wait_for_shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_handle_never_signals() {
        let listener = ShutdownHandle::new().new_listener();

        let waited = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            listener.wait_for_shutdown(),
        )
        .await;

        assert!(waited.is_err());
        assert!(!listener.should_shutdown());
    }
}
