//! Cancellable one-shot timers

use std::time::Duration;

use tokio::sync::oneshot;

/// Runs a closure after a delay unless cancelled first
///
/// Dropping the task cancels it, so a timer never outlives its owner.
pub struct ScheduledTask {
    cancel: Option<oneshot::Sender<()>>,
}

impl ScheduledTask {
    pub fn after<F>(delay: Duration, task: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => task(),
                _ = cancel_rx => {}
            }
        });
        Self {
            cancel: Some(cancel_tx),
        }
    }

    pub fn cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
    }

    /// Whether the task is still waiting to run
    pub fn is_pending(&self) -> bool {
        self.cancel.as_ref().is_some_and(|tx| !tx.is_closed())
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.cancel();
    }
}
