//! Shared shutdown signal for the daemon's sync loop and gateway server.
//!
//! A bare [`tokio::sync::Notify`] only wakes tasks that are already polling
//! `notified()` when `notify_waiters()` fires; a signal sent in the gap
//! between loop iterations is lost. We pair it with a latch so every waiter
//! re-checks "has shutdown already happened" before blocking again.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

#[derive(Clone, Default)]
pub struct Shutdown {
    notify: Arc<Notify>,
    fired: Arc<AtomicBool>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal(&self) {
        self.fired.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_signalled(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Resolves once `signal` has been called, even if that happened before
    /// this call started waiting.
    pub async fn wait(&self) {
        if self.is_signalled() {
            return;
        }
        self.notify.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wait_returns_immediately_if_already_signalled() {
        let s = Shutdown::new();
        s.signal();
        tokio::time::timeout(std::time::Duration::from_millis(50), s.wait())
            .await
            .expect("wait() should not block after signal()");
    }

    #[tokio::test]
    async fn wait_wakes_on_later_signal() {
        let s = Shutdown::new();
        let waiter = s.clone();
        let handle = tokio::spawn(async move { waiter.wait().await });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        s.signal();
        tokio::time::timeout(std::time::Duration::from_millis(200), handle)
            .await
            .expect("wait() should wake after signal()")
            .unwrap();
    }
}
