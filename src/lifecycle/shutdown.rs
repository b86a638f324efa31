//! Shutdown coordination for both server models.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;

use crate::poller::Waker;

struct Inner {
    /// Broadcast channel sender.
    tx: broadcast::Sender<()>,
    triggered: AtomicBool,
    wakers: Mutex<Vec<Waker>>,
}

/// Coordinator for graceful shutdown.
///
/// Async tasks subscribe to a broadcast channel; shard threads poll the flag
/// and register their poller waker so a blocked wait returns immediately.
#[derive(Clone)]
pub struct Shutdown {
    inner: Arc<Inner>,
}

impl Shutdown {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self {
            inner: Arc::new(Inner {
                tx,
                triggered: AtomicBool::new(false),
                wakers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Subscribe to the shutdown signal.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.inner.tx.subscribe()
    }

    /// Resolve once shutdown has been triggered, even if that happened
    /// before the call.
    pub async fn wait(&self) {
        let mut rx = self.subscribe();
        if self.is_triggered() {
            return;
        }
        // Closed or lagged both mean the signal was sent.
        let _ = rx.recv().await;
    }

    /// Wake `waker` on trigger. Registering after the trigger wakes at once.
    pub fn register_waker(&self, waker: Waker) {
        let mut wakers = self.inner.wakers.lock().expect("shutdown wakers mutex poisoned");
        if self.is_triggered() {
            let _ = waker.trigger();
        }
        wakers.push(waker);
    }

    /// Trigger the shutdown signal.
    pub fn trigger(&self) {
        if self.inner.triggered.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Shutdown triggered");
        let wakers = self.inner.wakers.lock().expect("shutdown wakers mutex poisoned");
        for waker in wakers.iter() {
            if let Err(err) = waker.trigger() {
                tracing::warn!(error = %err, "Failed to wake poller for shutdown");
            }
        }
        let _ = self.inner.tx.send(());
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::SeqCst)
    }

    /// Get the number of active subscribers (tasks still running).
    pub fn receiver_count(&self) -> usize {
        self.inner.tx.receiver_count()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}
