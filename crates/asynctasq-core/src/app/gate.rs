//! Concurrency gate: bounded in-flight counter with wait-for-drain.
//!
//! The single source of backpressure. The poller must hold a permit before
//! asking the broker for an envelope, so prefetch depth can never exceed
//! in-flight capacity; the permit travels into the dispatch task and is
//! released in its finalizer, whatever the outcome.

use std::sync::Arc;

use tokio::sync::{Notify, Semaphore};

pub struct ConcurrencyGate {
    permits: Arc<Semaphore>,
    idle: Arc<Notify>,
    capacity: usize,
}

/// One unit of in-flight budget. Dropping it returns the budget and wakes
/// drain waiters when the gate empties out.
pub struct GatePermit {
    // Option だけが Drop 時の手動返却を許す
    inner: Option<tokio::sync::OwnedSemaphorePermit>,
    permits: Arc<Semaphore>,
    idle: Arc<Notify>,
    capacity: usize,
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        drop(self.inner.take());
        if self.permits.available_permits() == self.capacity {
            self.idle.notify_waiters();
        }
    }
}

impl ConcurrencyGate {
    pub fn new(capacity: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            idle: Arc::new(Notify::new()),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_flight(&self) -> usize {
        self.capacity - self.permits.available_permits()
    }

    /// Wait for a unit of budget.
    pub async fn acquire(&self) -> GatePermit {
        let inner = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .expect("gate semaphore is never closed");
        self.permit(inner)
    }

    /// Take a unit of budget only if one is free right now.
    pub fn try_acquire(&self) -> Option<GatePermit> {
        Arc::clone(&self.permits)
            .try_acquire_owned()
            .ok()
            .map(|inner| self.permit(inner))
    }

    fn permit(&self, inner: tokio::sync::OwnedSemaphorePermit) -> GatePermit {
        GatePermit {
            inner: Some(inner),
            permits: Arc::clone(&self.permits),
            idle: Arc::clone(&self.idle),
            capacity: self.capacity,
        }
    }

    /// Resolve once nothing is in flight. Used during drain.
    pub async fn wait_until_empty(&self) {
        loop {
            // notified() を先に作ってから条件を見る（通知の取りこぼし防止）
            let notified = self.idle.notified();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }
}
