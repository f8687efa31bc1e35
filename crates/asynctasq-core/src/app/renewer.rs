//! Lease renewer: keeps visibility deadlines ahead of long-running tasks.
//!
//! For every in-flight envelope (when the broker supports `extend`) a small
//! background task fires at `visibility_timeout / 3` and pushes the deadline
//! forward. Renewal stops on terminal disposition (the guard is dropped) or
//! once the worker is draining. A failed extend flips the guard's lost flag;
//! the dispatcher watches it, stops the handler, and never acks a lost
//! lease. Preferring redelivery over a double-ack is what keeps
//! at-least-once honest.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::domain::{TaskEnvelope, WorkerState};
use crate::ports::broker::{Broker, call_with_retry};

pub struct LeaseRenewer {
    broker: Arc<dyn Broker>,
    visibility: Duration,
    state: watch::Receiver<WorkerState>,
}

/// Handle tied to one envelope's renewal task.
pub struct LeaseGuard {
    lost: watch::Receiver<bool>,
    task: Option<JoinHandle<()>>,
}

impl LeaseGuard {
    /// Guard for brokers without `extend`: the lease is never renewed and
    /// never reported lost; the dispatcher bounds execution by the
    /// remaining visibility instead.
    pub fn inert() -> Self {
        let (tx, rx) = watch::channel(false);
        // keep the sender alive so `lost()` stays pending forever
        let task = tokio::spawn(async move {
            tx.closed().await;
        });
        Self { lost: rx, task: Some(task) }
    }

    pub fn is_lost(&self) -> bool {
        *self.lost.borrow()
    }

    /// Resolves if and when the lease is lost. Pending forever otherwise.
    pub async fn lost(&mut self) {
        loop {
            if *self.lost.borrow() {
                return;
            }
            if self.lost.changed().await.is_err() {
                // renew task gone without flagging: lease was never lost
                std::future::pending::<()>().await;
            }
        }
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl LeaseRenewer {
    pub fn new(
        broker: Arc<dyn Broker>,
        visibility: Duration,
        state: watch::Receiver<WorkerState>,
    ) -> Self {
        Self { broker, visibility, state }
    }

    /// Start renewing the envelope's lease. Call before dispatch, drop the
    /// guard after the terminal broker operation.
    pub fn watch(&self, envelope: &TaskEnvelope) -> LeaseGuard {
        if !self.broker.capabilities().supports_extend {
            return LeaseGuard::inert();
        }

        let (tx, rx) = watch::channel(false);
        let broker = Arc::clone(&self.broker);
        let receipt = envelope.receipt.clone();
        let task_id = envelope.id;
        let visibility = self.visibility;
        let interval = visibility / 3;
        let mut state = self.state.clone();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        let extended =
                            call_with_retry(|| broker.extend(&receipt, visibility)).await;
                        if let Err(err) = extended {
                            tracing::warn!(%task_id, %err, "lease renewal failed; flagging lease as lost");
                            let _ = tx.send(true);
                            return;
                        }
                        tracing::trace!(%task_id, "lease extended");
                    }
                    _ = wait_for_draining(&mut state) => {
                        // draining: 延長はここで終わり。in-flight 分は grace 内に終わる前提。
                        return;
                    }
                }
            }
        });

        LeaseGuard { lost: rx, task: Some(task) }
    }
}

/// Resolves once the worker state reaches at least `Draining`, without
/// holding a `watch::Ref` across an `.await` (keeps the future `Send` when
/// raced via `tokio::select!`).
async fn wait_for_draining(state: &mut watch::Receiver<WorkerState>) {
    loop {
        if state.borrow().at_least(WorkerState::Draining) {
            return;
        }
        if state.changed().await.is_err() {
            return;
        }
    }
}
