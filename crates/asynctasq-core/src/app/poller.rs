//! Poller: the admission loop.
//!
//! While the worker is running: hold gate permits, ask the broker for at
//! most that many envelopes (so prefetch never exceeds in-flight capacity),
//! hand each one to a dispatch task, repeat. Queue priority is the broker's
//! contract; the poller just passes the configured queue order through
//! untouched.
//!
//! Transient dequeue errors are retried and surfaced as warnings; a fatal
//! broker error ends the loop, which drains the worker.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::domain::{WorkerEvent, WorkerState};
use crate::ports::broker::{Broker, BrokerError, call_with_retry};
use crate::ports::clock::{Clock, Sleeper};
use crate::ports::event_sink::EventEmitter;

use super::dispatcher::Dispatcher;
use super::gate::ConcurrencyGate;
use super::renewer::LeaseRenewer;
use super::status::WorkerStats;
use super::worker::WorkerControl;

pub(crate) struct Poller {
    pub broker: Arc<dyn Broker>,
    pub gate: Arc<ConcurrencyGate>,
    pub dispatcher: Arc<Dispatcher>,
    pub renewer: Arc<LeaseRenewer>,
    pub clock: Arc<dyn Clock>,
    pub stats: Arc<WorkerStats>,
    pub emitter: Arc<EventEmitter>,
    pub ctl: Arc<WorkerControl>,
    pub queues: Vec<String>,
    pub visibility: Duration,
    pub empty_sleep: Duration,
    pub max_tasks: Option<u64>,
    pub worker_id: String,
}

impl Poller {
    /// Run until the worker leaves `running` or the broker fails fatally.
    pub async fn run(self) -> Result<(), BrokerError> {
        let mut state = self.ctl.state();
        let cancel = self.ctl.cancel();
        let mut sleeper = Sleeper::new(self.ctl.state());
        let mut dispatched: u64 = 0;

        loop {
            if !state.borrow().is_running() {
                return Ok(());
            }

            // permit-first: no permit, no dequeue
            let first = tokio::select! {
                permit = self.gate.acquire() => permit,
                _ = wait_until_not_running(&mut state) => return Ok(()),
            };

            let mut permits = vec![first];
            while permits.len() < self.gate.capacity()
                && let Some(permit) = self.gate.try_acquire()
            {
                permits.push(permit);
            }
            if let Some(max) = self.max_tasks {
                let remaining = max.saturating_sub(dispatched);
                permits.truncate(remaining.max(1) as usize);
            }

            let batch = call_with_retry(|| {
                self.broker.dequeue(&self.queues, permits.len(), self.visibility)
            })
            .await;
            self.stats.record_poll(self.clock.now());

            let envelopes = match batch {
                Ok(envelopes) => envelopes,
                Err(err) if err.is_transient() => {
                    // retries exhausted but the broker may come back; warn and keep polling
                    self.warn(format!("dequeue kept failing: {err}")).await;
                    drop(permits);
                    if !sleeper.sleep(self.empty_sleep).await {
                        return Ok(());
                    }
                    continue;
                }
                Err(err) => {
                    self.warn(format!("unrecoverable poll error: {err}")).await;
                    return Err(err);
                }
            };

            if envelopes.is_empty() {
                drop(permits);
                if !sleeper.sleep(self.empty_sleep).await {
                    return Ok(());
                }
                continue;
            }

            for envelope in envelopes {
                let Some(permit) = permits.pop() else {
                    // contract violation: broker returned more than asked for
                    tracing::error!("broker returned more envelopes than requested; dropping");
                    break;
                };
                let lease = self.renewer.watch(&envelope);
                let dispatcher = Arc::clone(&self.dispatcher);
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    // permit release is the dispatch finalizer, success or not
                    let _permit = permit;
                    dispatcher.dispatch(envelope, lease, cancel).await;
                });
                dispatched += 1;
            }
            drop(permits); // return whatever the broker did not fill

            if let Some(max) = self.max_tasks
                && dispatched >= max
            {
                tracing::info!(dispatched, "max_tasks reached");
                self.ctl.request_drain("max_tasks reached");
                return Ok(());
            }
        }
    }

    async fn warn(&self, message: String) {
        self.emitter
            .emit(WorkerEvent::WorkerWarning {
                ts: self.clock.now(),
                worker_id: self.worker_id.clone(),
                message,
            })
            .await;
    }
}

async fn wait_until_not_running(state: &mut watch::Receiver<WorkerState>) {
    if state.wait_for(|s| !s.is_running()).await.is_err() {
        // control handle dropped: treat as shutdown
    }
}
