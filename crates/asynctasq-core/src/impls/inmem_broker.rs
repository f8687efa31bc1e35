//! In-memory broker implementation.
//!
//! The reference adapter: everything the port allows, it supports.
//! Priority-ordered dequeue, native delay scheduling, visibility leases
//! with crash-recovery redelivery, a broker-side delivery counter, an
//! idempotent ack, and a dead-letter store. Development and the test suite
//! run against it; backend adapters copy its observable behavior.

use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::domain::{Receipt, TaskEnvelope, TaskError, TaskId};
use crate::ports::broker::{Broker, BrokerCapabilities, BrokerError};
use crate::ports::clock::{Clock, SystemClock};

/// Scheduled entry for the delay heap.
///
/// Reverse ordering so `BinaryHeap` acts as a min-heap (earliest first).
#[derive(Debug, Clone, PartialEq, Eq)]
struct ScheduledTask {
    available_at: DateTime<Utc>,
    task_id: TaskId,
}

impl PartialOrd for ScheduledTask {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledTask {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .available_at
            .cmp(&self.available_at)
            .then_with(|| other.task_id.cmp(&self.task_id))
    }
}

/// A task the broker still owns (not yet terminally settled).
#[derive(Debug, Clone)]
struct StoredTask {
    envelope: TaskEnvelope,
    /// Broker-side delivery counter; stamped into `attempt` at dequeue.
    deliveries: u32,
}

#[derive(Debug, Clone)]
struct Leased {
    task_id: TaskId,
    deadline: DateTime<Utc>,
}

/// Queue depths for tests and status displays.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BrokerCounts {
    pub ready: usize,
    pub scheduled: usize,
    pub leased: usize,
    pub dead: usize,
}

struct BrokerState {
    tasks: HashMap<TaskId, StoredTask>,
    queues: HashMap<String, VecDeque<TaskId>>,
    scheduled: BinaryHeap<ScheduledTask>,
    leased: HashMap<Receipt, Leased>,
    dead: Vec<(TaskEnvelope, TaskError)>,
    next_receipt: u64,
    connected: bool,
}

impl BrokerState {
    fn new() -> Self {
        Self {
            tasks: HashMap::new(),
            queues: HashMap::new(),
            scheduled: BinaryHeap::new(),
            leased: HashMap::new(),
            dead: Vec::new(),
            next_receipt: 1,
            connected: false,
        }
    }

    /// Move scheduled tasks whose time has come into their ready queue.
    fn promote_scheduled(&mut self, now: DateTime<Utc>) {
        while let Some(entry) = self.scheduled.peek() {
            if entry.available_at > now {
                break; // heap is sorted, nothing further is due
            }
            let entry = self.scheduled.pop().expect("peeked entry exists");
            if let Some(stored) = self.tasks.get(&entry.task_id) {
                let queue = stored.envelope.queue.clone();
                self.queues.entry(queue).or_default().push_back(entry.task_id);
            }
        }
    }

    /// Crash recovery: leases past their deadline go back to the queue.
    /// The next delivery gets a bumped attempt count.
    fn reap_expired(&mut self, now: DateTime<Utc>) {
        let expired: Vec<Receipt> = self
            .leased
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(receipt, _)| receipt.clone())
            .collect();
        for receipt in expired {
            if let Some(lease) = self.leased.remove(&receipt)
                && let Some(stored) = self.tasks.get(&lease.task_id)
            {
                let queue = stored.envelope.queue.clone();
                self.queues.entry(queue).or_default().push_back(lease.task_id);
            }
        }
    }

    fn counts(&self) -> BrokerCounts {
        BrokerCounts {
            ready: self.queues.values().map(VecDeque::len).sum(),
            scheduled: self.scheduled.len(),
            leased: self.leased.len(),
            dead: self.dead.len(),
        }
    }
}

pub struct InMemoryBroker {
    state: Mutex<BrokerState>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Deterministic tests drive visibility and delays through a
    /// `FixedClock` passed in here.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self { state: Mutex::new(BrokerState::new()), clock }
    }

    /// Producer-side enqueue. Respects `available_at` (native delay
    /// scheduling).
    pub async fn enqueue(&self, envelope: TaskEnvelope) -> Result<(), BrokerError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let task_id = envelope.id;
        let available_at = envelope.available_at;
        let queue = envelope.queue.clone();
        state.tasks.insert(task_id, StoredTask { envelope, deliveries: 0 });
        if available_at > now {
            state.scheduled.push(ScheduledTask { available_at, task_id });
        } else {
            state.queues.entry(queue).or_default().push_back(task_id);
        }
        Ok(())
    }

    pub async fn counts(&self) -> BrokerCounts {
        let mut state = self.state.lock().await;
        let now = self.clock.now();
        state.promote_scheduled(now);
        state.reap_expired(now);
        state.counts()
    }

    /// Dead-lettered envelopes with their terminal failures.
    pub async fn dead_letters(&self) -> Vec<(TaskEnvelope, TaskError)> {
        self.state.lock().await.dead.clone()
    }

    pub async fn is_connected(&self) -> bool {
        self.state.lock().await.connected
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn connect(&self) -> Result<(), BrokerError> {
        self.state.lock().await.connected = true;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BrokerError> {
        self.state.lock().await.connected = false;
        Ok(())
    }

    async fn dequeue(
        &self,
        queues: &[String],
        max: usize,
        lease: Duration,
    ) -> Result<Vec<TaskEnvelope>, BrokerError> {
        let now = self.clock.now();
        let lease = TimeDelta::from_std(lease)
            .map_err(|e| BrokerError::Fatal(format!("lease duration out of range: {e}")))?;

        let mut state = self.state.lock().await;
        state.promote_scheduled(now);
        state.reap_expired(now);

        let mut out = Vec::new();
        // 優先度はキューの並び順そのもの：先頭のキューを空にしてから次へ
        for queue in queues {
            while out.len() < max {
                let Some(task_id) = state.queues.get_mut(queue).and_then(VecDeque::pop_front)
                else {
                    break;
                };
                let receipt = Receipt::new(format!("r-{}", state.next_receipt));
                state.next_receipt += 1;

                let Some(stored) = state.tasks.get_mut(&task_id) else {
                    continue; // settled while queued; skip the stale id
                };
                stored.deliveries += 1;

                let mut envelope = stored.envelope.clone();
                envelope.attempt = stored.deliveries;
                envelope.visibility_deadline = now + lease;
                envelope.receipt = receipt.clone();

                state.leased.insert(receipt, Leased { task_id, deadline: now + lease });
                out.push(envelope);
            }
            if out.len() >= max {
                break;
            }
        }
        Ok(out)
    }

    async fn ack(&self, receipt: &Receipt) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        // idempotent: unknown/expired receipts are a no-op
        if let Some(lease) = state.leased.remove(receipt) {
            state.tasks.remove(&lease.task_id);
        }
        Ok(())
    }

    async fn nack(&self, receipt: &Receipt, requeue_delay: Duration) -> Result<(), BrokerError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let Some(lease) = state.leased.remove(receipt) else {
            // lease already expired and reaped; the envelope is queued again
            return Ok(());
        };
        if requeue_delay.is_zero() {
            if let Some(stored) = state.tasks.get(&lease.task_id) {
                let queue = stored.envelope.queue.clone();
                state.queues.entry(queue).or_default().push_back(lease.task_id);
            }
        } else {
            let delay = TimeDelta::from_std(requeue_delay)
                .map_err(|e| BrokerError::Fatal(format!("requeue delay out of range: {e}")))?;
            state
                .scheduled
                .push(ScheduledTask { available_at: now + delay, task_id: lease.task_id });
        }
        Ok(())
    }

    async fn extend(&self, receipt: &Receipt, additional: Duration) -> Result<(), BrokerError> {
        let now = self.clock.now();
        let additional = TimeDelta::from_std(additional)
            .map_err(|e| BrokerError::Fatal(format!("extension out of range: {e}")))?;

        let mut state = self.state.lock().await;
        match state.leased.get_mut(receipt) {
            Some(lease) if lease.deadline > now => {
                lease.deadline += additional;
                Ok(())
            }
            _ => Err(BrokerError::LeaseExpired),
        }
    }

    async fn move_to_dead_letter(
        &self,
        receipt: &Receipt,
        failure: &TaskError,
    ) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        let Some(lease) = state.leased.remove(receipt) else {
            return Err(BrokerError::LeaseExpired);
        };
        if let Some(stored) = state.tasks.remove(&lease.task_id) {
            state.dead.push((stored.envelope, failure.clone()));
        }
        Ok(())
    }

    fn capabilities(&self) -> BrokerCapabilities {
        BrokerCapabilities {
            supports_dead_letter: true,
            supports_extend: true,
            native_delay_scheduling: true,
        }
    }
}
