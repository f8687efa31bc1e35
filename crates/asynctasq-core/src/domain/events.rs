//! Lifecycle events - ワーカーの可観測性はすべてここを通る。
//!
//! Every state transition the worker makes is published as one of these
//! events. The serialized form is stable JSON: a `type` tag, an RFC 3339
//! `ts`, the `worker_id`, and for task events the task coordinates plus
//! event-specific fields. Sinks receive the typed value and decide on the
//! encoding themselves.
//!
//! For a given envelope, events are emitted by the single dispatch task that
//! owns it, in the order `task_started -> (task_retrying|task_completed|
//! task_failed)`. Consumers may rely on that sequence per task id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::envelope::TaskEnvelope;
use super::ids::{TaskId, TaskName};
use super::outcome::TaskError;

/// Task coordinates shared by all task-scoped events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRef {
    pub task_id: TaskId,
    pub task_name: TaskName,
    pub queue: String,
    pub attempt: u32,
}

impl From<&TaskEnvelope> for TaskRef {
    fn from(envelope: &TaskEnvelope) -> Self {
        Self {
            task_id: envelope.id,
            task_name: envelope.task_name.clone(),
            queue: envelope.queue.clone(),
            attempt: envelope.attempt,
        }
    }
}

/// One lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerEvent {
    WorkerOnline {
        ts: DateTime<Utc>,
        worker_id: String,
    },

    WorkerHeartbeat {
        ts: DateTime<Utc>,
        worker_id: String,
        in_flight: usize,
        started_total: u64,
        failed_total: u64,
        last_poll_at: Option<DateTime<Utc>>,
    },

    /// Non-fatal trouble (transient broker errors, sink failures observed
    /// elsewhere, lease-renew hiccups). The worker keeps going.
    WorkerWarning {
        ts: DateTime<Utc>,
        worker_id: String,
        message: String,
    },

    WorkerOffline {
        ts: DateTime<Utc>,
        worker_id: String,
    },

    TaskStarted {
        ts: DateTime<Utc>,
        worker_id: String,
        #[serde(flatten)]
        task: TaskRef,
    },

    TaskCompleted {
        ts: DateTime<Utc>,
        worker_id: String,
        #[serde(flatten)]
        task: TaskRef,
        duration_ms: u64,
    },

    /// Terminal for this attempt; `terminal` says whether the envelope is
    /// done for good (dead-lettered or dropped) or will be retried.
    TaskFailed {
        ts: DateTime<Utc>,
        worker_id: String,
        #[serde(flatten)]
        task: TaskRef,
        error: TaskError,
        terminal: bool,
    },

    TaskRetrying {
        ts: DateTime<Utc>,
        worker_id: String,
        #[serde(flatten)]
        task: TaskRef,
        /// Seconds until the broker makes the envelope available again.
        next_retry_in: f64,
    },
}

impl WorkerEvent {
    /// The wire name of the `type` tag.
    pub fn event_type(&self) -> &'static str {
        match self {
            WorkerEvent::WorkerOnline { .. } => "worker_online",
            WorkerEvent::WorkerHeartbeat { .. } => "worker_heartbeat",
            WorkerEvent::WorkerWarning { .. } => "worker_warning",
            WorkerEvent::WorkerOffline { .. } => "worker_offline",
            WorkerEvent::TaskStarted { .. } => "task_started",
            WorkerEvent::TaskCompleted { .. } => "task_completed",
            WorkerEvent::TaskFailed { .. } => "task_failed",
            WorkerEvent::TaskRetrying { .. } => "task_retrying",
        }
    }

    /// Task id, for task-scoped events.
    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            WorkerEvent::TaskStarted { task, .. }
            | WorkerEvent::TaskCompleted { task, .. }
            | WorkerEvent::TaskFailed { task, .. }
            | WorkerEvent::TaskRetrying { task, .. } => Some(task.task_id),
            _ => None,
        }
    }
}
