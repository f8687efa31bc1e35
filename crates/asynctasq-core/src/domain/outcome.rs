//! Outcome model: common result format for attempts.
//!
//! This module is architecture-agnostic: it does not assume brokers, workers,
//! or persistence. It only defines the "shape" of results the dispatcher can
//! record and the retry engine can act on. Handler panics and exceptions are
//! converted into values here; no error type ever crosses the dispatcher
//! boundary by unwinding.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Classification of a task-level failure.
///
/// The split matters operationally: retriable kinds go back to the queue,
/// the rest go straight to the dead-letter queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Raised by user task code.
    User,
    /// Payload could not be decoded (or a result could not be encoded).
    Serialization,
    /// No handler registered for the envelope's task name.
    UnknownTask,
    /// User code explicitly opted out of retries.
    DoNotRetry,
    /// The dispatcher-imposed deadline was reached.
    Timeout,
    /// A process-pool child died mid-task.
    ProcessCrash,
    /// Shutdown-induced cancellation.
    Cancelled,
    /// The visibility lease was lost; the broker will redeliver.
    LeaseLost,
}

impl ErrorKind {
    /// Should another attempt be scheduled (below the attempt cap)?
    pub fn is_retriable(self) -> bool {
        matches!(self, ErrorKind::User | ErrorKind::Timeout | ErrorKind::ProcessCrash)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::User => "user",
            ErrorKind::Serialization => "serialization",
            ErrorKind::UnknownTask => "unknown_task",
            ErrorKind::DoNotRetry => "do_not_retry",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ProcessCrash => "process_crash",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::LeaseLost => "lease_lost",
        };
        f.write_str(s)
    }
}

/// A task-level failure as a value: kind + message + optional stack.
///
/// Deliberately not a `std::error::Error` implementor used with `?`: it is
/// carried inside `TaskOutcome` and event payloads, the same way the broker
/// stores it on dead-lettered envelopes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: ErrorKind,
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
}

impl TaskError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), traceback: None }
    }

    pub fn user(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::User, message)
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Serialization, message)
    }

    pub fn unknown_task(name: impl fmt::Display) -> Self {
        Self::new(ErrorKind::UnknownTask, format!("no handler registered for task_name={name}"))
    }

    pub fn do_not_retry(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::DoNotRetry, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn process_crash(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ProcessCrash, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, message)
    }

    pub fn lease_lost() -> Self {
        Self::new(ErrorKind::LeaseLost, "visibility lease lost; broker will redeliver")
    }

    pub fn with_traceback(mut self, traceback: impl Into<String>) -> Self {
        self.traceback = Some(traceback.into());
        self
    }

    pub fn is_retriable(&self) -> bool {
        self.kind.is_retriable()
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// A unified classification of one attempt's result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TaskOutcome {
    /// The handler returned; `result` is the serializer-encoded value.
    Success { result: Vec<u8> },

    /// The handler (or its surroundings) failed.
    Failure { error: TaskError },

    /// The deadline fired before the handler finished.
    Timeout,

    /// The envelope was refused before execution began.
    Rejected { reason: String },
}

impl TaskOutcome {
    pub fn success(result: Vec<u8>) -> Self {
        TaskOutcome::Success { result }
    }

    pub fn failure(error: TaskError) -> Self {
        TaskOutcome::Failure { error }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Success { .. })
    }

    /// The failure payload used in events and dead-letter records.
    /// `Success` has none; `Timeout`/`Rejected` synthesize theirs.
    pub fn error(&self) -> Option<TaskError> {
        match self {
            TaskOutcome::Success { .. } => None,
            TaskOutcome::Failure { error } => Some(error.clone()),
            TaskOutcome::Timeout => Some(TaskError::timeout("execution deadline exceeded")),
            TaskOutcome::Rejected { reason } => Some(TaskError::cancelled(reason.clone())),
        }
    }
}
