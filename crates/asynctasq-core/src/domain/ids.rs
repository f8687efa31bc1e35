//! Domain identifiers (strongly-typed IDs).
//!
//! # Why not `String` everywhere?
//! Using newtypes prevents mixing different identifiers by mistake
//! (e.g. passing a `Receipt` where a `TaskId` is expected). All of them
//! derive `Serialize/Deserialize` so persistence and external APIs use the
//! same types without refactoring.

use serde::{Deserialize, Serialize};
use std::fmt;
use ulid::Ulid;

/// Identifier of a single enqueued task, assigned at enqueue time.
///
/// ULID-backed: sortable by creation time and generatable without
/// coordination, which matters once multiple producers enqueue concurrently.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(Ulid);

impl TaskId {
    /// Generate a fresh id.
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    pub fn from_ulid(raw: Ulid) -> Self {
        Self(raw)
    }

    pub fn as_ulid(self) -> Ulid {
        self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Name of a task type; the key into the registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskName(String);

impl TaskName {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Opaque broker handle required to ack/nack/extend a delivery.
///
/// Valid from dequeue until the first terminal operation; its contents are
/// meaningful only to the adapter that issued it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Receipt(String);

impl Receipt {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Receipt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
