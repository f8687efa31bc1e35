//! Worker state machine.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a worker process.
///
/// State transitions:
/// - Starting -> Running (broker connected, registry loaded, signals installed)
/// - Running -> Draining (signal, max_tasks reached, or unrecoverable poll error)
/// - Draining -> Stopped (in-flight empty, pool drained, broker disconnected)
///
/// The machine only moves forward; `can_advance_to` rejects regressions so a
/// late "go back to running" bug cannot resurrect a draining worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Starting,
    Running,
    Draining,
    Stopped,
}

impl WorkerState {
    fn rank(self) -> u8 {
        match self {
            WorkerState::Starting => 0,
            WorkerState::Running => 1,
            WorkerState::Draining => 2,
            WorkerState::Stopped => 3,
        }
    }

    /// Strictly-forward transition check.
    pub fn can_advance_to(self, next: WorkerState) -> bool {
        next.rank() > self.rank()
    }

    pub fn at_least(self, other: WorkerState) -> bool {
        self.rank() >= other.rank()
    }

    pub fn is_running(self) -> bool {
        self == WorkerState::Running
    }

    pub fn is_terminal(self) -> bool {
        self == WorkerState::Stopped
    }
}
