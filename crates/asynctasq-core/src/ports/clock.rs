//! Clock port - 時刻の抽象化 + cancellable sleep.
//!
//! The trait exists for test容易性: production uses `SystemClock`, tests
//! swap in `FixedClock` and drive visibility deadlines by hand. `Sleeper`
//! is the one place the worker sleeps; every sleep is cancellable by the
//! shutdown state so a stopping worker never waits out an empty-queue nap.

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use crate::domain::WorkerState;

/// Provides the current wall-clock time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Test clock: starts at a fixed instant, moves only when told to.
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(start) }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *now = *now + chrono::TimeDelta::from_std(by).unwrap_or(chrono::TimeDelta::zero());
    }

    pub fn set(&self, to: DateTime<Utc>) {
        let mut now = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *now = to;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Sleeps that end early when the worker begins draining.
#[derive(Debug, Clone)]
pub struct Sleeper {
    state: watch::Receiver<WorkerState>,
}

impl Sleeper {
    pub fn new(state: watch::Receiver<WorkerState>) -> Self {
        Self { state }
    }

    /// Sleep for `duration`. Returns `true` if the full duration elapsed,
    /// `false` if shutdown interrupted it.
    pub async fn sleep(&mut self, duration: Duration) -> bool {
        if self.state.borrow().at_least(WorkerState::Draining) {
            return false;
        }
        let sleep = tokio::time::sleep(duration);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                changed = self.state.changed() => {
                    // sender dropped も shutdown 扱い
                    if changed.is_err() || self.state.borrow().at_least(WorkerState::Draining) {
                        return false;
                    }
                }
            }
        }
    }
}
