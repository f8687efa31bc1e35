//! Domain model (ids, envelope, outcomes, retry, worker state, events).

pub mod ids;
pub mod envelope;
pub mod outcome;
pub mod retry;
pub mod decision;
pub mod state;
pub mod events;

pub use self::decision::{Decider, Decision, DefaultDecider};
pub use self::envelope::TaskEnvelope;
pub use self::events::WorkerEvent;
pub use self::ids::{Receipt, TaskId, TaskName};
pub use self::outcome::{ErrorKind, TaskError, TaskOutcome};
pub use self::retry::{RetryPolicy, RetryStrategy};
pub use self::state::WorkerState;
