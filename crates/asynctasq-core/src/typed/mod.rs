//! Typed - 型付き Task API
//!
//! This module removes task-name typos from the picture: a `Task` pairs a
//! name constant with concrete argument/output types, and registration
//! statically ties a `Handler<T>` to it.
//!
//! # 二層構造
//! - **表層（Typed）**: `Task` trait, `Handler<T>` trait - 型安全
//! - **内部（Dyn）**: `DynHandler` trait - object-safe, type erasure

pub mod task;
pub mod handler;
pub mod registry;
pub mod codec;

pub use self::codec::JsonSerializer;
pub use self::handler::{DynHandler, Handler, HandlerError, TypedHandler};
pub use self::registry::{RegistryError, TaskEntry, TaskRegistry};
pub use self::task::{Task, TaskPolicy};

use chrono::{DateTime, Utc};

use crate::domain::{TaskEnvelope, TaskName};
use crate::ports::serializer::{CallArgs, CodecError, Serializer};

/// Build an enqueue-ready envelope for `T` with `T`'s policy applied.
///
/// This is the producer-side helper used by tests and the demo binary; a
/// full producer API lives outside this crate and only needs to agree on
/// the payload encoding.
pub fn make_envelope<T: Task>(
    args: &T::Args,
    queue: impl Into<String>,
    serializer: &dyn Serializer,
    now: DateTime<Utc>,
) -> Result<TaskEnvelope, CodecError> {
    let value = serde_json::to_value(args).map_err(|e| CodecError::Encode(e.to_string()))?;
    let payload = serializer.encode(&CallArgs::positional(vec![value]))?;

    let policy = T::policy();
    let mut envelope = TaskEnvelope::new(TaskName::new(T::NAME), queue, payload, now)
        .with_max_attempts(policy.max_attempts)
        .with_retry(policy.retry_strategy, policy.retry_delay_base);
    envelope.timeout = policy.timeout;
    Ok(envelope)
}
