//! Task trait - 型付き Task の定義
//!
//! # 学習ポイント
//! - Associated Constants (`const NAME`)
//! - Trait bounds の組み合わせ (Serialize + DeserializeOwned + Send)

use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::domain::RetryStrategy;

/// Per-task execution policy, stamped into envelopes at enqueue and used
/// as the registry default at dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskPolicy {
    pub max_attempts: u32,
    pub retry_strategy: RetryStrategy,
    pub retry_delay_base: Duration,

    /// Wall-clock execution limit; `None` leaves the envelope bounded only
    /// by its visibility lease.
    pub timeout: Option<Duration>,

    /// Per-task lease override; `None` falls back to the worker's
    /// `visibility_timeout`.
    pub visibility_timeout: Option<Duration>,
}

impl Default for TaskPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_strategy: RetryStrategy::Exponential,
            retry_delay_base: Duration::from_secs(60),
            timeout: None,
            visibility_timeout: None,
        }
    }
}

/// A task type: a name, typed arguments, a typed output, and a policy.
///
/// # 使用例
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct ChargeArgs { account: String, cents: u64 }
///
/// struct Charge;
///
/// impl Task for Charge {
///     const NAME: &'static str = "billing.charge";
///     type Args = ChargeArgs;
///     type Output = String;
/// }
/// ```
///
/// # Trait Bounds
/// - `Args: Serialize + DeserializeOwned`: payload round-trip
/// - `Output: Serialize`: the success result is stored as encoded bytes
/// - `Send + Sync + 'static`: handlers run on a multi-threaded runtime
pub trait Task: Send + Sync + 'static {
    /// Registry key. 命名規約: `{namespace}.{action}`（例: `billing.charge`）
    const NAME: &'static str;

    type Args: Serialize + DeserializeOwned + Send;
    type Output: Serialize + Send;

    fn policy() -> TaskPolicy {
        TaskPolicy::default()
    }

    /// CPU-bound tasks are routed to the process pool when one is
    /// configured; everything else runs on the async runtime.
    fn cpu_bound() -> bool {
        false
    }
}
