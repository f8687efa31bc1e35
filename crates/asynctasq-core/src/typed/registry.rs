//! TaskRegistry - Handler の登録と管理
//!
//! Built during initialization (mutable), used during runtime (immutable,
//! behind `Arc`). No locks: registration is expected to be complete before
//! the worker starts, and the worker enforces that through its builder.

use std::collections::HashMap;
use std::sync::Arc;

use super::handler::{DynHandler, Handler, TypedHandler};
use super::task::{Task, TaskPolicy};

/// Everything the dispatcher needs to run one task type.
#[derive(Clone)]
pub struct TaskEntry {
    pub handler: Arc<dyn DynHandler>,
    pub policy: TaskPolicy,
    pub cpu_bound: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("handler for task '{0}' is already registered")]
    AlreadyRegistered(String),
}

/// task_name -> handler + policy.
#[derive(Default)]
pub struct TaskRegistry {
    entries: HashMap<String, TaskEntry>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self { entries: HashMap::new() }
    }

    /// Register a handler for `T`, capturing `T`'s policy and CPU-bound
    /// flag. Duplicate names are an error: silently replacing a handler
    /// in a worker that is about to start is never what anyone wants.
    pub fn register<T: Task, H: Handler<T> + 'static>(
        &mut self,
        handler: H,
    ) -> Result<(), RegistryError> {
        let name = T::NAME.to_string();
        if self.entries.contains_key(&name) {
            return Err(RegistryError::AlreadyRegistered(name));
        }
        self.entries.insert(
            name,
            TaskEntry {
                handler: Arc::new(TypedHandler::new(handler)),
                policy: T::policy(),
                cpu_bound: T::cpu_bound(),
            },
        );
        Ok(())
    }

    pub fn get(&self, task_name: &str) -> Option<&TaskEntry> {
        self.entries.get(task_name)
    }

    pub fn registered_names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::typed::handler::HandlerError;
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    #[derive(Debug, Serialize, Deserialize)]
    struct NoArgs {}

    struct Ping;

    impl Task for Ping {
        const NAME: &'static str = "demo.ping";
        type Args = NoArgs;
        type Output = String;
    }

    struct Crunch;

    impl Task for Crunch {
        const NAME: &'static str = "demo.crunch";
        type Args = NoArgs;
        type Output = u64;

        fn policy() -> TaskPolicy {
            TaskPolicy { max_attempts: 7, timeout: Some(Duration::from_secs(120)), ..TaskPolicy::default() }
        }

        fn cpu_bound() -> bool {
            true
        }
    }

    struct NoopHandler;

    #[async_trait]
    impl Handler<Ping> for NoopHandler {
        async fn handle(&self, _args: NoArgs) -> Result<String, HandlerError> {
            Ok("pong".into())
        }
    }

    #[async_trait]
    impl Handler<Crunch> for NoopHandler {
        async fn handle(&self, _args: NoArgs) -> Result<u64, HandlerError> {
            Ok(0)
        }
    }

    #[test]
    fn register_and_get() {
        let mut registry = TaskRegistry::new();
        registry.register::<Ping, _>(NoopHandler).unwrap();

        let entry = registry.get("demo.ping").unwrap();
        assert!(!entry.cpu_bound);
        assert_eq!(entry.policy.max_attempts, 3);
        assert!(registry.get("demo.unknown").is_none());
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = TaskRegistry::new();
        registry.register::<Ping, _>(NoopHandler).unwrap();
        let err = registry.register::<Ping, _>(NoopHandler).unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyRegistered(name) if name == "demo.ping"));
    }

    #[test]
    fn entry_carries_policy_and_cpu_flag() {
        let mut registry = TaskRegistry::new();
        registry.register::<Crunch, _>(NoopHandler).unwrap();

        let entry = registry.get("demo.crunch").unwrap();
        assert!(entry.cpu_bound);
        assert_eq!(entry.policy.max_attempts, 7);
        assert_eq!(entry.policy.timeout, Some(Duration::from_secs(120)));

        let mut names = registry.registered_names();
        names.sort();
        assert_eq!(names, ["demo.crunch"]);
    }
}
