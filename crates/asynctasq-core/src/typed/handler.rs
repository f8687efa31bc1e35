//! Handler trait - Task を実行する Handler の定義
//!
//! # 学習ポイント
//! - ジェネリック trait (Handler<T>)
//! - Object-safe trait (DynHandler)
//! - Type erasure パターン (TypedHandler<T, H> → DynHandler)

use std::fmt;
use std::marker::PhantomData;

use async_trait::async_trait;

use super::task::Task;
use crate::domain::TaskError;
use crate::ports::serializer::CallArgs;

/// Failure raised by user task code.
///
/// `retriable` is the task author's signal to the retry engine: a parse
/// error in the input will not fix itself, a flaky downstream call might.
#[derive(Debug, Clone)]
pub struct HandlerError {
    pub message: String,
    pub retriable: bool,
    pub traceback: Option<String>,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), retriable: true, traceback: None }
    }

    /// Fail without further attempts; goes straight to the dead-letter
    /// queue.
    pub fn do_not_retry(message: impl Into<String>) -> Self {
        Self { message: message.into(), retriable: false, traceback: None }
    }

    pub fn with_traceback(mut self, traceback: impl Into<String>) -> Self {
        self.traceback = Some(traceback.into());
        self
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for HandlerError {}

/// Executes one task type.
///
/// # 使用例
/// ```ignore
/// struct ChargeHandler { client: BillingClient }
///
/// #[async_trait]
/// impl Handler<Charge> for ChargeHandler {
///     async fn handle(&self, args: ChargeArgs) -> Result<String, HandlerError> {
///         self.client.charge(&args.account, args.cents).await
///             .map_err(|e| HandlerError::new(e.to_string()))
///     }
/// }
/// ```
#[async_trait]
pub trait Handler<T: Task>: Send + Sync {
    async fn handle(&self, args: T::Args) -> Result<T::Output, HandlerError>;
}

/// Object-safe erasure of `Handler<T>`, so the registry can hold
/// `Arc<dyn DynHandler>` for heterogeneous task types.
///
/// Decoding the typed arguments and encoding the typed output both happen
/// inside the erasure wrapper; failures there are serialization errors, not
/// user errors, and are therefore non-retriable.
#[async_trait]
pub trait DynHandler: Send + Sync {
    async fn handle_dyn(&self, call: CallArgs) -> Result<Vec<u8>, TaskError>;

    fn task_name(&self) -> &'static str;
}

pub struct TypedHandler<T: Task, H: Handler<T>> {
    handler: H,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Task, H: Handler<T>> TypedHandler<T, H> {
    pub fn new(handler: H) -> Self {
        Self { handler, _marker: PhantomData }
    }
}

#[async_trait]
impl<T: Task, H: Handler<T>> DynHandler for TypedHandler<T, H> {
    async fn handle_dyn(&self, call: CallArgs) -> Result<Vec<u8>, TaskError> {
        let value = call
            .args
            .into_iter()
            .next()
            .ok_or_else(|| TaskError::serialization("payload carries no arguments"))?;
        let args: T::Args = serde_json::from_value(value)
            .map_err(|e| TaskError::serialization(format!("argument decode: {e}")))?;

        match self.handler.handle(args).await {
            Ok(output) => serde_json::to_vec(&output)
                .map_err(|e| TaskError::serialization(format!("result encode: {e}"))),
            Err(err) => {
                let mut task_error = if err.retriable {
                    TaskError::user(err.message)
                } else {
                    TaskError::do_not_retry(err.message)
                };
                task_error.traceback = err.traceback;
                Err(task_error)
            }
        }
    }

    fn task_name(&self) -> &'static str {
        T::NAME
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ErrorKind;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize)]
    struct AddArgs {
        a: i64,
        b: i64,
    }

    struct Add;

    impl Task for Add {
        const NAME: &'static str = "demo.add";
        type Args = AddArgs;
        type Output = i64;
    }

    struct AddHandler;

    #[async_trait]
    impl Handler<Add> for AddHandler {
        async fn handle(&self, args: AddArgs) -> Result<i64, HandlerError> {
            Ok(args.a + args.b)
        }
    }

    struct RefusingHandler;

    #[async_trait]
    impl Handler<Add> for RefusingHandler {
        async fn handle(&self, _args: AddArgs) -> Result<i64, HandlerError> {
            Err(HandlerError::do_not_retry("bad account"))
        }
    }

    #[tokio::test]
    async fn typed_handler_decodes_runs_and_encodes() {
        let handler = TypedHandler::<Add, _>::new(AddHandler);
        let call = CallArgs::positional(vec![json!({"a": 2, "b": 3})]);

        let bytes = handler.handle_dyn(call).await.unwrap();
        let result: i64 = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(result, 5);
        assert_eq!(handler.task_name(), "demo.add");
    }

    #[tokio::test]
    async fn undecodable_arguments_are_a_serialization_error() {
        let handler = TypedHandler::<Add, _>::new(AddHandler);
        let call = CallArgs::positional(vec![json!("definitely not AddArgs")]);

        let err = handler.handle_dyn(call).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Serialization);
    }

    #[tokio::test]
    async fn missing_arguments_are_a_serialization_error() {
        let handler = TypedHandler::<Add, _>::new(AddHandler);
        let err = handler.handle_dyn(CallArgs::empty()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Serialization);
    }

    #[tokio::test]
    async fn do_not_retry_maps_to_the_non_retriable_kind() {
        let handler = TypedHandler::<Add, _>::new(RefusingHandler);
        let call = CallArgs::positional(vec![json!({"a": 1, "b": 1})]);

        let err = handler.handle_dyn(call).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::DoNotRetry);
        assert!(!err.is_retriable());
    }
}
