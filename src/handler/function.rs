//! Type-erased handler functions.
//!
//! A [`Handler`] turns a [`CallEnvelope`] into either a return value or a failure
//! description. [`AsyncHandler`] and [`BlockingHandler`] adapt ordinary Rust
//! functions: arguments are decoded with [`CallEnvelope::decode_args`], the return
//! value is serialized to a [`Value`], and an `Err(e)` becomes
//! `"<ErrorType>: <e>"`.

use std::fmt::Display;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::envelope::CallEnvelope;
use crate::pool::WorkerPool;

/// Boxed future for handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Outcome of a handler: the return value or a failure description.
pub type HandlerOutcome = std::result::Result<Value, String>;

/// Trait for remotely callable functions.
pub trait Handler: Send + Sync + 'static {
    /// Run the function for one call.
    ///
    /// `pool` is the container's worker pool, for handlers that must not run on
    /// the async runtime.
    fn call(&self, call: CallEnvelope, pool: &WorkerPool) -> BoxFuture<'static, HandlerOutcome>;
}

/// Last path segment of a type name, without generic arguments.
pub(crate) fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

/// Failure description for a handler error: `"<ErrorType>: <message>"`.
pub fn describe_error<E: Display>(error: &E) -> String {
    format!("{}: {}", short_type_name::<E>(), error)
}

fn invalid_arguments(error: crate::LeafwireError) -> String {
    format!("TypeError: invalid arguments: {}", error)
}

fn encode_return<R: Serialize>(value: R) -> HandlerOutcome {
    serde_json::to_value(value).map_err(|e| format!("SerializationError: {}", e))
}

/// Adapter for `async fn(T) -> Result<R, E>`.
pub struct AsyncHandler<F, T, Fut, R, E> {
    function: F,
    _phantom: PhantomData<fn(T) -> (Fut, R, E)>,
}

impl<F, T, Fut, R, E> AsyncHandler<F, T, Fut, R, E>
where
    F: Fn(T) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
    R: Serialize + 'static,
    E: Display + 'static,
{
    /// Wrap an async function.
    pub fn new(function: F) -> Self {
        Self {
            function,
            _phantom: PhantomData,
        }
    }
}

impl<F, T, Fut, R, E> Handler for AsyncHandler<F, T, Fut, R, E>
where
    F: Fn(T) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
    R: Serialize + 'static,
    E: Display + 'static,
{
    fn call(&self, call: CallEnvelope, _pool: &WorkerPool) -> BoxFuture<'static, HandlerOutcome> {
        let args: T = match call.decode_args() {
            Ok(args) => args,
            Err(e) => return Box::pin(async move { Err(invalid_arguments(e)) }),
        };

        let fut = (self.function)(args);
        Box::pin(async move {
            match fut.await {
                Ok(value) => encode_return(value),
                Err(e) => Err(describe_error(&e)),
            }
        })
    }
}

/// Adapter for a synchronous `fn(T) -> Result<R, E>` run on the worker pool.
pub struct BlockingHandler<F, T, R, E> {
    function: Arc<F>,
    _phantom: PhantomData<fn(T) -> (R, E)>,
}

impl<F, T, R, E> BlockingHandler<F, T, R, E>
where
    F: Fn(T) -> std::result::Result<R, E> + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    E: Display + Send + 'static,
{
    /// Wrap a blocking function.
    pub fn new(function: F) -> Self {
        Self {
            function: Arc::new(function),
            _phantom: PhantomData,
        }
    }
}

impl<F, T, R, E> Handler for BlockingHandler<F, T, R, E>
where
    F: Fn(T) -> std::result::Result<R, E> + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    E: Display + Send + 'static,
{
    fn call(&self, call: CallEnvelope, pool: &WorkerPool) -> BoxFuture<'static, HandlerOutcome> {
        let args: T = match call.decode_args() {
            Ok(args) => args,
            Err(e) => return Box::pin(async move { Err(invalid_arguments(e)) }),
        };

        let function = self.function.clone();
        let pool = pool.clone();
        Box::pin(async move {
            // Describe the error on the worker so E never crosses threads unrendered.
            let outcome = pool
                .submit(move || match function(args) {
                    Ok(value) => encode_return(value),
                    Err(e) => Err(describe_error(&e)),
                })
                .await;

            match outcome {
                Ok(outcome) => outcome,
                Err(crate::LeafwireError::WorkerPanicked(msg)) => Err(format!("panic: {}", msg)),
                Err(e) => Err(format!("WorkerError: {}", e)),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fmt;

    #[derive(Debug)]
    struct DivisionByZero;

    impl fmt::Display for DivisionByZero {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("division by zero")
        }
    }

    async fn divide((a, b): (i64, i64)) -> Result<i64, DivisionByZero> {
        if b == 0 {
            return Err(DivisionByZero);
        }
        Ok(a / b)
    }

    #[test]
    fn test_short_type_name() {
        assert_eq!(short_type_name::<DivisionByZero>(), "DivisionByZero");
        assert_eq!(short_type_name::<std::io::Error>(), "Error");
        assert_eq!(short_type_name::<Vec<String>>(), "Vec");
        assert_eq!(short_type_name::<u8>(), "u8");
    }

    #[test]
    fn test_describe_error_includes_type_and_message() {
        assert_eq!(
            describe_error(&DivisionByZero),
            "DivisionByZero: division by zero"
        );
    }

    #[tokio::test]
    async fn test_async_handler_success_and_error() {
        let handler = AsyncHandler::new(divide);
        let pool = WorkerPool::new(1);

        let ok = handler
            .call(CallEnvelope::new().arg(6).arg(3), &pool)
            .await;
        assert_eq!(ok, Ok(json!(2)));

        let err = handler
            .call(CallEnvelope::new().arg(1).arg(0), &pool)
            .await;
        assert_eq!(err, Err("DivisionByZero: division by zero".to_string()));
    }

    #[tokio::test]
    async fn test_invalid_arguments_are_reported() {
        let handler = AsyncHandler::new(divide);
        let pool = WorkerPool::new(1);

        let outcome = handler
            .call(CallEnvelope::new().arg("one"), &pool)
            .await;
        let description = outcome.unwrap_err();
        assert!(description.starts_with("TypeError: invalid arguments"));
    }

    #[tokio::test]
    async fn test_blocking_handler_runs_on_pool() {
        let handler = BlockingHandler::new(|(n,): (u64,)| -> Result<u64, String> {
            Ok((1..=n).product())
        });
        let pool = WorkerPool::new(1);

        let outcome = handler.call(CallEnvelope::new().arg(5), &pool).await;
        assert_eq!(outcome, Ok(json!(120)));
    }

    #[tokio::test]
    async fn test_blocking_handler_panic_is_contained() {
        let handler = BlockingHandler::new(|(): ()| -> Result<(), String> { panic!("worker exploded") });
        let pool = WorkerPool::new(1);

        let outcome = handler.call(CallEnvelope::new(), &pool).await;
        assert_eq!(outcome, Err("panic: worker exploded".to_string()));
    }
}
