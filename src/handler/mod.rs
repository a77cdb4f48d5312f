//! Handler module - execution of remotely callable functions.
//!
//! Provides:
//! - [`Handler`] - type-erased function taking a [`CallEnvelope`](crate::CallEnvelope)
//! - [`AsyncHandler`] / [`BlockingHandler`] - adapters for plain Rust functions
//! - [`HandlerWrapper`] - timeout, error capture, reply and ack around one handler
//! - [`ReplyContext`] - where a result must be published
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use leafwire::handler::{AsyncHandler, HandlerWrapper};
//!
//! let add = AsyncHandler::new(|(a, b): (i64, i64)| async move { Ok::<_, String>(a + b) });
//! let wrapper = HandlerWrapper::new("math.add", Arc::new(add), None);
//! let envelope = wrapper.execute(CallEnvelope::new().arg(2).arg(3), &pool).await;
//! ```

mod function;
mod reply;
mod wrapper;

pub use function::{
    describe_error, AsyncHandler, BlockingHandler, BoxFuture, Handler, HandlerOutcome,
};
pub use reply::ReplyContext;
pub use wrapper::HandlerWrapper;
