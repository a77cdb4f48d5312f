//! # leafwire
//!
//! Remote procedure calls over an AMQP-style message broker.
//!
//! Servers group functions into named [`Leaf`]s and host them in a
//! [`Container`]. Clients call them through a [`Client`] as if they were local:
//! `client.service("math").invoke("add", &(2, 3))`.
//!
//! ## Architecture
//!
//! - **Topology**: every leaf is a direct exchange, every method a durable queue
//!   bound to it under the method name
//! - **Calls**: MsgPack `{args, kwargs}` published with a correlation id and a
//!   private reply queue
//! - **Replies**: MsgPack `{status, result}` published back through the default
//!   exchange, then the request is acked (at-least-once)
//!
//! The broker is abstracted behind [`Connection`] and [`Channel`].
//! [`MemoryBroker`] runs everything in-process; the `amqp` feature adds a
//! RabbitMQ backend.
//!
//! ## Example
//!
//! ```ignore
//! use leafwire::{Client, Container, Leaf, MemoryBroker};
//!
//! #[tokio::main]
//! async fn main() -> leafwire::Result<()> {
//!     let broker = MemoryBroker::new();
//!
//!     let mut math = Leaf::new("math");
//!     math.register("add", |(a, b): (i64, i64)| async move { Ok::<_, String>(a + b) }, None);
//!
//!     let container = Container::builder().leaf(math).build();
//!     let serving = container.serve(&broker).await?;
//!
//!     let client = Client::new(broker.clone());
//!     let sum: i64 = client.service("math").invoke("add", &(2, 3)).await?;
//!     assert_eq!(sum, 5);
//!
//!     serving.shutdown().await
//! }
//! ```

pub mod broker;
pub mod client;
pub mod codec;
pub mod container;
pub mod envelope;
pub mod error;
pub mod handler;
pub mod leaf;
pub mod pool;

#[cfg(feature = "amqp")]
pub use broker::AmqpConnection;
pub use broker::{Channel, Connection, MemoryBroker};
pub use client::{Client, ClientBuilder, ClientConfig, Method, Service};
pub use container::{Container, ContainerBuilder, ContainerConfig, ServeHandle};
pub use envelope::{CallEnvelope, CorrelationId, ResultEnvelope};
pub use error::{LeafwireError, Result};
pub use leaf::Leaf;
pub use pool::WorkerPool;
