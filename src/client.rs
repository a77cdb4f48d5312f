//! Client proxy - remote calls as `service.method(args)`.
//!
//! A [`Client`] owns the shared broker connection and hands out [`Service`]
//! handles. Every call runs as a fresh [`Method`]:
//! 1. Generate a correlation id
//! 2. Open a channel and declare an exclusive, auto-delete reply queue
//! 3. Start consuming the reply queue
//! 4. Publish the call to the service exchange, routing key = method name
//! 5. Wait for the first reply carrying our correlation id
//! 6. Ack it, close the channel, return the value or raise the remote failure
//!
//! The channel is closed on every exit path, including errors and cancellation.
//!
//! # Example
//!
//! ```ignore
//! use leafwire::{CallEnvelope, Client, MemoryBroker};
//!
//! let client = Client::new(broker.clone());
//! let math = client.service("math");
//!
//! let sum: i64 = math.invoke("add", &(2, 3)).await?;
//! let value = math.call("add", CallEnvelope::new().arg(2).arg(3)).await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::broker::{
    ChannelGuard, Connection, Delivery, DeliveryStream, MessageProperties, QueueOptions,
};
use crate::envelope::{CallEnvelope, CorrelationId, ResultEnvelope};
use crate::error::{LeafwireError, Result};

/// Client configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientConfig {
    /// Deadline for a single call. `None` waits for the reply indefinitely.
    pub call_timeout: Option<Duration>,
}

/// Builder for configuring and creating a [`Client`].
pub struct ClientBuilder {
    connection: Arc<dyn Connection>,
    config: ClientConfig,
}

impl ClientBuilder {
    /// Set a client-side deadline for every call.
    ///
    /// Default: none. A call without a reply then waits until the caller drops it.
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.config.call_timeout = Some(timeout);
        self
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the client.
    pub fn build(self) -> Client {
        Client {
            connection: self.connection,
            config: self.config,
        }
    }
}

/// RPC session over one shared broker connection.
#[derive(Clone)]
pub struct Client {
    connection: Arc<dyn Connection>,
    config: ClientConfig,
}

impl Client {
    /// Create a client with the default configuration.
    pub fn new(connection: impl Connection) -> Self {
        Self::builder(connection).build()
    }

    /// Create a new client builder.
    pub fn builder(connection: impl Connection) -> ClientBuilder {
        Self::builder_shared(Arc::new(connection))
    }

    /// Create a new client builder over an already shared connection.
    pub fn builder_shared(connection: Arc<dyn Connection>) -> ClientBuilder {
        ClientBuilder {
            connection,
            config: ClientConfig::default(),
        }
    }

    /// Active configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Handle for the remote service (leaf) `name`.
    pub fn service(&self, name: &str) -> Service {
        Service {
            name: Arc::from(name),
            connection: self.connection.clone(),
            call_timeout: self.config.call_timeout,
        }
    }

    /// Call `service.method` with the given arguments.
    pub async fn call(&self, service: &str, method: &str, call: CallEnvelope) -> Result<Value> {
        self.service(service).call(method, call).await
    }
}

/// Handle for one remote service.
///
/// Stateless beyond its name and the shared connection; cheap to clone.
#[derive(Clone)]
pub struct Service {
    name: Arc<str>,
    connection: Arc<dyn Connection>,
    call_timeout: Option<Duration>,
}

impl Service {
    /// Service name (the exchange calls are published to).
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Override the client-side deadline for calls made through this handle.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Prepare a single invocation of `method`.
    pub fn method(&self, name: &str) -> Method {
        Method {
            name: name.to_string(),
            service: self.clone(),
            correlation_id: CorrelationId::new(),
        }
    }

    /// Call `method` with a prepared envelope.
    pub async fn call(&self, method: &str, call: CallEnvelope) -> Result<Value> {
        self.method(method).invoke(call).await
    }

    /// Call `method` with typed arguments and decode the typed result.
    ///
    /// Tuples are sent as positional arguments and structs as keyword arguments
    /// (see [`CallEnvelope::from_args`]).
    pub async fn invoke<A, R>(&self, method: &str, args: &A) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let value = self.call(method, CallEnvelope::from_args(args)?).await?;
        Ok(serde_json::from_value(value)?)
    }
}

/// One in-flight call. Never reused: [`Method::invoke`] consumes it.
pub struct Method {
    name: String,
    service: Service,
    correlation_id: CorrelationId,
}

impl Method {
    /// Method name (the routing key).
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Correlation id this call will carry.
    #[inline]
    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    /// Perform the call and wait for its result.
    ///
    /// # Errors
    ///
    /// - [`LeafwireError::Connectivity`] if the broker is unreachable
    /// - [`LeafwireError::Remote`] if the handler failed, timed out or replied
    ///   with a malformed envelope
    /// - [`LeafwireError::CallTimeout`] if a client-side deadline is configured
    ///   and expires
    pub async fn invoke(self, call: CallEnvelope) -> Result<Value> {
        match self.service.call_timeout {
            Some(limit) => match tokio::time::timeout(limit, self.exchange(&call)).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::warn!(
                        service = self.service.name(),
                        method = %self.name,
                        correlation_id = %self.correlation_id,
                        "Call timed out on the client"
                    );
                    Err(LeafwireError::CallTimeout(limit))
                }
            },
            None => self.exchange(&call).await,
        }
    }

    async fn exchange(&self, call: &CallEnvelope) -> Result<Value> {
        let body = Bytes::from(call.encode()?);

        let channel = ChannelGuard::new(self.service.connection.open_channel().await?);
        let reply_queue = channel.declare_queue("", QueueOptions::reply()).await?;
        let mut replies = channel.consume(&reply_queue).await?;

        channel
            .publish(
                self.service.name(),
                &self.name,
                body,
                MessageProperties::request(self.correlation_id.as_str(), &reply_queue),
            )
            .await?;
        tracing::trace!(
            service = self.service.name(),
            method = %self.name,
            correlation_id = %self.correlation_id,
            "Call published"
        );

        let reply = next_reply(&mut replies, &self.correlation_id).await?;
        if let Err(e) = reply.ack().await {
            tracing::warn!(correlation_id = %self.correlation_id, "Failed to ack reply: {}", e);
        }
        drop(replies);
        if let Err(e) = channel.close().await {
            tracing::warn!(correlation_id = %self.correlation_id, "Failed to close call channel: {}", e);
        }

        match ResultEnvelope::decode(&reply.body) {
            Ok(envelope) => envelope.into_result(),
            Err(e) => Err(LeafwireError::Remote(e.to_string())),
        }
    }
}

/// Wait for the first delivery carrying `correlation_id`.
///
/// Deliveries for other ids are acked and discarded.
async fn next_reply(replies: &mut DeliveryStream, correlation_id: &CorrelationId) -> Result<Delivery> {
    while let Some(next) = replies.next().await {
        let delivery = next?;
        if delivery.properties.correlation_id.as_deref() == Some(correlation_id.as_str()) {
            return Ok(delivery);
        }

        tracing::warn!(
            expected = %correlation_id,
            received = ?delivery.properties.correlation_id,
            "Discarding reply with foreign correlation id"
        );
        delivery.ack().await?;
    }

    Err(LeafwireError::ChannelClosed)
}
