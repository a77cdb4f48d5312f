//! Broker abstraction - the narrow AMQP-style surface leafwire depends on.
//!
//! The broker knows nothing about envelopes. It declares exchanges and queues,
//! routes opaque bodies by routing key and hands out deliveries that must be
//! acknowledged.
//!
//! Implementations:
//! - [`MemoryBroker`] - in-process broker used by tests and single-process setups
//! - `AmqpConnection` - RabbitMQ through `lapin` (feature `amqp`)
//!
//! Both traits are object safe; the client and the container only ever hold
//! `Arc<dyn Connection>` / `Arc<dyn Channel>`.

#[cfg(feature = "amqp")]
mod amqp;
mod memory;

#[cfg(feature = "amqp")]
pub use amqp::AmqpConnection;
pub use memory::MemoryBroker;

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use bytes::Bytes;
use futures::stream::BoxStream;

use crate::error::Result;

/// Name of the default exchange. Publishing to it routes directly to the queue
/// whose name equals the routing key.
pub const DEFAULT_EXCHANGE: &str = "";

/// Stream of deliveries from one consumer registration.
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// Metadata carried by every request and reply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    /// Token joining a request to its reply.
    pub correlation_id: Option<String>,
    /// Queue that should receive the reply (requests only).
    pub reply_to: Option<String>,
}

impl MessageProperties {
    /// Properties for a request expecting a reply on `reply_to`.
    pub fn request(correlation_id: &str, reply_to: &str) -> Self {
        Self {
            correlation_id: Some(correlation_id.to_string()),
            reply_to: Some(reply_to.to_string()),
        }
    }

    /// Properties for a reply.
    pub fn reply(correlation_id: &str) -> Self {
        Self {
            correlation_id: Some(correlation_id.to_string()),
            reply_to: None,
        }
    }
}

/// Queue declaration flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueOptions {
    /// Survives a broker restart.
    pub durable: bool,
    /// Usable only by the declaring channel's connection.
    pub exclusive: bool,
    /// Deleted once its last consumer goes away.
    pub auto_delete: bool,
}

impl QueueOptions {
    /// Durable, shared queue for a remotely callable method.
    pub fn method() -> Self {
        Self {
            durable: true,
            exclusive: false,
            auto_delete: false,
        }
    }

    /// Ephemeral, exclusive queue receiving the reply of a single call.
    pub fn reply() -> Self {
        Self {
            durable: false,
            exclusive: true,
            auto_delete: true,
        }
    }
}

/// Acknowledges a delivery back to the broker.
#[async_trait::async_trait]
pub trait Acknowledge: Send + Sync {
    /// Acknowledge the delivery; the broker forgets the message.
    async fn ack(&self) -> Result<()>;
}

/// A message handed to a consumer.
pub struct Delivery {
    /// Message body.
    pub body: Bytes,
    /// Message metadata.
    pub properties: MessageProperties,
    /// Whether the broker delivered this message before without an ack.
    pub redelivered: bool,
    acker: Box<dyn Acknowledge>,
}

impl Delivery {
    /// Create a delivery with its broker-specific acknowledger.
    pub fn new(
        body: Bytes,
        properties: MessageProperties,
        redelivered: bool,
        acker: Box<dyn Acknowledge>,
    ) -> Self {
        Self {
            body,
            properties,
            redelivered,
            acker,
        }
    }

    /// Acknowledge this delivery.
    pub async fn ack(&self) -> Result<()> {
        self.acker.ack().await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("body_len", &self.body.len())
            .field("properties", &self.properties)
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

/// A connection to a broker; channels are opened on top of it.
#[async_trait::async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Open a new channel.
    ///
    /// Fails with [`LeafwireError::Connectivity`](crate::LeafwireError::Connectivity)
    /// when the broker is unreachable.
    async fn open_channel(&self) -> Result<Arc<dyn Channel>>;
}

/// A channel - the unit owning consumers, exclusive queues and prefetch state.
#[async_trait::async_trait]
pub trait Channel: Send + Sync + 'static {
    /// Declare a direct exchange. Re-declaring an existing exchange is a no-op.
    async fn declare_exchange(&self, name: &str) -> Result<()>;

    /// Declare a queue and return its name.
    ///
    /// An empty name asks the broker to generate one. Re-declaring an existing
    /// queue with different options fails.
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<String>;

    /// Bind `queue` to `exchange` for messages published with `routing_key`.
    async fn bind(&self, exchange: &str, queue: &str, routing_key: &str) -> Result<()>;

    /// Publish a message.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Bytes,
        properties: MessageProperties,
    ) -> Result<()>;

    /// Start consuming a queue.
    async fn consume(&self, queue: &str) -> Result<DeliveryStream>;

    /// Limit the number of unacknowledged deliveries in flight on this channel.
    ///
    /// Must be called before [`Channel::consume`].
    async fn set_prefetch(&self, count: u16) -> Result<()>;

    /// Close the channel, cancelling its consumers and deleting its exclusive queues.
    async fn close(&self) -> Result<()>;
}

/// Guard that closes a channel on every exit path.
///
/// [`ChannelGuard::close`] closes it explicitly and reports errors. If the guard is
/// dropped first (early return, error, cancelled future) the close runs on a
/// spawned task instead.
pub struct ChannelGuard {
    channel: Option<Arc<dyn Channel>>,
}

impl ChannelGuard {
    /// Take ownership of `channel`.
    pub fn new(channel: Arc<dyn Channel>) -> Self {
        Self {
            channel: Some(channel),
        }
    }

    /// A shared handle to the guarded channel.
    pub fn shared(&self) -> Arc<dyn Channel> {
        match &self.channel {
            Some(channel) => channel.clone(),
            None => unreachable!("channel is only taken by close or drop"),
        }
    }

    /// Close the channel now.
    pub async fn close(mut self) -> Result<()> {
        match self.channel.take() {
            Some(channel) => channel.close().await,
            None => Ok(()),
        }
    }
}

impl Deref for ChannelGuard {
    type Target = dyn Channel;

    fn deref(&self) -> &Self::Target {
        match &self.channel {
            Some(channel) => channel.as_ref(),
            None => unreachable!("channel is only taken by close or drop"),
        }
    }
}

impl Drop for ChannelGuard {
    fn drop(&mut self) {
        let Some(channel) = self.channel.take() else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = channel.close().await {
                        tracing::debug!("Deferred channel close failed: {}", e);
                    }
                });
            }
            Err(_) => tracing::warn!("Channel dropped outside a runtime; not closed"),
        }
    }
}
