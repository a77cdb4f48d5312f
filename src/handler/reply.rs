//! Reply addressing for inbound calls.
//!
//! Every request carries a `reply_to` queue and a correlation id. The
//! [`ReplyContext`] captures both and publishes the [`ResultEnvelope`] through the
//! default exchange, which routes it straight to the caller's reply queue.

use bytes::Bytes;

use crate::broker::{Channel, MessageProperties, DEFAULT_EXCHANGE};
use crate::envelope::{CorrelationId, ResultEnvelope};
use crate::error::Result;

/// Where and under which correlation id a reply must be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyContext {
    correlation_id: CorrelationId,
    reply_to: String,
}

impl ReplyContext {
    /// Create a reply context.
    pub fn new(correlation_id: CorrelationId, reply_to: impl Into<String>) -> Self {
        Self {
            correlation_id,
            reply_to: reply_to.into(),
        }
    }

    /// Extract the reply address from request properties.
    ///
    /// Returns `None` if either the correlation id or `reply_to` is missing.
    pub fn from_properties(properties: &MessageProperties) -> Option<Self> {
        let correlation_id = properties.correlation_id.as_deref()?;
        let reply_to = properties.reply_to.as_deref()?;
        Some(Self::new(correlation_id.into(), reply_to))
    }

    /// Correlation id of the request.
    #[inline]
    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    /// Queue awaiting the reply.
    #[inline]
    pub fn reply_to(&self) -> &str {
        &self.reply_to
    }

    /// Publish `envelope` to the caller.
    pub async fn respond(&self, channel: &dyn Channel, envelope: &ResultEnvelope) -> Result<()> {
        let body = envelope.encode()?;
        channel
            .publish(
                DEFAULT_EXCHANGE,
                &self.reply_to,
                Bytes::from(body),
                MessageProperties::reply(self.correlation_id.as_str()),
            )
            .await
    }
}
