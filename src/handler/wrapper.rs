//! Execution of one registered method per inbound delivery.
//!
//! For every delivery the wrapper produces exactly one [`ResultEnvelope`],
//! publishes it to the caller and only then acknowledges the request. Handler
//! errors, panics and timeouts are all turned into `status=false` replies and never
//! escape to the dispatch loop.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;

use super::{Handler, ReplyContext};
use crate::broker::{Channel, Delivery};
use crate::envelope::{CallEnvelope, ResultEnvelope};
use crate::pool::{panic_message, WorkerPool};

/// A registered method: the function plus its execution policy.
#[derive(Clone)]
pub struct HandlerWrapper {
    /// Qualified name, `leaf.method`.
    name: String,
    handler: Arc<dyn Handler>,
    timeout: Option<Duration>,
}

impl HandlerWrapper {
    /// Wrap `handler` under the qualified name `name`.
    pub fn new(name: impl Into<String>, handler: Arc<dyn Handler>, timeout: Option<Duration>) -> Self {
        Self {
            name: name.into(),
            handler,
            timeout,
        }
    }

    /// Qualified method name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Per-call deadline, if any.
    #[inline]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Run the function for one call and capture the outcome.
    pub async fn execute(&self, call: CallEnvelope, pool: &WorkerPool) -> ResultEnvelope {
        // The handler may panic while building its future, not only while polling it.
        let running = AssertUnwindSafe(async { self.handler.call(call, pool).await }).catch_unwind();

        let outcome = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, running).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    tracing::warn!(method = %self.name, ?limit, "Handler timed out");
                    return ResultEnvelope::failure(format!(
                        "TimeoutError: {} exceeded its timeout of {:?}",
                        self.name, limit
                    ));
                }
            },
            None => running.await,
        };

        match outcome {
            Ok(Ok(value)) => ResultEnvelope::success(value),
            Ok(Err(description)) => {
                tracing::debug!(method = %self.name, "Handler failed: {}", description);
                ResultEnvelope::failure(description)
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::error!(method = %self.name, "Handler panicked: {}", message);
                ResultEnvelope::failure(format!("panic: {}", message))
            }
        }
    }

    /// Handle one inbound delivery end to end: decode, execute, reply, ack.
    ///
    /// The delivery is acknowledged only after the reply was published. If
    /// publishing fails it is left unacknowledged so the broker can redeliver it.
    pub async fn handle_delivery(&self, channel: &dyn Channel, delivery: Delivery, pool: &WorkerPool) {
        let Some(reply) = ReplyContext::from_properties(&delivery.properties) else {
            tracing::warn!(
                method = %self.name,
                "Dropping request without reply_to/correlation_id"
            );
            if let Err(e) = delivery.ack().await {
                tracing::error!(method = %self.name, "Failed to ack request: {}", e);
            }
            return;
        };

        if delivery.redelivered {
            tracing::debug!(
                method = %self.name,
                correlation_id = %reply.correlation_id(),
                "Handling redelivered request"
            );
        }

        let envelope = match CallEnvelope::decode(&delivery.body) {
            Ok(call) => self.execute(call, pool).await,
            Err(e) => ResultEnvelope::failure(format!("ProtocolError: {}", e)),
        };

        if let Err(e) = reply.respond(channel, &envelope).await {
            tracing::error!(
                method = %self.name,
                correlation_id = %reply.correlation_id(),
                "Failed to publish reply, leaving request unacked: {}",
                e
            );
            return;
        }

        if let Err(e) = delivery.ack().await {
            tracing::error!(method = %self.name, "Failed to ack request: {}", e);
        }
    }
}

impl fmt::Debug for HandlerWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerWrapper")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .finish()
    }
}
