//! In-process broker with AMQP-style semantics.
//!
//! Supports direct exchanges, the default exchange, durable/exclusive/auto-delete
//! queues, competing consumers, per-channel prefetch and redelivery of messages
//! whose delivery was dropped without an ack.
//!
//! # Example
//!
//! ```ignore
//! use leafwire::broker::{Connection, MemoryBroker, QueueOptions};
//!
//! let broker = MemoryBroker::new();
//! let channel = broker.open_channel().await?;
//! let queue = channel.declare_queue("", QueueOptions::reply()).await?;
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::{AbortHandle, JoinHandle};
use uuid::Uuid;

use super::{
    Acknowledge, Channel, Connection, Delivery, DeliveryStream, MessageProperties, QueueOptions,
    DEFAULT_EXCHANGE,
};
use crate::error::{LeafwireError, Result};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A message sitting in a queue.
#[derive(Debug, Clone)]
struct StoredMessage {
    body: Bytes,
    properties: MessageProperties,
    redelivered: bool,
}

struct Queue {
    options: QueueOptions,
    /// Declaring channel, for exclusive queues.
    owner: Option<u64>,
    tx: mpsc::UnboundedSender<StoredMessage>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<StoredMessage>>,
}

impl Queue {
    fn new(options: QueueOptions, owner: Option<u64>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            options,
            owner,
            tx,
            rx: tokio::sync::Mutex::new(rx),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    queue: String,
    routing_key: String,
}

#[derive(Default)]
struct Topology {
    /// Direct exchanges and their bindings.
    exchanges: HashMap<String, Vec<Binding>>,
    queues: HashMap<String, Arc<Queue>>,
}

impl Topology {
    fn remove_queue(&mut self, name: &str) {
        self.queues.remove(name);
        for bindings in self.exchanges.values_mut() {
            bindings.retain(|b| b.queue != name);
        }
    }
}

struct BrokerState {
    online: AtomicBool,
    next_channel_id: AtomicU64,
    topology: Mutex<Topology>,
    /// Every consumer ever started, by queue name.
    consumers: Mutex<Vec<(String, AbortHandle)>>,
}

/// In-process message broker.
///
/// Cloning yields another handle to the same broker, so a client and a container
/// in one process can share it.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl MemoryBroker {
    /// Create an empty, online broker.
    pub fn new() -> Self {
        Self {
            state: Arc::new(BrokerState {
                online: AtomicBool::new(true),
                next_channel_id: AtomicU64::new(1),
                topology: Mutex::new(Topology::default()),
                consumers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Simulate losing (or regaining) the broker.
    ///
    /// While offline, opening channels and publishing fail with
    /// [`LeafwireError::Connectivity`].
    pub fn set_online(&self, online: bool) {
        self.state.online.store(online, Ordering::Release);
    }

    /// Whether the broker is reachable.
    pub fn is_online(&self) -> bool {
        self.state.online.load(Ordering::Acquire)
    }

    /// Whether a queue with this name exists.
    pub fn queue_exists(&self, name: &str) -> bool {
        lock(&self.state.topology).queues.contains_key(name)
    }

    /// Whether an exchange with this name exists.
    pub fn exchange_exists(&self, name: &str) -> bool {
        lock(&self.state.topology).exchanges.contains_key(name)
    }

    /// Cancel every consumer of `queue`, as a broker does when the queue is
    /// deleted under them. Their delivery streams end; channels stay open.
    pub fn cancel_consumers(&self, queue: &str) {
        lock(&self.state.consumers).retain(|(name, consumer)| {
            if name == queue {
                consumer.abort();
            }
            name != queue
        });
    }

    /// Names of all queues, sorted.
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.state.topology).queues.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Connection for MemoryBroker {
    async fn open_channel(&self) -> Result<Arc<dyn Channel>> {
        if !self.is_online() {
            return Err(LeafwireError::Connectivity(
                "memory broker is offline".to_string(),
            ));
        }

        let id = self.state.next_channel_id.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(channel = id, "Opened memory channel");

        Ok(Arc::new(MemoryChannel {
            id,
            state: self.state.clone(),
            prefetch: Mutex::new(None),
            consumers: Mutex::new(Vec::new()),
            closed: Arc::new(AtomicBool::new(false)),
        }))
    }
}

/// A channel on a [`MemoryBroker`].
struct MemoryChannel {
    id: u64,
    state: Arc<BrokerState>,
    /// Unacked-delivery budget shared by all consumers of this channel.
    prefetch: Mutex<Option<Arc<Semaphore>>>,
    consumers: Mutex<Vec<JoinHandle<()>>>,
    closed: Arc<AtomicBool>,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<()> {
        if !self.state.online.load(Ordering::Acquire) {
            return Err(LeafwireError::Connectivity(
                "memory broker is offline".to_string(),
            ));
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(LeafwireError::ChannelClosed);
        }
        Ok(())
    }

    /// Cancel consumers and delete exclusive queues. Idempotent.
    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        for consumer in lock(&self.consumers).drain(..) {
            consumer.abort();
        }

        let mut topology = lock(&self.state.topology);
        let owned: Vec<String> = topology
            .queues
            .iter()
            .filter(|(_, q)| q.owner == Some(self.id))
            .map(|(name, _)| name.clone())
            .collect();

        for name in owned {
            tracing::trace!(channel = self.id, queue = %name, "Deleting exclusive queue");
            topology.remove_queue(&name);
        }
    }
}

#[async_trait::async_trait]
impl Channel for MemoryChannel {
    async fn declare_exchange(&self, name: &str) -> Result<()> {
        self.ensure_open()?;
        if name == DEFAULT_EXCHANGE {
            return Err(LeafwireError::Precondition(
                "the default exchange cannot be redeclared".to_string(),
            ));
        }

        lock(&self.state.topology)
            .exchanges
            .entry(name.to_string())
            .or_default();
        Ok(())
    }

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<String> {
        self.ensure_open()?;

        let name = if name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4().simple())
        } else {
            name.to_string()
        };

        let mut topology = lock(&self.state.topology);
        if let Some(existing) = topology.queues.get(&name) {
            if existing.options != options {
                return Err(LeafwireError::Precondition(format!(
                    "inequivalent arguments for queue '{}': declared {:?}, requested {:?}",
                    name, existing.options, options
                )));
            }
            if existing.owner.is_some() && existing.owner != Some(self.id) {
                return Err(LeafwireError::Precondition(format!(
                    "queue '{}' is exclusive to another channel",
                    name
                )));
            }
            return Ok(name);
        }

        let owner = options.exclusive.then_some(self.id);
        topology
            .queues
            .insert(name.clone(), Arc::new(Queue::new(options, owner)));
        Ok(name)
    }

    async fn bind(&self, exchange: &str, queue: &str, routing_key: &str) -> Result<()> {
        self.ensure_open()?;

        let mut topology = lock(&self.state.topology);
        if !topology.queues.contains_key(queue) {
            return Err(LeafwireError::NotFound(format!("queue '{}'", queue)));
        }

        let bindings = topology
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| LeafwireError::NotFound(format!("exchange '{}'", exchange)))?;

        let binding = Binding {
            queue: queue.to_string(),
            routing_key: routing_key.to_string(),
        };
        if !bindings.contains(&binding) {
            bindings.push(binding);
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Bytes,
        properties: MessageProperties,
    ) -> Result<()> {
        self.ensure_open()?;

        let targets: Vec<Arc<Queue>> = {
            let topology = lock(&self.state.topology);
            if exchange == DEFAULT_EXCHANGE {
                topology.queues.get(routing_key).cloned().into_iter().collect()
            } else {
                let bindings = topology
                    .exchanges
                    .get(exchange)
                    .ok_or_else(|| LeafwireError::NotFound(format!("exchange '{}'", exchange)))?;
                bindings
                    .iter()
                    .filter(|b| b.routing_key == routing_key)
                    .filter_map(|b| topology.queues.get(&b.queue).cloned())
                    .collect()
            }
        };

        if targets.is_empty() {
            tracing::trace!(exchange, routing_key, "Dropping unroutable message");
            return Ok(());
        }

        let message = StoredMessage {
            body,
            properties,
            redelivered: false,
        };
        for queue in targets {
            // The queue owns its receiver, so this cannot fail while it is alive.
            let _ = queue.tx.send(message.clone());
        }
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryStream> {
        self.ensure_open()?;

        let queue_name = queue.to_string();
        let queue = {
            let topology = lock(&self.state.topology);
            let queue = topology
                .queues
                .get(queue)
                .cloned()
                .ok_or_else(|| LeafwireError::NotFound(format!("queue '{}'", queue)))?;
            if queue.owner.is_some() && queue.owner != Some(self.id) {
                return Err(LeafwireError::Precondition(
                    "queue is exclusive to another channel".to_string(),
                ));
            }
            queue
        };

        let prefetch = lock(&self.prefetch).clone();
        let channel_closed = self.closed.clone();
        let (out_tx, out_rx) = mpsc::channel::<Result<Delivery>>(1);

        let forwarder = tokio::spawn(async move {
            loop {
                let permit = match &prefetch {
                    Some(budget) => match budget.clone().acquire_owned().await {
                        Ok(permit) => Some(permit),
                        Err(_) => break,
                    },
                    None => None,
                };

                let message = {
                    let mut rx = queue.rx.lock().await;
                    rx.recv().await
                };
                let Some(message) = message else {
                    break;
                };

                let acker = MemoryAcker {
                    unacked: Mutex::new(Some(Unacked {
                        message: message.clone(),
                        _permit: permit,
                    })),
                    requeue: queue.tx.clone(),
                    channel_closed: channel_closed.clone(),
                };
                let delivery = Delivery::new(
                    message.body,
                    message.properties,
                    message.redelivered,
                    Box::new(acker),
                );

                // A failed send drops the delivery, which requeues the message.
                if out_tx.send(Ok(delivery)).await.is_err() {
                    break;
                }
            }
        });
        lock(&self.state.consumers).push((queue_name, forwarder.abort_handle()));
        lock(&self.consumers).push(forwarder);

        let stream = futures::stream::unfold(out_rx, |mut rx| async move {
            rx.recv().await.map(|delivery| (delivery, rx))
        });
        Ok(stream.boxed())
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        self.ensure_open()?;
        *lock(&self.prefetch) = match count {
            0 => None,
            n => Some(Arc::new(Semaphore::new(n as usize))),
        };
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.shutdown();
        Ok(())
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Unacked {
    message: StoredMessage,
    _permit: Option<OwnedSemaphorePermit>,
}

/// Acknowledger for a memory delivery.
///
/// Acking releases the prefetch slot. Dropping without an ack puts the message
/// back on its queue flagged as redelivered.
struct MemoryAcker {
    unacked: Mutex<Option<Unacked>>,
    requeue: mpsc::UnboundedSender<StoredMessage>,
    channel_closed: Arc<AtomicBool>,
}

#[async_trait::async_trait]
impl Acknowledge for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        if self.channel_closed.load(Ordering::Acquire) {
            return Err(LeafwireError::ChannelClosed);
        }

        match lock(&self.unacked).take() {
            Some(_) => Ok(()),
            None => Err(LeafwireError::Precondition(
                "delivery already acknowledged".to_string(),
            )),
        }
    }
}

impl Drop for MemoryAcker {
    fn drop(&mut self) {
        if let Some(unacked) = lock(&self.unacked).take() {
            let mut message = unacked.message;
            message.redelivered = true;
            let _ = self.requeue.send(message);
        }
    }
}
