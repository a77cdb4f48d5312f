//! Hosting container - binds leaves to the broker and dispatches calls.
//!
//! The [`ContainerBuilder`] collects leaves and configuration. [`Container::serve`]
//! manages the lifecycle:
//! 1. Open one channel and set prefetch to the concurrency limit
//! 2. Declare one direct exchange per leaf
//! 3. Declare, bind and consume one durable queue per method
//! 4. Dispatch every delivery to its [`HandlerWrapper`] on its own task
//!
//! # Example
//!
//! ```ignore
//! use leafwire::{Container, Leaf, MemoryBroker};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut math = Leaf::new("math");
//!     math.register("add", |(a, b): (i64, i64)| async move { Ok::<_, String>(a + b) }, None);
//!
//!     let broker = MemoryBroker::new();
//!     let container = Container::builder()
//!         .leaf(math)
//!         .concurrency_limit(32)
//!         .build();
//!
//!     container.run(&broker).await?;
//!     Ok(())
//! }
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::broker::{Channel, ChannelGuard, Connection, DeliveryStream, QueueOptions};
use crate::error::{LeafwireError, Result};
use crate::handler::HandlerWrapper;
use crate::leaf::Leaf;
use crate::pool::WorkerPool;

/// Default maximum number of unacknowledged deliveries in flight.
pub const DEFAULT_CONCURRENCY_LIMIT: u16 = 16;

/// Container configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerConfig {
    /// Maximum deliveries received but not yet acknowledged (broker prefetch) and
    /// maximum handlers running at once.
    pub concurrency_limit: u16,
    /// Size of the worker pool used by blocking handlers.
    pub worker_threads: usize,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: DEFAULT_CONCURRENCY_LIMIT,
            worker_threads: WorkerPool::default_size(),
        }
    }
}

/// Builder for configuring and creating a [`Container`].
#[derive(Debug, Default)]
pub struct ContainerBuilder {
    leaves: Vec<Leaf>,
    config: ContainerConfig,
}

impl ContainerBuilder {
    /// Create a new container builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Host a leaf. Leaves are declared in the order they were added.
    pub fn leaf(mut self, leaf: Leaf) -> Self {
        self.leaves.push(leaf);
        self
    }

    /// Set the concurrency limit (minimum 1).
    ///
    /// Default: 16
    pub fn concurrency_limit(mut self, limit: u16) -> Self {
        self.config.concurrency_limit = limit.max(1);
        self
    }

    /// Set the number of worker threads for blocking handlers (minimum 1).
    ///
    /// Default: available parallelism minus one
    pub fn worker_threads(mut self, threads: usize) -> Self {
        self.config.worker_threads = threads.max(1);
        self
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: ContainerConfig) -> Self {
        self.config = ContainerConfig {
            concurrency_limit: config.concurrency_limit.max(1),
            worker_threads: config.worker_threads.max(1),
        };
        self
    }

    /// Build the container.
    pub fn build(self) -> Container {
        let pool = WorkerPool::new(self.config.worker_threads);
        Container {
            leaves: self.leaves,
            config: self.config,
            pool,
        }
    }
}

/// Server-side host for a set of leaves.
#[derive(Debug)]
pub struct Container {
    leaves: Vec<Leaf>,
    config: ContainerConfig,
    pool: WorkerPool,
}

impl Container {
    /// Create a new container builder.
    pub fn builder() -> ContainerBuilder {
        ContainerBuilder::new()
    }

    /// Hosted leaves, in declaration order.
    pub fn leaves(&self) -> &[Leaf] {
        &self.leaves
    }

    /// Active configuration.
    pub fn config(&self) -> &ContainerConfig {
        &self.config
    }

    /// Declare the topology and start consuming every method queue.
    ///
    /// # Errors
    ///
    /// Any failure while declaring, binding or subscribing aborts startup with
    /// [`LeafwireError::Declaration`]; the channel is closed again. Method queues
    /// are named after the method, so a method name registered by two leaves is
    /// rejected before anything is declared.
    pub async fn serve(&self, connection: &dyn Connection) -> Result<ServeHandle> {
        self.check_queue_names()?;

        let channel = ChannelGuard::new(connection.open_channel().await?);
        let limit = self.config.concurrency_limit;

        channel
            .set_prefetch(limit)
            .await
            .map_err(|e| declaration("prefetch", e))?;

        let mut consumers = Vec::new();
        for leaf in &self.leaves {
            channel
                .declare_exchange(leaf.name())
                .await
                .map_err(|e| declaration(&format!("exchange '{}'", leaf.name()), e))?;

            for (method, wrapper) in leaf.methods() {
                let entity = format!("queue '{}' of leaf '{}'", method, leaf.name());
                let queue = channel
                    .declare_queue(method, QueueOptions::method())
                    .await
                    .map_err(|e| declaration(&entity, e))?;
                channel
                    .bind(leaf.name(), &queue, method)
                    .await
                    .map_err(|e| declaration(&entity, e))?;
                let deliveries = channel
                    .consume(&queue)
                    .await
                    .map_err(|e| declaration(&entity, e))?;

                tracing::debug!(leaf = leaf.name(), method, "Consuming method queue");
                consumers.push((queue, wrapper.clone(), deliveries));
            }
        }

        let in_flight = Arc::new(Semaphore::new(limit as usize));
        let shared = channel.shared();
        let mut queues = Vec::with_capacity(consumers.len());
        let mut tasks = Vec::with_capacity(consumers.len());

        for (queue, wrapper, deliveries) in consumers {
            tasks.push(tokio::spawn(Self::consume_loop(
                queue.clone(),
                deliveries,
                wrapper,
                shared.clone(),
                self.pool.clone(),
                in_flight.clone(),
            )));
            queues.push(queue);
        }

        tracing::info!(
            leaves = self.leaves.len(),
            queues = queues.len(),
            concurrency_limit = limit,
            "Container serving"
        );

        Ok(ServeHandle {
            channel,
            queues,
            tasks,
            in_flight,
            limit,
        })
    }

    /// Fail if two leaves register the same method name (they would share a queue).
    fn check_queue_names(&self) -> Result<()> {
        let mut owners: HashMap<&str, &str> = HashMap::new();
        for leaf in &self.leaves {
            for method in leaf.method_names() {
                if let Some(first) = owners.insert(method, leaf.name()) {
                    return Err(LeafwireError::Declaration {
                        entity: format!("queue '{}'", method),
                        reason: format!("registered by leaves '{}' and '{}'", first, leaf.name()),
                    });
                }
            }
        }
        Ok(())
    }

    /// Serve until every consumer stops (the broker closed the channel).
    pub async fn run(&self, connection: &dyn Connection) -> Result<()> {
        self.serve(connection).await?.wait().await
    }

    /// Receive deliveries for one method queue and dispatch each on its own task.
    async fn consume_loop(
        queue: String,
        mut deliveries: DeliveryStream,
        wrapper: Arc<HandlerWrapper>,
        channel: Arc<dyn Channel>,
        pool: WorkerPool,
        in_flight: Arc<Semaphore>,
    ) {
        while let Some(next) = deliveries.next().await {
            let delivery = match next {
                Ok(delivery) => delivery,
                Err(e) => {
                    tracing::error!(queue = %queue, "Consumer error: {}", e);
                    break;
                }
            };

            // Permit is held until the handler task completes
            let Ok(permit) = in_flight.clone().acquire_owned().await else {
                break;
            };

            let wrapper = wrapper.clone();
            let channel = channel.clone();
            let pool = pool.clone();
            tokio::spawn(async move {
                let _permit = permit;
                wrapper.handle_delivery(channel.as_ref(), delivery, &pool).await;
            });
        }

        tracing::debug!(queue = %queue, "Consumer stopped");
    }
}

fn declaration(entity: &str, error: LeafwireError) -> LeafwireError {
    match error {
        LeafwireError::Declaration { .. } => error,
        other => LeafwireError::Declaration {
            entity: entity.to_string(),
            reason: other.to_string(),
        },
    }
}

/// A running container.
///
/// Dropping the handle without calling [`ServeHandle::shutdown`] closes the
/// channel in the background; consumer tasks then end on their own.
pub struct ServeHandle {
    channel: ChannelGuard,
    queues: Vec<String>,
    tasks: Vec<JoinHandle<()>>,
    in_flight: Arc<Semaphore>,
    limit: u16,
}

impl ServeHandle {
    /// Names of the consumed method queues.
    pub fn queues(&self) -> &[String] {
        &self.queues
    }

    /// Number of handlers currently running.
    pub fn in_flight(&self) -> usize {
        (self.limit as usize).saturating_sub(self.in_flight.available_permits())
    }

    /// Stop consuming, let running handlers finish, then close the channel.
    pub async fn shutdown(self) -> Result<()> {
        for task in &self.tasks {
            task.abort();
        }

        self.drain().await;
        tracing::info!("Container shut down");
        self.channel.close().await
    }

    /// Wait for running handlers to finish and refuse new ones.
    async fn drain(&self) {
        // Every running handler holds one permit.
        if let Ok(all) = self.in_flight.acquire_many(self.limit as u32).await {
            drop(all);
        }
        self.in_flight.close();
    }

    /// Wait until every consumer stops, then close the channel.
    pub async fn wait(mut self) -> Result<()> {
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                tracing::error!("Consumer task failed: {}", e);
            }
        }
        self.drain().await;
        self.channel.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::client::Client;
    use crate::envelope::CallEnvelope;
    use serde_json::json;
    use std::time::Duration;

    fn math_leaf() -> Leaf {
        let mut leaf = Leaf::new("math");
        leaf.register("add", |(a, b): (i64, i64)| async move { Ok::<_, String>(a + b) }, None);
        leaf.register("sub", |(a, b): (i64, i64)| async move { Ok::<_, String>(a - b) }, None);
        leaf
    }

    #[test]
    fn test_builder_configuration() {
        let container = Container::builder()
            .leaf(math_leaf())
            .concurrency_limit(4)
            .worker_threads(3)
            .build();

        assert_eq!(container.config().concurrency_limit, 4);
        assert_eq!(container.config().worker_threads, 3);
        assert_eq!(container.leaves().len(), 1);
    }

    #[test]
    fn test_builder_clamps_to_one() {
        let container = Container::builder()
            .concurrency_limit(0)
            .worker_threads(0)
            .build();
        assert_eq!(container.config().concurrency_limit, 1);
        assert_eq!(container.config().worker_threads, 1);

        let container = Container::builder()
            .config(ContainerConfig {
                concurrency_limit: 0,
                worker_threads: 0,
            })
            .build();
        assert_eq!(container.config().concurrency_limit, 1);
    }

    #[test]
    fn test_default_config() {
        let config = ContainerConfig::default();
        assert_eq!(config.concurrency_limit, DEFAULT_CONCURRENCY_LIMIT);
        assert!(config.worker_threads >= 1);
    }

    #[tokio::test]
    async fn test_serve_declares_topology() {
        let broker = MemoryBroker::new();
        let container = Container::builder().leaf(math_leaf()).build();

        let handle = container.serve(&broker).await.unwrap();
        assert_eq!(handle.queues(), &["add".to_string(), "sub".to_string()]);
        assert!(broker.exchange_exists("math"));
        assert!(broker.queue_exists("add"));
        assert!(broker.queue_exists("sub"));
        assert_eq!(handle.in_flight(), 0);

        handle.shutdown().await.unwrap();
        // Method queues are durable and outlive the container.
        assert!(broker.queue_exists("add"));
    }

    #[tokio::test]
    async fn test_declaration_conflict_aborts_serve() {
        let broker = MemoryBroker::new();
        let other = broker.open_channel().await.unwrap();
        let transient = QueueOptions {
            durable: false,
            ..QueueOptions::method()
        };
        other.declare_queue("add", transient).await.unwrap();

        let container = Container::builder().leaf(math_leaf()).build();
        match container.serve(&broker).await {
            Err(LeafwireError::Declaration { entity, reason }) => {
                assert!(entity.contains("'add'"));
                assert!(reason.contains("inequivalent"));
            }
            Ok(_) => panic!("serve must fail on an incompatible queue"),
            Err(other) => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_method_name_shared_by_two_leaves_aborts_serve() {
        let mut text = Leaf::new("text");
        text.register("add", |(a, b): (String, String)| async move { Ok::<_, String>(a + &b) }, None);

        let broker = MemoryBroker::new();
        let container = Container::builder().leaf(math_leaf()).leaf(text).build();
        match container.serve(&broker).await {
            Err(LeafwireError::Declaration { entity, reason }) => {
                assert_eq!(entity, "queue 'add'");
                assert_eq!(reason, "registered by leaves 'math' and 'text'");
            }
            Ok(_) => panic!("serve must reject a method name used by two leaves"),
            Err(other) => panic!("unexpected error: {}", other),
        }
        assert!(!broker.exchange_exists("math"));
        assert!(broker.queue_names().is_empty());
    }

    #[tokio::test]
    async fn test_wait_lets_running_handlers_reply() {
        let mut slow = Leaf::new("slow");
        slow.register(
            "linger",
            |(): ()| async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok::<_, String>("done")
            },
            None,
        );

        let broker = MemoryBroker::new();
        let container = Container::builder().leaf(slow).build();
        let handle = container.serve(&broker).await.unwrap();

        let client = Client::new(broker.clone());
        let call = tokio::spawn(async move { client.call("slow", "linger", CallEnvelope::new()).await });
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(handle.in_flight(), 1);

        // The broker cancels the consumer while the handler is still running.
        broker.cancel_consumers("linger");
        handle.wait().await.unwrap();

        let value = tokio::time::timeout(Duration::from_secs(1), call)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(value, json!("done"));
    }

    #[tokio::test]
    async fn test_serve_fails_when_broker_offline() {
        let broker = MemoryBroker::new();
        broker.set_online(false);

        let container = Container::builder().leaf(math_leaf()).build();
        assert!(matches!(
            container.serve(&broker).await,
            Err(LeafwireError::Connectivity(_))
        ));
    }
}
