//! Leaf - a named group of remotely callable methods.
//!
//! A leaf maps one service name to its methods. On the broker the leaf becomes a
//! direct exchange and every method a durable queue bound under its own name.
//!
//! Registering a name that already exists replaces the previous handler (last
//! write wins).
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use leafwire::Leaf;
//!
//! async fn add((a, b): (i64, i64)) -> Result<i64, String> {
//!     Ok(a + b)
//! }
//!
//! let mut math = Leaf::new("math");
//! let add = math.register("add", add, None);
//! math.register_blocking("fib", |(n,): (u64,)| Ok::<_, String>(fib(n)), Some(Duration::from_secs(5)));
//!
//! // Still callable in-process.
//! assert_eq!(add((2, 3)).await, Ok(5));
//! ```

use std::collections::BTreeMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::handler::{AsyncHandler, BlockingHandler, Handler, HandlerWrapper};

/// Named group of handlers; the unit of registration on the server side.
#[derive(Debug, Clone)]
pub struct Leaf {
    name: String,
    /// Methods by name.
    methods: BTreeMap<String, Arc<HandlerWrapper>>,
}

impl Leaf {
    /// Create an empty leaf.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: BTreeMap::new(),
        }
    }

    /// Leaf (service) name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register an async function under `name`.
    ///
    /// Arguments are decoded into `T` (see
    /// [`CallEnvelope::decode_args`](crate::CallEnvelope::decode_args)), the
    /// returned `R` is sent back as the result and an `Err(E)` becomes a remote
    /// failure. With a `timeout`, calls running longer fail with a timeout
    /// description.
    ///
    /// Returns `function` unchanged so it stays callable in-process.
    pub fn register<F, T, Fut, R, E>(&mut self, name: &str, function: F, timeout: Option<Duration>) -> F
    where
        F: Fn(T) -> Fut + Clone + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
        R: Serialize + 'static,
        E: Display + 'static,
    {
        self.insert(name, AsyncHandler::new(function.clone()), timeout);
        function
    }

    /// Register a synchronous, possibly CPU-bound function under `name`.
    ///
    /// Calls run on the container's worker pool instead of the async runtime.
    /// A timeout abandons the result but cannot stop the worker thread; its pool
    /// slot stays busy until the function returns.
    ///
    /// Returns `function` unchanged so it stays callable in-process.
    pub fn register_blocking<F, T, R, E>(
        &mut self,
        name: &str,
        function: F,
        timeout: Option<Duration>,
    ) -> F
    where
        F: Fn(T) -> std::result::Result<R, E> + Clone + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        E: Display + Send + 'static,
    {
        self.insert(name, BlockingHandler::new(function.clone()), timeout);
        function
    }

    /// Register an already type-erased handler.
    pub fn register_handler(
        &mut self,
        name: &str,
        handler: Arc<dyn Handler>,
        timeout: Option<Duration>,
    ) {
        let qualified = format!("{}.{}", self.name, name);
        let wrapper = HandlerWrapper::new(qualified, handler, timeout);

        if self.methods.insert(name.to_string(), Arc::new(wrapper)).is_some() {
            tracing::debug!(leaf = %self.name, method = name, "Replacing previously registered handler");
        }
    }

    fn insert<H: Handler>(&mut self, name: &str, handler: H, timeout: Option<Duration>) {
        self.register_handler(name, Arc::new(handler), timeout);
    }

    /// Get the wrapper registered under `method`.
    pub fn get(&self, method: &str) -> Option<&Arc<HandlerWrapper>> {
        self.methods.get(method)
    }

    /// Timeout configured for `method`, if the method exists and has one.
    pub fn timeout(&self, method: &str) -> Option<Duration> {
        self.methods.get(method).and_then(|w| w.timeout())
    }

    /// Registered method names, sorted.
    pub fn method_names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }

    /// Registered methods with their wrappers, sorted by name.
    pub fn methods(&self) -> impl Iterator<Item = (&str, &Arc<HandlerWrapper>)> {
        self.methods.iter().map(|(name, w)| (name.as_str(), w))
    }

    /// Number of registered methods.
    #[inline]
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    /// Whether no method is registered.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::CallEnvelope;
    use crate::pool::WorkerPool;
    use serde_json::json;

    async fn add((a, b): (i64, i64)) -> Result<i64, String> {
        Ok(a + b)
    }

    #[test]
    fn test_register_method() {
        let mut leaf = Leaf::new("math");
        leaf.register("add", add, None);

        assert_eq!(leaf.name(), "math");
        assert_eq!(leaf.len(), 1);
        assert!(!leaf.is_empty());
        assert_eq!(leaf.get("add").unwrap().name(), "math.add");
        assert!(leaf.get("sub").is_none());
    }

    #[test]
    fn test_method_names_sorted() {
        let mut leaf = Leaf::new("math");
        leaf.register("sub", add, None);
        leaf.register("add", add, None);
        leaf.register_blocking("mul", |(a, b): (i64, i64)| Ok::<_, String>(a * b), None);

        let names: Vec<&str> = leaf.method_names().collect();
        assert_eq!(names, vec!["add", "mul", "sub"]);
    }

    #[test]
    fn test_timeouts() {
        let mut leaf = Leaf::new("slow");
        leaf.register("wait", add, Some(Duration::from_secs(1)));
        leaf.register("fast", add, None);

        assert_eq!(leaf.timeout("wait"), Some(Duration::from_secs(1)));
        assert_eq!(leaf.timeout("fast"), None);
        assert_eq!(leaf.timeout("missing"), None);
    }

    #[tokio::test]
    async fn test_register_returns_pass_through() {
        let mut leaf = Leaf::new("math");
        let direct = leaf.register("add", add, None);
        assert_eq!(direct((2, 3)).await, Ok(5));

        let double = leaf.register_blocking("double", |(n,): (i64,)| Ok::<_, String>(n * 2), None);
        assert_eq!(double((21,)), Ok(42));
    }

    #[tokio::test]
    async fn test_duplicate_registration_last_write_wins() {
        let mut leaf = Leaf::new("greet");
        leaf.register("hello", |(): ()| async { Ok::<_, String>("first") }, None);
        leaf.register("hello", |(): ()| async { Ok::<_, String>("second") }, None);

        assert_eq!(leaf.len(), 1);

        let envelope = leaf
            .get("hello")
            .unwrap()
            .execute(CallEnvelope::new(), &WorkerPool::new(1))
            .await;
        assert_eq!(envelope.result, json!("second"));
    }
}
