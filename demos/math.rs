//! Math service - container and client in one process.
//!
//! This example demonstrates:
//! - Grouping functions into a leaf, one with a timeout and one on the worker pool
//! - Hosting the leaf in a container over the in-process broker
//! - Calling it through the client proxy with positional and keyword arguments
//! - Remote failures surfacing as `LeafwireError::Remote`
//!
//! ```sh
//! RUST_LOG=leafwire=debug cargo run --example math
//! ```

use std::fmt;
use std::time::Duration;

use serde::Deserialize;
use tracing_subscriber::EnvFilter;

use leafwire::{CallEnvelope, Client, Container, Leaf, LeafwireError, MemoryBroker};

#[derive(Debug)]
struct ZeroDivisionError;

impl fmt::Display for ZeroDivisionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "division by zero")
    }
}

#[derive(Deserialize)]
struct PowerArgs {
    base: f64,
    exponent: i32,
}

fn fib(n: u64) -> u64 {
    (0..n).fold((0u64, 1u64), |(a, b), _| (b, a.wrapping_add(b))).0
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut math = Leaf::new("math");
    math.register("add", |(a, b): (i64, i64)| async move { Ok::<_, String>(a + b) }, None);
    math.register(
        "divide",
        |(a, b): (f64, f64)| async move {
            if b == 0.0 {
                Err(ZeroDivisionError)
            } else {
                Ok(a / b)
            }
        },
        Some(Duration::from_secs(1)),
    );
    math.register(
        "power",
        |args: PowerArgs| async move { Ok::<_, String>(args.base.powi(args.exponent)) },
        None,
    );
    math.register_blocking("fib", |(n,): (u64,)| Ok::<_, String>(fib(n)), None);

    let broker = MemoryBroker::new();
    let container = Container::builder().leaf(math).concurrency_limit(8).build();
    let serving = container.serve(&broker).await?;

    let client = Client::new(broker.clone());
    let math = client.service("math");

    let sum: i64 = math.invoke("add", &(2, 3)).await?;
    println!("add(2, 3) = {}", sum);

    let fib_90: u64 = math.invoke("fib", &(90,)).await?;
    println!("fib(90) = {}", fib_90);

    let power = math
        .call("power", CallEnvelope::new().kwarg("base", 2.0).kwarg("exponent", 10))
        .await?;
    println!("power(base=2, exponent=10) = {}", power);

    match math.invoke::<_, f64>("divide", &(1, 0)).await {
        Err(LeafwireError::Remote(description)) => println!("divide(1, 0) failed: {}", description),
        other => println!("divide(1, 0) = {:?}", other),
    }

    serving.shutdown().await?;
    Ok(())
}
