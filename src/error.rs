//! Error types for leafwire.

use std::time::Duration;

use thiserror::Error;

/// Main error type for all leafwire operations.
#[derive(Debug, Error)]
pub enum LeafwireError {
    /// The broker is unreachable or the connection was dropped.
    #[error("Broker unreachable: {0}")]
    Connectivity(String),

    /// Operation attempted on a channel that has already been closed.
    #[error("Channel closed")]
    ChannelClosed,

    /// The broker refused a declaration because an incompatible entity exists.
    #[error("Precondition failed: {0}")]
    Precondition(String),

    /// A queue or exchange referenced by an operation does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Broker topology setup failed while the container was starting.
    #[error("Failed to declare {entity}: {reason}")]
    Declaration { entity: String, reason: String },

    /// The remote handler failed (exception, timeout, panic or protocol violation).
    #[error("Remote call failed: {0}")]
    Remote(String),

    /// A payload did not have the expected envelope shape.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The optional client-side deadline expired before a reply arrived.
    #[error("Call timed out after {0:?}")]
    CallTimeout(Duration),

    /// A blocking job panicked inside the worker pool.
    #[error("Worker panicked: {0}")]
    WorkerPanicked(String),

    /// The worker pool was shut down or the job was cancelled.
    #[error("Worker pool closed")]
    PoolClosed,

    /// JSON value conversion error (argument and result values).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// Error reported by the AMQP client library.
    #[cfg(feature = "amqp")]
    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),
}

/// Result type alias using LeafwireError.
pub type Result<T> = std::result::Result<T, LeafwireError>;
