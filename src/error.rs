//! Error types for containerd-dns.

use thiserror::Error;

/// Errors that can occur while discovering containers or serving DNS.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// IO error (network, file, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The runtime endpoint could not be reached.
    #[error("failed to connect to runtime at {endpoint}: {reason}")]
    Connection {
        /// Socket path that was dialed.
        endpoint: String,
        /// Underlying transport error.
        reason: String,
    },

    /// Malformed filter expression.
    #[error("invalid filter {expr:?} at offset {offset}: {reason}")]
    Parse {
        /// The full expression being parsed.
        expr: String,
        /// Byte offset of the problem.
        offset: usize,
        /// What went wrong.
        reason: String,
    },

    /// A runtime metadata or task lookup failed.
    #[error("runtime query failed: {0}")]
    RuntimeQuery(String),

    /// The event stream failed or ended unexpectedly.
    #[error("event subscription error: {0}")]
    Subscription(String),

    /// An event payload could not be decoded.
    #[error("failed to decode {topic} event: {reason}")]
    Decode {
        /// Topic of the envelope.
        topic: String,
        /// Decoder message.
        reason: String,
    },

    /// The container has no running task yet.
    #[error("container {0} has no running task")]
    NoTask(String),

    /// No resolution strategy produced an address.
    #[error("no address found for container {0}")]
    NotFound(String),

    /// A privileged network namespace operation failed.
    #[error("network namespace error: {0}")]
    Namespace(String),

    /// A CNI result file exists but is malformed.
    #[error("malformed CNI result {path}: {reason}")]
    Cni {
        /// File that was read.
        path: String,
        /// Parse failure.
        reason: String,
    },

    /// Writing a DNS response failed.
    #[error("failed to write DNS response: {0}")]
    Write(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// DNS protocol error
    #[error("DNS protocol error: {0}")]
    Proto(#[from] hickory_proto::ProtoError),
}

impl DiscoveryError {
    /// Whether this error stops the resolution chain instead of falling
    /// through to the next strategy.
    pub fn aborts_resolution(&self) -> bool {
        matches!(self, DiscoveryError::NoTask(_))
    }
}
