//! Error types for craft-node.

use thiserror::Error;

/// Errors that can occur while running a gossip node.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Random-port binding gave up after the retry budget was spent.
    #[error("failed to bind a UDP port after {attempts} attempts")]
    BindExhausted {
        /// Number of bind attempts made.
        attempts: u32,
    },

    /// Binding the configured fixed address failed.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// The address that could not be bound.
        addr: String,
        /// Underlying socket error.
        #[source]
        source: std::io::Error,
    },

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Compression or decompression failed.
    #[error("codec error: {0}")]
    Codec(String),

    /// The message store backend failed.
    #[error("store error: {0}")]
    Store(String),

    /// A peer address could not be parsed.
    #[error("invalid peer address: {0}")]
    InvalidPeerAddress(String),

    /// A digest was not a 64 character hex string.
    #[error("invalid digest: {0}")]
    InvalidDigest(String),

    /// A schema description could not be parsed.
    #[error("schema error: {0}")]
    Schema(String),

    /// Configuration is invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// At least one shared object refused a locally created message.
    #[error("message rejected by shared object {class_name}")]
    SharedObjectRejected {
        /// Class identifier of the refusing object.
        class_name: String,
    },

    /// The compressed payload does not fit in one datagram.
    #[error("payload of {size} bytes exceeds the {max} byte datagram limit")]
    PayloadTooLarge {
        /// Compressed size in bytes.
        size: usize,
        /// Maximum datagram size.
        max: usize,
    },

    /// The node is not running.
    #[error("node not running")]
    NotRunning,
}

/// Result type for node operations.
pub type NodeResult<T> = Result<T, NodeError>;

/// Why an inbound message was refused by the pipeline.
///
/// Every rejection counts as one strike against the sender.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    /// The datagram did not decompress or parse as a message.
    #[error("undecodable datagram: {0}")]
    Decode(String),

    /// No registered message type matched.
    #[error("message does not match any accepted type")]
    NotAccepted,

    /// A reserved control field carried a malformed value.
    #[error("malformed control message: {0}")]
    MalformedControl(String),

    /// A shared object refused the message.
    #[error("rejected by shared object {0}")]
    SharedObject(String),

    /// A shared object panicked while handling the message.
    #[error("shared object {0} faulted")]
    ConsumerFault(String),
}
