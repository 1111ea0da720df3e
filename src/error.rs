//! Error types and result handling for price-pipeline.
//!
//! This module defines the main error type [`Error`], the transport-level
//! [`TransportError`] reported by broker sessions, and a convenience
//! [`Result`] type alias used throughout the crate.
//!
//! # Example
//!
//! ```rust
//! use price_pipeline::{Error, Result};
//!
//! fn connect_to_broker() -> Result<()> {
//!     Err(Error::Connection("broker unreachable".to_string()))
//! }
//!
//! match connect_to_broker() {
//!     Ok(()) => println!("Connected"),
//!     Err(Error::Connection(msg)) => eprintln!("Connection error: {}", msg),
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! ```

use thiserror::Error;

/// The main error type for price-pipeline operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error, from the config file, environment or validation.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A payload is not a valid price-update encoding.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// A partition outside `[0, partition_count)` was requested.
    #[error("Invalid partition {partition} for topic '{topic}' with {partition_count} partitions")]
    InvalidPartition {
        topic: String,
        partition: i32,
        partition_count: i32,
    },

    /// Delivery failed after the configured retries were exhausted.
    #[error("Delivery to '{topic}' failed after {attempts} attempt(s): {source}")]
    Delivery {
        topic: String,
        attempts: u32,
        #[source]
        source: TransportError,
    },

    /// A subscriber's handler failed to process one record.
    #[error("Handler failed for {topic}[{partition}]@{offset}: {message}")]
    Handler {
        topic: String,
        partition: i32,
        offset: i64,
        message: String,
    },

    /// The broker could not be reached; the client is closed.
    #[error("Connection error: {0}")]
    Connection(String),

    /// `subscribe` was called on a client that already has a subscription.
    #[error("Consumer group '{0}' is already subscribed")]
    AlreadySubscribed(String),

    /// `run` was called before `subscribe`.
    #[error("Consumer group '{0}' has no subscription")]
    NotSubscribed(String),

    /// The client was closed.
    #[error("Client is closed")]
    Closed,

    /// Non-retriable transport failure (unknown topic, malformed request).
    #[error("Transport error: {0}")]
    Transport(TransportError),

    /// Kafka client error raised while building a client.
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    /// JSON serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<TransportError> for Error {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Unreachable(message) => Error::Connection(message),
            other => Error::Transport(other),
        }
    }
}

/// A payload could not be decoded into a price update.
#[derive(Error, Debug)]
#[error("Invalid price-update payload: {message}")]
pub struct DecodeError {
    message: String,
}

impl DecodeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Failure reported by a broker session.
///
/// Only [`TransportError::Transient`] is retried by the producer; every other
/// variant means retrying the same request cannot succeed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Network error, leader not available, timeout and similar conditions.
    #[error("transient broker failure: {0}")]
    Transient(String),

    #[error("unknown topic '{0}'")]
    UnknownTopic(String),

    #[error("unknown partition {partition} for topic '{topic}'")]
    UnknownPartition { topic: String, partition: i32 },

    /// The request itself was rejected (bad payload, wrong state).
    #[error("request rejected: {0}")]
    Rejected(String),

    /// The session is gone and must be re-established by its owner.
    #[error("broker unreachable: {0}")]
    Unreachable(String),
}

impl TransportError {
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Transient(_))
    }
}

/// A convenient Result type alias for price-pipeline operations.
///
/// This is equivalent to `std::result::Result<T, price_pipeline::Error>`.
pub type Result<T> = std::result::Result<T, Error>;
