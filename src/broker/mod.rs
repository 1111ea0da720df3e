//! The seam between the clients and the log service.
//!
//! A client owns exactly one transport session. Producer sessions carry
//! [`ProduceRequest`]s; consumer sessions join a group, poll batches and
//! commit offsets. [`crate::kafka`] talks to a Kafka cluster and
//! [`memory`] keeps everything in process.

pub mod memory;

use crate::error::TransportError;
use crate::producer::Acks;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeSet;
use std::time::Duration;

pub use memory::MemoryBroker;

/// Transport result.
pub type TransportResult<T> = std::result::Result<T, TransportError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProduceRequest {
    pub topic: String,
    pub partition: i32,
    pub key: Option<String>,
    pub payload: Bytes,
    pub acks: Acks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProduceResponse {
    pub partition: i32,
    /// `None` when the request was sent without acknowledgment.
    pub offset: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollRequest {
    pub group_id: String,
    pub topics: BTreeSet<String>,
    pub timeout: Duration,
    pub max_records: usize,
}

/// One record as returned by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumedRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: Bytes,
}

/// Records from one poll, in offset order per partition.
pub type Batch = Vec<ConsumedRecord>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollResponse {
    pub batch: Batch,
}

/// Producer side of a broker session.
#[async_trait]
pub trait ProducerTransport: Send + Sync {
    async fn partition_count(&self, topic: &str) -> TransportResult<i32>;

    async fn produce(&self, request: ProduceRequest) -> TransportResult<ProduceResponse>;

    /// Waits for everything handed to the session to be acknowledged.
    async fn flush(&self, timeout: Duration) -> TransportResult<()>;

    /// Releases the session. Called at most once.
    async fn close(&self);
}

/// Consumer side of a broker session, bound to one group member.
#[async_trait]
pub trait ConsumerTransport: Send {
    /// Joins the group for the given topics.
    async fn subscribe(&mut self, group_id: &str, topics: &BTreeSet<String>) -> TransportResult<()>;

    async fn poll(&mut self, request: &PollRequest) -> TransportResult<PollResponse>;

    /// Commits `next_offset` as the group's position for one partition.
    async fn commit(&mut self, topic: &str, partition: i32, next_offset: i64) -> TransportResult<()>;

    /// Leaves the group and releases the session. Called at most once.
    async fn close(&mut self);
}
