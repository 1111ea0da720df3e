//! Producer client: partition-aware sends with bounded retry.
//!
//! Every send resolves its partition against the topic's partition count,
//! then hands a [`ProduceRequest`] to the transport. Transient failures are
//! retried up to `max_retries` times with exponential backoff; anything else
//! fails the send immediately.
//!
//! # Example
//!
//! ```rust
//! use price_pipeline::broker::MemoryBroker;
//! use price_pipeline::codec::PriceUpdate;
//! use price_pipeline::config::ProducerConfig;
//! use price_pipeline::producer::{Acks, ProducerClient};
//! use rust_decimal::Decimal;
//!
//! # #[tokio::main]
//! # async fn main() -> price_pipeline::Result<()> {
//! let broker = MemoryBroker::new();
//! broker.create_topic("product-price", 1);
//!
//! let mut config = ProducerConfig::new("admin-api", vec!["memory".to_string()]);
//! config.acks = Acks::All;
//! let producer = ProducerClient::new(config, broker.producer()?)?;
//!
//! let event = PriceUpdate::new("ABC", Decimal::new(10000, 2));
//! let result = producer.send_event("product-price", &event, Some(0)).await?;
//! assert_eq!(result.offset, Some(0));
//!
//! producer.close().await;
//! # Ok(())
//! # }
//! ```

use crate::broker::{ProduceRequest, ProducerTransport};
use crate::codec::{self, PriceUpdate};
use crate::config::ProducerConfig;
use crate::error::TransportError;
use crate::topic::PartitionSelector;
use crate::{Error, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// How many replicas must confirm a write before it counts as delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Acks {
    /// Fire-and-forget; no offset is reported.
    None,
    Leader,
    #[default]
    All,
}

impl Acks {
    /// Value of librdkafka's `acks` property.
    pub fn as_kafka_str(&self) -> &'static str {
        match self {
            Acks::None => "0",
            Acks::Leader => "1",
            Acks::All => "all",
        }
    }
}

/// An outgoing record. The offset is assigned by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub topic: String,
    pub partition: Option<i32>,
    pub key: Option<String>,
    pub payload: Bytes,
}

impl Record {
    pub fn new(topic: impl Into<String>, payload: Bytes) -> Self {
        Self {
            topic: topic.into(),
            partition: None,
            key: None,
            payload,
        }
    }

    /// A record carrying the encoding of exactly one event.
    pub fn from_event(topic: impl Into<String>, event: &PriceUpdate) -> Self {
        Self::new(topic, codec::encode(event))
    }

    pub fn with_partition(mut self, partition: i32) -> Self {
        self.partition = Some(partition);
        self
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendResult {
    pub topic: String,
    pub partition: i32,
    /// `None` when sent with [`Acks::None`].
    pub offset: Option<i64>,
    pub attempts: u32,
}

enum AttemptError {
    Retriable(TransportError),
    Fatal(Error),
}

impl From<TransportError> for AttemptError {
    fn from(err: TransportError) -> Self {
        if err.is_transient() {
            AttemptError::Retriable(err)
        } else {
            AttemptError::Fatal(err.into())
        }
    }
}

/// Publishes records through one exclusively owned transport session.
pub struct ProducerClient<T: ProducerTransport> {
    config: ProducerConfig,
    transport: T,
    selector: PartitionSelector,
    /// Sends hold the read side, flush and close the write side. `true` once closed.
    gate: RwLock<bool>,
}

impl<T: ProducerTransport> ProducerClient<T> {
    pub fn new(config: ProducerConfig, transport: T) -> Result<Self> {
        config.validate()?;

        info!(
            client_id = %config.client_id,
            acks = ?config.acks,
            max_retries = config.max_retries,
            "Producer client created"
        );

        Ok(Self {
            selector: PartitionSelector::new(config.partitioner),
            config,
            transport,
            gate: RwLock::new(false),
        })
    }

    /// Encodes `event`, keys it with the configured strategy and sends it.
    pub async fn send_event(
        &self,
        topic: &str,
        event: &PriceUpdate,
        partition: Option<i32>,
    ) -> Result<SendResult> {
        let mut record = Record::from_event(topic, event);
        record.partition = partition;
        record.key = self.config.key_strategy.extract_key(event);
        self.send(record).await
    }

    /// Sends one record, retrying transient failures up to `max_retries` times.
    #[instrument(skip(self, record), fields(topic = %record.topic, client_id = %self.config.client_id))]
    pub async fn send(&self, record: Record) -> Result<SendResult> {
        let closed = self.gate.read().await;
        if *closed {
            return Err(Error::Closed);
        }

        let max_attempts = self.config.max_retries.saturating_add(1);
        let mut backoff = self.config.retry_backoff();
        let mut attempt = 0;

        loop {
            attempt += 1;

            match self.attempt(&record).await {
                Ok((partition, offset)) => {
                    debug!(partition, ?offset, attempt, "Record delivered");
                    return Ok(SendResult {
                        topic: record.topic,
                        partition,
                        offset,
                        attempts: attempt,
                    });
                }
                Err(AttemptError::Retriable(cause)) if attempt < max_attempts => {
                    warn!(
                        attempt,
                        max_attempts,
                        error = %cause,
                        "Transient delivery failure, retrying in {:?}",
                        backoff
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
                Err(AttemptError::Retriable(cause)) => {
                    warn!(attempts = attempt, error = %cause, "Delivery retries exhausted");
                    return Err(Error::Delivery {
                        topic: record.topic,
                        attempts: attempt,
                        source: cause,
                    });
                }
                Err(AttemptError::Fatal(err)) => {
                    warn!(attempt, error = %err, "Record rejected");
                    return Err(err);
                }
            }
        }
    }

    async fn attempt(&self, record: &Record) -> std::result::Result<(i32, Option<i64>), AttemptError> {
        let partition_count = self.transport.partition_count(&record.topic).await?;
        let partition = self
            .selector
            .select_partition(
                &record.topic,
                record.partition,
                partition_count,
                record.key.as_deref(),
            )
            .map_err(AttemptError::Fatal)?;

        let response = self
            .transport
            .produce(ProduceRequest {
                topic: record.topic.clone(),
                partition,
                key: record.key.clone(),
                payload: record.payload.clone(),
                acks: self.config.acks,
            })
            .await?;

        Ok((response.partition, response.offset))
    }

    /// Waits for every send submitted before this call. Sends issued while
    /// flushing wait until it finishes.
    pub async fn flush(&self) -> Result<()> {
        let closed = self.gate.write().await;
        if *closed {
            return Err(Error::Closed);
        }

        self.transport
            .flush(self.config.message_timeout())
            .await
            .map_err(Error::from)
    }

    /// Flushes and releases the transport. Safe to call more than once.
    pub async fn close(&self) {
        let mut closed = self.gate.write().await;
        if *closed {
            debug!("Producer already closed");
            return;
        }

        if let Err(e) = self.transport.flush(self.config.message_timeout()).await {
            warn!(error = %e, "Flush before close failed");
        }
        self.transport.close().await;
        *closed = true;

        info!(client_id = %self.config.client_id, "Producer client closed");
    }

    pub async fn is_closed(&self) -> bool {
        *self.gate.read().await
    }
}
