use super::classify;
use crate::broker::{ConsumedRecord, ConsumerTransport, PollRequest, PollResponse, TransportResult};
use crate::config::ConsumerGroupConfig;
use crate::error::TransportError;
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::FutureExt;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::OwnedMessage;
use rdkafka::{ClientConfig, Message, Offset, TopicPartitionList};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const METADATA_TIMEOUT: Duration = Duration::from_secs(5);

/// Consumer session on a Kafka cluster; one group member.
///
/// Auto-commit and auto offset store are off: offsets move only through
/// [`ConsumerTransport::commit`].
pub struct KafkaConsumer {
    /// `None` once closed.
    consumer: Option<Arc<StreamConsumer>>,
}

impl KafkaConsumer {
    pub fn new(config: &ConsumerGroupConfig) -> Result<Self> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("group.id", &config.group_id)
            .set("bootstrap.servers", config.bootstrap_servers.join(","))
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("enable.partition.eof", "false")
            .set("auto.offset.reset", config.auto_offset_reset.as_str())
            .set("session.timeout.ms", config.session_timeout_ms.to_string())
            .create()
            .map_err(Error::Kafka)?;

        info!(group_id = %config.group_id, brokers = ?config.bootstrap_servers, "Kafka consumer created");

        Ok(Self {
            consumer: Some(Arc::new(consumer)),
        })
    }

    fn session(&self) -> TransportResult<&Arc<StreamConsumer>> {
        self.consumer
            .as_ref()
            .ok_or_else(|| TransportError::Unreachable("consumer is closed".to_string()))
    }
}

fn to_record(message: OwnedMessage) -> ConsumedRecord {
    ConsumedRecord {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        key: message
            .key()
            .map(|key| String::from_utf8_lossy(key).into_owned()),
        payload: message
            .payload()
            .map(Bytes::copy_from_slice)
            .unwrap_or_default(),
    }
}

#[async_trait]
impl ConsumerTransport for KafkaConsumer {
    async fn subscribe(&mut self, group_id: &str, topics: &BTreeSet<String>) -> TransportResult<()> {
        // Creating the client does not connect; fail here if no broker answers.
        let consumer = self.session()?.clone();
        tokio::task::spawn_blocking(move || {
            consumer
                .fetch_metadata(None, METADATA_TIMEOUT)
                .map(|_| ())
                .map_err(|e| TransportError::Unreachable(e.to_string()))
        })
        .await
        .map_err(|e| TransportError::Unreachable(format!("metadata task failed: {}", e)))??;

        let names: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.session()?
            .subscribe(&names)
            .map_err(|e| TransportError::Rejected(e.to_string()))?;

        info!(group_id, ?topics, "Subscribed to Kafka topics");
        Ok(())
    }

    async fn poll(&mut self, request: &PollRequest) -> TransportResult<PollResponse> {
        let consumer = self.session()?;
        let first = match tokio::time::timeout(request.timeout, consumer.recv()).await {
            Err(_) => return Ok(PollResponse::default()),
            Ok(Err(e)) => return Err(classify(&e, None)),
            Ok(Ok(message)) => message.detach(),
        };

        let mut batch = vec![to_record(first)];
        while batch.len() < request.max_records {
            match consumer.recv().now_or_never() {
                Some(Ok(message)) => batch.push(to_record(message.detach())),
                Some(Err(e)) => {
                    warn!(error = %e, "Stopped filling batch after consumer error");
                    break;
                }
                None => break,
            }
        }

        debug!(group_id = %request.group_id, records = batch.len(), "Polled batch");
        Ok(PollResponse { batch })
    }

    async fn commit(&mut self, topic: &str, partition: i32, next_offset: i64) -> TransportResult<()> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(topic, partition, Offset::Offset(next_offset))
            .map_err(|e| TransportError::Rejected(e.to_string()))?;

        self.session()?
            .commit(&tpl, CommitMode::Async)
            .map_err(|e| classify(&e, Some(topic)))
    }

    /// Leaves the group and drops the librdkafka client. Later calls fail
    /// with [`TransportError::Unreachable`].
    async fn close(&mut self) {
        let Some(consumer) = self.consumer.take() else {
            return;
        };

        consumer.unsubscribe();
        // Dropping waits for the consumer queue to close; keep that off the runtime.
        if let Err(e) = tokio::task::spawn_blocking(move || drop(consumer)).await {
            warn!(error = %e, "Kafka consumer teardown failed");
        }
        info!("Kafka consumer left its group");
    }
}
