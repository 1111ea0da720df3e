use super::classify;
use crate::broker::{ProduceRequest, ProduceResponse, ProducerTransport, TransportResult};
use crate::config::ProducerConfig;
use crate::error::TransportError;
use crate::producer::Acks;
use crate::{Error, Result};
use async_trait::async_trait;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::ClientConfig;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Producer session on a Kafka cluster.
///
/// librdkafka's own retries are disabled; retrying is left to
/// [`crate::producer::ProducerClient`] so attempts stay bounded by its config.
pub struct KafkaProducer {
    /// `None` once closed.
    producer: Mutex<Option<FutureProducer>>,
    message_timeout: Duration,
}

impl KafkaProducer {
    pub fn new(config: &ProducerConfig) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", config.bootstrap_servers.join(","))
            .set("client.id", &config.client_id)
            .set("acks", config.acks.as_kafka_str())
            .set("message.send.max.retries", "0")
            .set("message.timeout.ms", config.message_timeout_ms.to_string())
            .set("linger.ms", "0")
            .create()
            .map_err(Error::Kafka)?;

        info!(
            client_id = %config.client_id,
            brokers = ?config.bootstrap_servers,
            acks = config.acks.as_kafka_str(),
            "Kafka producer created"
        );

        Ok(Self {
            producer: Mutex::new(Some(producer)),
            message_timeout: config.message_timeout(),
        })
    }

    fn session(&self) -> TransportResult<FutureProducer> {
        self.producer
            .lock()
            .map_err(|_| TransportError::Unreachable("producer lock poisoned".to_string()))?
            .clone()
            .ok_or_else(|| TransportError::Unreachable("producer is closed".to_string()))
    }
}

#[async_trait]
impl ProducerTransport for KafkaProducer {
    async fn partition_count(&self, topic: &str) -> TransportResult<i32> {
        let producer = self.session()?;
        let name = topic.to_string();
        let timeout = self.message_timeout;

        tokio::task::spawn_blocking(move || {
            let metadata = producer
                .client()
                .fetch_metadata(Some(&name), timeout)
                .map_err(|e| classify(&e, Some(&name)))?;

            metadata
                .topics()
                .iter()
                .find(|t| t.name() == name)
                .map(|t| t.partitions().len() as i32)
                .filter(|count| *count > 0)
                .ok_or_else(|| TransportError::UnknownTopic(name.clone()))
        })
        .await
        .map_err(|e| TransportError::Transient(format!("metadata task failed: {}", e)))?
    }

    async fn produce(&self, request: ProduceRequest) -> TransportResult<ProduceResponse> {
        let record: FutureRecord<'_, str, [u8]> = FutureRecord::to(&request.topic)
            .payload(request.payload.as_ref())
            .partition(request.partition);
        let record = match &request.key {
            Some(key) => record.key(key.as_str()),
            None => record,
        };

        let producer = self.session()?;
        let (partition, offset) = producer
            .send(record, Timeout::After(self.message_timeout))
            .await
            .map_err(|(e, _)| classify(&e, Some(&request.topic)))?;

        debug!(topic = %request.topic, partition, offset, "Kafka delivery report");

        Ok(ProduceResponse {
            partition,
            offset: match request.acks {
                Acks::None => None,
                Acks::Leader | Acks::All => Some(offset).filter(|o| *o >= 0),
            },
        })
    }

    async fn flush(&self, timeout: Duration) -> TransportResult<()> {
        let producer = self.session()?;
        tokio::task::spawn_blocking(move || producer.flush(Timeout::After(timeout)))
            .await
            .map_err(|e| TransportError::Transient(format!("flush task failed: {}", e)))?
            .map_err(|e| classify(&e, None))
    }

    /// Drops the librdkafka client, which shuts down its broker connections
    /// and threads. Later calls fail with [`TransportError::Unreachable`].
    async fn close(&self) {
        let producer = match self.producer.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(producer) = producer else {
            return;
        };

        // Dropping purges and flushes for up to 500ms; keep that off the runtime.
        if let Err(e) = tokio::task::spawn_blocking(move || drop(producer)).await {
            warn!(error = %e, "Kafka producer teardown failed");
        }
        info!("Kafka producer closed");
    }
}
