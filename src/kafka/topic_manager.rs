use super::classify;
use crate::config::TopicConfig;
use crate::{Error, Result};
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::ClientConfig;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Creates the pipeline's topics on a Kafka cluster.
pub struct TopicManager {
    admin_client: AdminClient<DefaultClientContext>,
    verified_topics: HashSet<String>,
}

impl TopicManager {
    pub fn new(brokers: &[String]) -> Result<Self> {
        let admin_client: AdminClient<_> = ClientConfig::new()
            .set("bootstrap.servers", brokers.join(","))
            .create()
            .map_err(Error::Kafka)?;

        Ok(Self {
            admin_client,
            verified_topics: HashSet::new(),
        })
    }

    #[instrument(skip(self, topic), fields(topic = %topic.name))]
    pub async fn ensure_topic_exists(&mut self, topic: &TopicConfig) -> Result<()> {
        if self.verified_topics.contains(&topic.name) {
            debug!("Topic '{}' already verified to exist", topic.name);
            return Ok(());
        }

        match self.partition_count(&topic.name) {
            Ok(Some(partitions)) => {
                if partitions != topic.partitions {
                    warn!(
                        existing = partitions,
                        configured = topic.partitions,
                        "Topic '{}' exists with a different partition count",
                        topic.name
                    );
                } else {
                    info!("Topic '{}' already exists", topic.name);
                }
            }
            Ok(None) => {
                info!(
                    partitions = topic.partitions,
                    replication_factor = topic.replication_factor,
                    "Creating topic '{}'",
                    topic.name
                );
                self.create_topic(topic).await?;
            }
            Err(e) => {
                warn!("Failed to check if topic '{}' exists: {}", topic.name, e);
                return Err(e);
            }
        }

        self.verified_topics.insert(topic.name.clone());
        Ok(())
    }

    /// Partition count of an existing topic, `None` if it does not exist.
    pub fn partition_count(&self, topic_name: &str) -> Result<Option<i32>> {
        let metadata = self
            .admin_client
            .inner()
            .fetch_metadata(Some(topic_name), Duration::from_secs(5))
            .map_err(|e| Error::from(classify(&e, Some(topic_name))))?;

        Ok(metadata
            .topics()
            .iter()
            .find(|topic| topic.name() == topic_name)
            .map(|topic| topic.partitions().len() as i32)
            .filter(|count| *count > 0))
    }

    async fn create_topic(&self, topic: &TopicConfig) -> Result<()> {
        let new_topic = NewTopic::new(
            &topic.name,
            topic.partitions,
            TopicReplication::Fixed(topic.replication_factor),
        )
        .set("cleanup.policy", "delete");

        let opts = AdminOptions::new().operation_timeout(Some(Duration::from_secs(30)));

        let results = self
            .admin_client
            .create_topics(&[new_topic], &opts)
            .await
            .map_err(Error::Kafka)?;

        for result in results {
            match result {
                Ok(name) => info!("Successfully created topic: {}", name),
                Err((_name, error)) => {
                    return Err(Error::Kafka(rdkafka::error::KafkaError::AdminOp(error)));
                }
            }
        }

        Ok(())
    }

    pub async fn delete_topic(&mut self, topic_name: &str) -> Result<()> {
        let opts = AdminOptions::new().operation_timeout(Some(Duration::from_secs(30)));

        let results = self
            .admin_client
            .delete_topics(&[topic_name], &opts)
            .await
            .map_err(Error::Kafka)?;

        for result in results {
            match result {
                Ok(name) => info!("Successfully deleted topic: {}", name),
                Err((_name, error)) => {
                    return Err(Error::Kafka(rdkafka::error::KafkaError::AdminOp(error)));
                }
            }
        }

        self.verified_topics.remove(topic_name);
        Ok(())
    }
}
