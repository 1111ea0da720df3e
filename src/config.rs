use crate::producer::Acks;
use crate::topic::{KeyStrategy, PartitionStrategy};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub producer: ProducerConfig,
    #[serde(default)]
    pub consumers: Vec<ConsumerGroupConfig>,
    #[serde(default)]
    pub topics: Vec<TopicConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProducerConfig {
    pub client_id: String,
    pub bootstrap_servers: Vec<String>,
    #[serde(default)]
    pub acks: Acks,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_message_timeout_ms")]
    pub message_timeout_ms: u64,
    #[serde(default)]
    pub partitioner: PartitionStrategy,
    #[serde(default)]
    pub key_strategy: KeyStrategy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AutoOffsetReset {
    Earliest,
    #[default]
    Latest,
}

impl AutoOffsetReset {
    pub fn as_str(&self) -> &'static str {
        match self {
            AutoOffsetReset::Earliest => "earliest",
            AutoOffsetReset::Latest => "latest",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConsumerGroupConfig {
    pub group_id: String,
    pub bootstrap_servers: Vec<String>,
    pub topics: BTreeSet<String>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default)]
    pub auto_offset_reset: AutoOffsetReset,
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TopicConfig {
    pub name: String,
    #[serde(default = "default_partitions")]
    pub partitions: i32,
    #[serde(default = "default_replication_factor")]
    pub replication_factor: i32,
}

impl Config {
    /// Loads a TOML file, then applies `PRICE_PIPELINE__...` environment overrides.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("PRICE_PIPELINE")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()
            .map_err(|e| Error::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.producer.validate()?;
        for consumer in &self.consumers {
            consumer.validate()?;
        }
        for topic in &self.topics {
            if topic.name.is_empty() {
                return Err(Error::Config("topic name must not be empty".to_string()));
            }
            if topic.partitions <= 0 || topic.replication_factor <= 0 {
                return Err(Error::Config(format!(
                    "topic '{}' needs positive partitions and replication factor",
                    topic.name
                )));
            }
        }
        Ok(())
    }

    pub fn consumer(&self, group_id: &str) -> Option<&ConsumerGroupConfig> {
        self.consumers.iter().find(|c| c.group_id == group_id)
    }
}

impl ProducerConfig {
    pub fn new(client_id: impl Into<String>, bootstrap_servers: Vec<String>) -> Self {
        Self {
            client_id: client_id.into(),
            bootstrap_servers,
            acks: Acks::default(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            message_timeout_ms: default_message_timeout_ms(),
            partitioner: PartitionStrategy::default(),
            key_strategy: KeyStrategy::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.client_id.is_empty() {
            return Err(Error::Config("producer client_id must not be empty".to_string()));
        }
        if self.bootstrap_servers.is_empty() {
            return Err(Error::Config(
                "producer bootstrap_servers must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn message_timeout(&self) -> Duration {
        Duration::from_millis(self.message_timeout_ms)
    }
}

impl ConsumerGroupConfig {
    pub fn new(
        group_id: impl Into<String>,
        bootstrap_servers: Vec<String>,
        topics: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            group_id: group_id.into(),
            bootstrap_servers,
            topics: topics.into_iter().map(Into::into).collect(),
            poll_interval_ms: default_poll_interval_ms(),
            poll_timeout_ms: default_poll_timeout_ms(),
            max_batch_size: default_max_batch_size(),
            auto_offset_reset: AutoOffsetReset::default(),
            session_timeout_ms: default_session_timeout_ms(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.group_id.is_empty() {
            return Err(Error::Config("consumer group_id must not be empty".to_string()));
        }
        if self.bootstrap_servers.is_empty() {
            return Err(Error::Config(format!(
                "consumer group '{}' has no bootstrap_servers",
                self.group_id
            )));
        }
        if self.topics.is_empty() {
            return Err(Error::Config(format!(
                "consumer group '{}' has no topics",
                self.group_id
            )));
        }
        if self.poll_interval_ms == 0 {
            return Err(Error::Config(format!(
                "consumer group '{}' needs a positive poll_interval_ms",
                self.group_id
            )));
        }
        if self.max_batch_size == 0 {
            return Err(Error::Config(format!(
                "consumer group '{}' needs a positive max_batch_size",
                self.group_id
            )));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    100
}

fn default_message_timeout_ms() -> u64 {
    5000
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_poll_timeout_ms() -> u64 {
    500
}

fn default_max_batch_size() -> usize {
    500
}

fn default_session_timeout_ms() -> u64 {
    30000
}

fn default_partitions() -> i32 {
    1
}

fn default_replication_factor() -> i32 {
    1
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const SAMPLE: &str = r#"
[producer]
client_id = "admin-api"
bootstrap_servers = ["localhost:9092"]
acks = "all"
max_retries = 3
partitioner = { fixed = 0 }

[[consumers]]
group_id = "inventorySystem"
bootstrap_servers = ["localhost:9092"]
topics = ["product-price"]
poll_interval_ms = 1000

[[consumers]]
group_id = "pricingAnalytics"
bootstrap_servers = ["localhost:9092", "localhost:9093"]
topics = ["product-price"]
auto_offset_reset = "earliest"

[[topics]]
name = "product-price"
partitions = 2
"#;

    fn write_config(contents: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_from_file() {
        let file = write_config(SAMPLE);
        let config = Config::from_file(file.path()).unwrap();

        assert_eq!(config.producer.client_id, "admin-api");
        assert_eq!(config.producer.acks, Acks::All);
        assert_eq!(config.producer.partitioner, PartitionStrategy::Fixed(0));
        assert_eq!(config.producer.retry_backoff_ms, 100);

        let inventory = config.consumer("inventorySystem").unwrap();
        assert_eq!(inventory.poll_interval(), Duration::from_secs(1));
        assert_eq!(inventory.auto_offset_reset, AutoOffsetReset::Latest);
        assert!(inventory.topics.contains("product-price"));

        let analytics = config.consumer("pricingAnalytics").unwrap();
        assert_eq!(analytics.bootstrap_servers.len(), 2);
        assert_eq!(analytics.auto_offset_reset, AutoOffsetReset::Earliest);

        assert_eq!(config.topics[0].name, "product-price");
        assert_eq!(config.topics[0].partitions, 2);
        assert_eq!(config.topics[0].replication_factor, 1);
    }

    #[test]
    fn test_zero_poll_interval_rejected() {
        let file = write_config(&SAMPLE.replace("poll_interval_ms = 1000", "poll_interval_ms = 0"));
        let err = Config::from_file(file.path()).unwrap_err();
        assert!(matches!(err, Error::Config(msg) if msg.contains("poll_interval_ms")));
    }

    #[test]
    fn test_missing_required_field_rejected() {
        let file = write_config("[producer]\nclient_id = \"x\"\n");
        assert!(matches!(
            Config::from_file(file.path()).unwrap_err(),
            Error::Config(_)
        ));
    }

    #[test]
    fn test_consumer_validation() {
        let mut consumer = ConsumerGroupConfig::new(
            "inventorySystem",
            vec!["localhost:9092".to_string()],
            ["product-price"],
        );
        assert!(consumer.validate().is_ok());

        consumer.topics.clear();
        assert!(consumer.validate().is_err());

        let consumer = ConsumerGroupConfig::new("", vec!["localhost:9092".to_string()], ["t"]);
        assert!(consumer.validate().is_err());
    }

    #[test]
    fn test_producer_defaults() {
        let producer = ProducerConfig::new("admin-api", vec!["localhost:9092".to_string()]);
        assert_eq!(producer.max_retries, 3);
        assert_eq!(producer.acks, Acks::All);
        assert_eq!(producer.message_timeout(), Duration::from_secs(5));
        assert!(producer.validate().is_ok());

        let producer = ProducerConfig::new("admin-api", Vec::new());
        assert!(producer.validate().is_err());
    }
}
