#![allow(dead_code)]

use async_trait::async_trait;
use price_pipeline::config::{AutoOffsetReset, ConsumerGroupConfig, ProducerConfig};
use price_pipeline::{Acks, Delivery, RecordHandler};
use std::env;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const TOPIC: &str = "product-price";

/// Broker list for tests that need a running Kafka.
pub fn test_brokers() -> Vec<String> {
    env::var("TEST_KAFKA_BROKERS")
        .unwrap_or_else(|_| "localhost:9092".to_string())
        .split(',')
        .map(|s| s.trim().to_string())
        .collect()
}

pub fn producer_config(brokers: Vec<String>) -> ProducerConfig {
    let mut config = ProducerConfig::new("admin-api", brokers);
    config.acks = Acks::All;
    config.max_retries = 3;
    config.retry_backoff_ms = 1;
    config
}

pub fn consumer_config(group_id: &str, brokers: Vec<String>, poll_interval_ms: u64) -> ConsumerGroupConfig {
    let mut config = ConsumerGroupConfig::new(group_id, brokers, [TOPIC]);
    config.poll_interval_ms = poll_interval_ms;
    config.poll_timeout_ms = 50;
    config.auto_offset_reset = AutoOffsetReset::Latest;
    config
}

pub fn memory() -> Vec<String> {
    vec!["memory".to_string()]
}

/// Records every delivery it sees.
#[derive(Clone, Default)]
pub struct Recorder {
    deliveries: Arc<Mutex<Vec<Delivery>>>,
}

impl Recorder {
    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.deliveries.lock().unwrap().len()
    }
}

#[async_trait]
impl RecordHandler for Recorder {
    async fn handle(&self, delivery: &Delivery) -> anyhow::Result<()> {
        self.deliveries.lock().unwrap().push(delivery.clone());
        Ok(())
    }
}

/// Polls `check` until it holds or `limit` passes.
pub async fn wait_until(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
