use crate::codec::PriceUpdate;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

/// How a partition is chosen when the record does not name one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PartitionStrategy {
    /// Cycle through partitions, one counter per topic.
    #[default]
    RoundRobin,
    /// Same key, same partition. Records without a key go round-robin.
    KeyHash,
    /// Pin every record to one partition.
    Fixed(i32),
}

/// Derives the record key from an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum KeyStrategy {
    /// Key by product so one product's updates stay in order.
    ProductName,
    #[default]
    None,
}

impl KeyStrategy {
    pub fn extract_key(&self, event: &PriceUpdate) -> Option<String> {
        match self {
            KeyStrategy::ProductName => Some(event.product_name().to_string()),
            KeyStrategy::None => None,
        }
    }
}

/// Stateful partition selector; holds the round-robin cursors.
#[derive(Debug, Default)]
pub struct PartitionSelector {
    strategy: PartitionStrategy,
    cursors: Mutex<HashMap<String, u32>>,
}

impl PartitionSelector {
    pub fn new(strategy: PartitionStrategy) -> Self {
        Self {
            strategy,
            cursors: Mutex::new(HashMap::new()),
        }
    }

    /// Resolves the partition for one record.
    ///
    /// An explicit partition is returned unchanged when it lies in
    /// `[0, partition_count)` and rejected otherwise. Without one, the
    /// configured strategy picks a partition in that range.
    pub fn select_partition(
        &self,
        topic: &str,
        explicit: Option<i32>,
        partition_count: i32,
        key: Option<&str>,
    ) -> Result<i32> {
        if partition_count <= 0 {
            return Err(invalid(topic, explicit.unwrap_or(0), partition_count));
        }

        if let Some(partition) = explicit {
            return check_range(topic, partition, partition_count);
        }

        let partition = match (self.strategy, key) {
            (PartitionStrategy::Fixed(partition), _) => {
                return check_range(topic, partition, partition_count)
            }
            (PartitionStrategy::KeyHash, Some(key)) => hash_partition(key, partition_count),
            _ => self.next_round_robin(topic, partition_count),
        };

        debug!(topic, partition, strategy = ?self.strategy, "Selected partition");
        Ok(partition)
    }

    fn next_round_robin(&self, topic: &str, partition_count: i32) -> i32 {
        let mut cursors = self
            .cursors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let cursor = cursors.entry(topic.to_string()).or_insert(0);
        let partition = (*cursor % partition_count as u32) as i32;
        *cursor = cursor.wrapping_add(1);
        partition
    }
}

fn check_range(topic: &str, partition: i32, partition_count: i32) -> Result<i32> {
    if (0..partition_count).contains(&partition) {
        Ok(partition)
    } else {
        Err(invalid(topic, partition, partition_count))
    }
}

fn invalid(topic: &str, partition: i32, partition_count: i32) -> Error {
    Error::InvalidPartition {
        topic: topic.to_string(),
        partition,
        partition_count,
    }
}

/// Same mapping as Kafka's default partitioner, so keyed records land where
/// the Java client would put them.
fn hash_partition(key: &str, partition_count: i32) -> i32 {
    ((murmur2(key.as_bytes()) & 0x7fff_ffff) % partition_count as u32) as i32
}

/// Kafka's murmur2 variant (seed `0x9747b28c`).
fn murmur2(data: &[u8]) -> u32 {
    const M: u32 = 0x5bd1_e995;
    const R: u32 = 24;

    let mut h = 0x9747_b28c ^ data.len() as u32;

    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);
        h = h.wrapping_mul(M);
        h ^= k;
    }

    let tail = chunks.remainder();
    if tail.len() >= 3 {
        h ^= u32::from(tail[2]) << 16;
    }
    if tail.len() >= 2 {
        h ^= u32::from(tail[1]) << 8;
    }
    if !tail.is_empty() {
        h ^= u32::from(tail[0]);
        h = h.wrapping_mul(M);
    }

    h ^= h >> 13;
    h = h.wrapping_mul(M);
    h ^= h >> 15;
    h
}
