//! In-process broker for tests and `--memory` runs.
//!
//! Keeps one append-only log per partition, committed offsets per group and
//! a range assignment of partitions over the members of a group. Nothing is
//! replicated or persisted. Faults can be injected to exercise the retry and
//! connection paths of the clients.

use super::{
    ConsumedRecord, ConsumerTransport, PollRequest, PollResponse, ProduceRequest, ProduceResponse,
    ProducerTransport, TransportResult,
};
use crate::config::AutoOffsetReset;
use crate::error::TransportError;
use crate::producer::Acks;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info};

#[derive(Debug, Clone)]
struct StoredRecord {
    key: Option<String>,
    payload: Bytes,
}

#[derive(Debug, Default)]
struct GroupState {
    /// member id -> subscribed topics
    members: BTreeMap<String, BTreeSet<String>>,
    committed: HashMap<(String, i32), i64>,
    generation: u64,
}

#[derive(Debug)]
struct State {
    topics: HashMap<String, Vec<Vec<StoredRecord>>>,
    groups: HashMap<String, GroupState>,
    reachable: bool,
    injected_produce_failures: usize,
    produce_attempts: u64,
    next_member_id: u64,
    open_sessions: usize,
}

impl Default for State {
    fn default() -> Self {
        Self {
            topics: HashMap::new(),
            groups: HashMap::new(),
            reachable: true,
            injected_produce_failures: 0,
            produce_attempts: 0,
            next_member_id: 0,
            open_sessions: 0,
        }
    }
}

impl State {
    fn log_end(&self, topic: &str, partition: i32) -> i64 {
        self.topics
            .get(topic)
            .and_then(|partitions| partitions.get(partition as usize))
            .map_or(0, |log| log.len() as i64)
    }
}

/// Handle to a shared in-memory broker. Clones refer to the same broker.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
    appended: Arc<Notify>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Creates a topic; an existing topic is left untouched.
    pub fn create_topic(&self, name: &str, partitions: i32) {
        let mut state = self.lock();
        state.topics.entry(name.to_string()).or_insert_with(|| {
            info!(topic = name, partitions, "Created in-memory topic");
            vec![Vec::new(); partitions.max(0) as usize]
        });
    }

    /// Opens a producer session.
    pub fn producer(&self) -> TransportResult<MemoryProducer> {
        self.open_session()?;
        Ok(MemoryProducer {
            broker: self.clone(),
            closed: Mutex::new(false),
        })
    }

    /// Opens a consumer session that starts new groups at `reset`.
    pub fn consumer(&self, reset: AutoOffsetReset) -> TransportResult<MemoryConsumer> {
        let member_id = {
            self.open_session()?;
            let mut state = self.lock();
            state.next_member_id += 1;
            format!("member-{}", state.next_member_id)
        };

        Ok(MemoryConsumer {
            broker: self.clone(),
            member_id,
            group_id: None,
            reset,
            generation: 0,
            positions: HashMap::new(),
            closed: false,
        })
    }

    fn open_session(&self) -> TransportResult<()> {
        let mut state = self.lock();
        if !state.reachable {
            return Err(TransportError::Unreachable(
                "in-memory broker is down".to_string(),
            ));
        }
        state.open_sessions += 1;
        Ok(())
    }

    fn release_session(&self) {
        let mut state = self.lock();
        state.open_sessions = state.open_sessions.saturating_sub(1);
    }

    /// Simulates the broker going away (`false`) or coming back.
    pub fn set_reachable(&self, reachable: bool) {
        self.lock().reachable = reachable;
    }

    /// Makes the next `count` produce attempts fail transiently.
    pub fn fail_next_produces(&self, count: usize) {
        self.lock().injected_produce_failures = count;
    }

    /// Produce attempts seen so far, including failed ones.
    pub fn produce_attempts(&self) -> u64 {
        self.lock().produce_attempts
    }

    /// Sessions opened and not yet released.
    pub fn open_sessions(&self) -> usize {
        self.lock().open_sessions
    }

    pub fn committed_offset(&self, group_id: &str, topic: &str, partition: i32) -> Option<i64> {
        self.lock()
            .groups
            .get(group_id)
            .and_then(|group| group.committed.get(&(topic.to_string(), partition)))
            .copied()
    }

    pub fn log_end_offset(&self, topic: &str, partition: i32) -> i64 {
        self.lock().log_end(topic, partition)
    }

    pub fn group_members(&self, group_id: &str) -> usize {
        self.lock()
            .groups
            .get(group_id)
            .map_or(0, |group| group.members.len())
    }
}

/// Producer session on a [`MemoryBroker`].
#[derive(Debug)]
pub struct MemoryProducer {
    broker: MemoryBroker,
    closed: Mutex<bool>,
}

impl MemoryProducer {
    fn release(&self) {
        let mut closed = self.closed.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !*closed {
            *closed = true;
            self.broker.release_session();
        }
    }
}

#[async_trait]
impl ProducerTransport for MemoryProducer {
    async fn partition_count(&self, topic: &str) -> TransportResult<i32> {
        let state = self.broker.lock();
        if !state.reachable {
            return Err(TransportError::Transient("broker not available".to_string()));
        }

        state
            .topics
            .get(topic)
            .map(|partitions| partitions.len() as i32)
            .ok_or_else(|| TransportError::UnknownTopic(topic.to_string()))
    }

    async fn produce(&self, request: ProduceRequest) -> TransportResult<ProduceResponse> {
        let offset = {
            let mut state = self.broker.lock();
            state.produce_attempts += 1;

            if !state.reachable {
                return Err(TransportError::Transient("broker not available".to_string()));
            }
            if state.injected_produce_failures > 0 {
                state.injected_produce_failures -= 1;
                return Err(TransportError::Transient(
                    "leader not available".to_string(),
                ));
            }

            let log = state
                .topics
                .get_mut(&request.topic)
                .ok_or_else(|| TransportError::UnknownTopic(request.topic.clone()))?
                .get_mut(request.partition as usize)
                .filter(|_| request.partition >= 0)
                .ok_or_else(|| TransportError::UnknownPartition {
                    topic: request.topic.clone(),
                    partition: request.partition,
                })?;

            log.push(StoredRecord {
                key: request.key,
                payload: request.payload,
            });
            log.len() as i64 - 1
        };

        self.broker.appended.notify_waiters();
        debug!(topic = %request.topic, partition = request.partition, offset, "Appended record");

        Ok(ProduceResponse {
            partition: request.partition,
            offset: match request.acks {
                Acks::None => None,
                Acks::Leader | Acks::All => Some(offset),
            },
        })
    }

    async fn flush(&self, _timeout: Duration) -> TransportResult<()> {
        Ok(())
    }

    async fn close(&self) {
        self.release();
    }
}

impl Drop for MemoryProducer {
    fn drop(&mut self) {
        self.release();
    }
}

/// Consumer session on a [`MemoryBroker`]; one group member.
#[derive(Debug)]
pub struct MemoryConsumer {
    broker: MemoryBroker,
    member_id: String,
    group_id: Option<String>,
    reset: AutoOffsetReset,
    generation: u64,
    /// Fetch positions for the current assignment.
    positions: HashMap<(String, i32), i64>,
    closed: bool,
}

impl MemoryConsumer {
    fn release(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let mut state = self.broker.lock();
        if let Some(group) = self
            .group_id
            .as_ref()
            .and_then(|group_id| state.groups.get_mut(group_id))
        {
            group.members.remove(&self.member_id);
            group.generation += 1;
        }
        state.open_sessions = state.open_sessions.saturating_sub(1);
    }

    fn fetch(&mut self, max_records: usize) -> TransportResult<Vec<ConsumedRecord>> {
        let group_id = self
            .group_id
            .clone()
            .ok_or_else(|| TransportError::Rejected("not subscribed".to_string()))?;

        let mut state = self.broker.lock();
        if !state.reachable {
            return Err(TransportError::Transient("broker not available".to_string()));
        }

        let state = &mut *state;
        let group = state
            .groups
            .get_mut(&group_id)
            .ok_or_else(|| TransportError::Rejected(format!("unknown group '{}'", group_id)))?;

        if group.generation != self.generation {
            debug!(member = %self.member_id, group = %group_id, generation = group.generation, "Rebalanced");
            self.generation = group.generation;
            self.positions.clear();
        }

        let assignment = range_assignment(group, &state.topics, &self.member_id);
        let mut batch = Vec::new();

        for (topic, partition) in assignment {
            if batch.len() >= max_records {
                break;
            }
            let Some(log) = state
                .topics
                .get(&topic)
                .and_then(|partitions| partitions.get(partition as usize))
            else {
                continue;
            };

            let key = (topic.clone(), partition);
            let start = match self.positions.get(&key) {
                Some(position) => *position,
                None => *group.committed.entry(key.clone()).or_insert(match self.reset {
                    AutoOffsetReset::Earliest => 0,
                    AutoOffsetReset::Latest => log.len() as i64,
                }),
            };

            let take = (max_records - batch.len()).min(log.len().saturating_sub(start as usize));
            for (i, stored) in log.iter().skip(start as usize).take(take).enumerate() {
                batch.push(ConsumedRecord {
                    topic: topic.clone(),
                    partition,
                    offset: start + i as i64,
                    key: stored.key.clone(),
                    payload: stored.payload.clone(),
                });
            }
            self.positions.insert(key, start + take as i64);
        }

        Ok(batch)
    }
}

/// Partitions of every subscribed topic owned by `member_id`, split in
/// contiguous ranges over the sorted members subscribed to that topic.
fn range_assignment(
    group: &GroupState,
    topics: &HashMap<String, Vec<Vec<StoredRecord>>>,
    member_id: &str,
) -> Vec<(String, i32)> {
    let Some(subscribed) = group.members.get(member_id) else {
        return Vec::new();
    };

    let mut assigned = Vec::new();
    for topic in subscribed {
        let Some(partitions) = topics.get(topic) else {
            continue;
        };
        let members: Vec<&String> = group
            .members
            .iter()
            .filter(|(_, topics)| topics.contains(topic))
            .map(|(id, _)| id)
            .collect();
        let Some(index) = members.iter().position(|id| id.as_str() == member_id) else {
            continue;
        };

        let count = partitions.len();
        let per_member = count / members.len();
        let extra = count % members.len();
        let start = index * per_member + index.min(extra);
        let len = per_member + usize::from(index < extra);

        assigned.extend((start..start + len).map(|p| (topic.clone(), p as i32)));
    }
    assigned
}

#[async_trait]
impl ConsumerTransport for MemoryConsumer {
    async fn subscribe(&mut self, group_id: &str, topics: &BTreeSet<String>) -> TransportResult<()> {
        let mut state = self.broker.lock();
        if !state.reachable {
            return Err(TransportError::Unreachable(
                "in-memory broker is down".to_string(),
            ));
        }

        let state = &mut *state;
        let group = state.groups.entry(group_id.to_string()).or_default();

        // Start positions for a group are fixed when it first sees a partition.
        for topic in topics {
            let Some(partitions) = state.topics.get(topic) else {
                continue;
            };
            for (partition, log) in partitions.iter().enumerate() {
                group
                    .committed
                    .entry((topic.clone(), partition as i32))
                    .or_insert(match self.reset {
                        AutoOffsetReset::Earliest => 0,
                        AutoOffsetReset::Latest => log.len() as i64,
                    });
            }
        }

        group.members.insert(self.member_id.clone(), topics.clone());
        group.generation += 1;
        self.group_id = Some(group_id.to_string());

        info!(member = %self.member_id, group = group_id, ?topics, "Joined group");
        Ok(())
    }

    async fn poll(&mut self, request: &PollRequest) -> TransportResult<PollResponse> {
        let deadline = Instant::now() + request.timeout;
        let appended = self.broker.appended.clone();

        loop {
            let notified = appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = self.fetch(request.max_records)?;
            if !batch.is_empty() || Instant::now() >= deadline {
                return Ok(PollResponse { batch });
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                let batch = self.fetch(request.max_records)?;
                return Ok(PollResponse { batch });
            }
        }
    }

    async fn commit(&mut self, topic: &str, partition: i32, next_offset: i64) -> TransportResult<()> {
        let group_id = self
            .group_id
            .as_ref()
            .ok_or_else(|| TransportError::Rejected("not subscribed".to_string()))?;

        let mut state = self.broker.lock();
        if !state.reachable {
            return Err(TransportError::Transient("broker not available".to_string()));
        }

        let group = state
            .groups
            .get_mut(group_id)
            .filter(|group| group.members.contains_key(&self.member_id))
            .ok_or_else(|| TransportError::Rejected(format!("not a member of '{}'", group_id)))?;
        group
            .committed
            .insert((topic.to_string(), partition), next_offset);
        Ok(())
    }

    async fn close(&mut self) {
        self.release();
    }
}

impl Drop for MemoryConsumer {
    fn drop(&mut self) {
        self.release();
    }
}
