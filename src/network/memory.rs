//! In-process broker.
//!
//! [`InMemoryBroker`] keeps partition logs, group offsets and a queue of
//! injectable faults behind one lock. [`MemoryConnection`] is a client
//! handle to it implementing [`BrokerTransport`].
//!
//! ### Example
//! ```rust,ignore
//! let broker = InMemoryBroker::new().with_default_partitions(3);
//! let config = ClientConfig::new(vec!["127.0.0.1:9092".parse()?]);
//! let conn = broker.connect(&config).await?;
//! ```

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tracing::instrument;

use super::{BrokerAddress, BrokerTransport};
use crate::{
    config::{ClientConfig, OffsetReset},
    error::{Error, KafkaCode, Result, TransportError},
    message::{ConsumedRecord, Message, RecordMetadata, TopicPartition},
    partitioner::murmur2,
    utils::{deadline, now},
};

const DEFAULT_ADVERTISED_ADDR: &str = "127.0.0.1";
const DEFAULT_ADVERTISED_PORT: u16 = 9092;
const DEFAULT_PARTITIONS: i32 = 1;
const DEFAULT_MAX_MESSAGE_BYTES: usize = 1_048_576;

#[derive(Debug)]
struct ClusterState {
    advertised: Vec<BrokerAddress>,
    default_partitions: i32,
    max_message_bytes: usize,
    auto_create_topics: bool,
    topics: HashMap<String, Vec<Vec<ConsumedRecord>>>,
    /// group id -> last committed offset per topic partition
    groups: HashMap<String, BTreeMap<TopicPartition, i64>>,
    round_robin: HashMap<String, u32>,
    send_faults: VecDeque<TransportError>,
    poll_faults: VecDeque<TransportError>,
    commit_faults: VecDeque<TransportError>,
}

impl ClusterState {
    fn create_topic(&mut self, topic: &str, partitions: i32) {
        tracing::debug!("Creating topic {} with {} partitions", topic, partitions);
        self.topics
            .entry(topic.to_owned())
            .or_insert_with(|| vec![Vec::new(); partitions.max(1) as usize]);
    }

    fn log_end(&self, topic_partition: &TopicPartition) -> Option<i64> {
        self.topics
            .get(&topic_partition.0)
            .and_then(|logs| logs.get(topic_partition.1 as usize))
            .map(|log| log.len() as i64)
    }

    fn choose_partition(&mut self, message: &Message, count: i32) -> i32 {
        match &message.key {
            Some(key) => (murmur2(key) & 0x7fff_ffff) % count,
            None => {
                let counter = self.round_robin.entry(message.topic.clone()).or_default();
                let partition = (*counter % count as u32) as i32;
                *counter = counter.wrapping_add(1);
                partition
            }
        }
    }
}

#[derive(Debug)]
struct Shared {
    state: Mutex<ClusterState>,
    appended: Notify,
}

/// Cluster state shared by every [`MemoryConnection`] made from it.
#[derive(Clone, Debug)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::from_state(ClusterState {
            advertised: vec![BrokerAddress {
                host: DEFAULT_ADVERTISED_ADDR.to_owned(),
                port: DEFAULT_ADVERTISED_PORT,
            }],
            default_partitions: DEFAULT_PARTITIONS,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            auto_create_topics: true,
            topics: HashMap::new(),
            groups: HashMap::new(),
            round_robin: HashMap::new(),
            send_faults: VecDeque::new(),
            poll_faults: VecDeque::new(),
            commit_faults: VecDeque::new(),
        })
    }

    fn from_state(state: ClusterState) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                appended: Notify::new(),
            }),
        }
    }

    fn reconfigure(self, change: impl FnOnce(&mut ClusterState)) -> Self {
        match Arc::try_unwrap(self.shared) {
            Ok(shared) => {
                let mut state = shared.state.into_inner();
                change(&mut state);
                Self::from_state(state)
            }
            Err(shared) => {
                tracing::warn!("Broker already shared, configuration change ignored");
                Self { shared }
            }
        }
    }

    /// Addresses a client must list in its bootstrap servers to connect.
    pub fn with_advertised(self, advertised: Vec<BrokerAddress>) -> Self {
        self.reconfigure(|state| state.advertised = advertised)
    }

    /// Partition count for auto-created topics.
    pub fn with_default_partitions(self, partitions: i32) -> Self {
        self.reconfigure(|state| state.default_partitions = partitions.max(1))
    }

    pub fn with_max_message_bytes(self, max_message_bytes: usize) -> Self {
        self.reconfigure(|state| state.max_message_bytes = max_message_bytes)
    }

    pub fn with_auto_create_topics(self, auto_create_topics: bool) -> Self {
        self.reconfigure(|state| state.auto_create_topics = auto_create_topics)
    }

    /// Open a client handle, checking the bootstrap list against the
    /// advertised addresses.
    pub async fn connect(&self, config: &ClientConfig) -> Result<MemoryConnection> {
        let state = self.shared.state.lock().await;
        let reachable = config
            .bootstrap_servers
            .iter()
            .find(|addr| state.advertised.contains(addr));

        match reachable {
            Some(addr) => {
                tracing::debug!("Client {} connected to {}", config.client_id, addr);
                Ok(MemoryConnection {
                    broker: self.clone(),
                    client_id: config.client_id.clone(),
                    subscription: None,
                    closed: false,
                })
            }
            None => {
                let tried: Vec<String> = config
                    .bootstrap_servers
                    .iter()
                    .map(ToString::to_string)
                    .collect();
                Err(TransportError::new(
                    KafkaCode::BrokerNotAvailable,
                    format!("no broker reachable at {}", tried.join(",")),
                )
                .into())
            }
        }
    }

    pub async fn create_topic(&self, topic: &str, partitions: i32) {
        self.shared
            .state
            .lock()
            .await
            .create_topic(topic, partitions);
    }

    /// Make the next send fail with `error`.
    pub async fn fail_next_send(&self, error: TransportError) {
        self.shared.state.lock().await.send_faults.push_back(error);
    }

    /// Make the next poll fail with `error`.
    pub async fn fail_next_poll(&self, error: TransportError) {
        self.shared.state.lock().await.poll_faults.push_back(error);
    }

    /// Make the next commit fail with `error`.
    pub async fn fail_next_commit(&self, error: TransportError) {
        self.shared.state.lock().await.commit_faults.push_back(error);
    }

    /// Contents of a partition log.
    pub async fn records(&self, topic: &str, partition: i32) -> Vec<ConsumedRecord> {
        self.shared
            .state
            .lock()
            .await
            .topics
            .get(topic)
            .and_then(|logs| logs.get(partition as usize))
            .cloned()
            .unwrap_or_default()
    }

    /// Last offset committed by a group for a topic partition.
    pub async fn committed(&self, group_id: &str, topic_partition: &TopicPartition) -> Option<i64> {
        self.shared
            .state
            .lock()
            .await
            .groups
            .get(group_id)
            .and_then(|offsets| offsets.get(topic_partition))
            .copied()
    }
}

#[derive(Clone, Debug)]
struct Subscription {
    group_id: String,
    topics: Vec<String>,
    offset_reset: OffsetReset,
    /// Next offset to read per topic partition.
    positions: BTreeMap<TopicPartition, i64>,
    cursor: usize,
}

impl Subscription {
    /// Start positions for partitions not seen before.
    fn discover(&mut self, state: &ClusterState) {
        for topic in self.topics.iter() {
            let Some(logs) = state.topics.get(topic) else {
                continue;
            };
            for (partition, log) in logs.iter().enumerate() {
                let topic_partition = (topic.to_owned(), partition as i32);
                if self.positions.contains_key(&topic_partition) {
                    continue;
                }

                let committed = state
                    .groups
                    .get(&self.group_id)
                    .and_then(|offsets| offsets.get(&topic_partition));
                let position = match (committed, self.offset_reset) {
                    (Some(offset), _) => offset + 1,
                    (None, OffsetReset::Earliest) => 0,
                    (None, OffsetReset::Latest) => log.len() as i64,
                };
                tracing::trace!("Starting {:?} at offset {}", topic_partition, position);
                self.positions.insert(topic_partition, position);
            }
        }
    }

    /// Take the next unread record, visiting partitions round-robin.
    fn next_record(&mut self, state: &ClusterState) -> Option<ConsumedRecord> {
        self.discover(state);

        let partitions: Vec<TopicPartition> = self.positions.keys().cloned().collect();
        for step in 0..partitions.len() {
            let index = (self.cursor + step) % partitions.len();
            let topic_partition = &partitions[index];
            let position = self.positions[topic_partition];

            let record = state
                .topics
                .get(&topic_partition.0)
                .and_then(|logs| logs.get(topic_partition.1 as usize))
                .and_then(|log| log.get(position as usize));

            if let Some(record) = record {
                self.positions.insert(topic_partition.clone(), position + 1);
                self.cursor = index + 1;
                return Some(record.clone());
            }
        }
        None
    }
}

/// Client handle to an [`InMemoryBroker`].
///
/// Clones share the broker but carry their own subscription and read
/// positions.
#[derive(Clone, Debug)]
pub struct MemoryConnection {
    broker: InMemoryBroker,
    client_id: String,
    subscription: Option<Subscription>,
    closed: bool,
}

impl MemoryConnection {
    pub fn broker(&self) -> &InMemoryBroker {
        &self.broker
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            let message = format!("connection of {} is closed", self.client_id);
            return Err(TransportError::fatal(message).into());
        }
        Ok(())
    }

    fn subscription_mut(&mut self) -> Result<&mut Subscription> {
        self.subscription
            .as_mut()
            .ok_or_else(|| Error::IllegalState("transport has no subscription".to_owned()))
    }
}

#[async_trait]
impl BrokerTransport for MemoryConnection {
    #[instrument(level = "trace", skip(self, message), fields(topic = %message.topic))]
    async fn send(&mut self, message: &Message) -> Result<RecordMetadata> {
        self.ensure_open()?;
        let mut state = self.broker.shared.state.lock().await;

        if let Some(fault) = state.send_faults.pop_front() {
            return Err(fault.into());
        }

        if message.len() > state.max_message_bytes {
            return Err(TransportError::new(
                KafkaCode::MessageSizeTooLarge,
                format!(
                    "message of {} bytes exceeds {}",
                    message.len(),
                    state.max_message_bytes
                ),
            )
            .into());
        }

        if !state.topics.contains_key(&message.topic) {
            if !state.auto_create_topics {
                return Err(TransportError::new(
                    KafkaCode::UnknownTopicOrPartition,
                    format!("unknown topic {}", message.topic),
                )
                .into());
            }
            let partitions = state.default_partitions;
            state.create_topic(&message.topic, partitions);
        }

        let count = state.topics[&message.topic].len() as i32;
        let partition = match message.partition {
            Some(partition) if (0..count).contains(&partition) => partition,
            Some(partition) => {
                return Err(TransportError::new(
                    KafkaCode::UnknownTopicOrPartition,
                    format!("topic {} has no partition {}", message.topic, partition),
                )
                .into());
            }
            None => state.choose_partition(message, count),
        };

        let log = state
            .topics
            .get_mut(&message.topic)
            .and_then(|logs| logs.get_mut(partition as usize))
            .ok_or_else(|| TransportError::fatal("partition log vanished"))?;
        let offset = log.len() as i64;
        log.push(ConsumedRecord {
            topic: message.topic.clone(),
            partition,
            offset,
            key: message.key.clone(),
            payload: message.payload.clone(),
            timestamp: message.timestamp.unwrap_or_else(now),
        });
        drop(state);

        self.broker.shared.appended.notify_waiters();
        Ok(RecordMetadata { partition, offset })
    }

    #[instrument(level = "trace", skip(self))]
    async fn poll(&mut self, timeout_ms: u64) -> Result<Option<ConsumedRecord>> {
        self.ensure_open()?;
        let deadline = deadline(timeout_ms);
        let shared = self.broker.shared.clone();

        loop {
            let appended = shared.appended.notified();
            tokio::pin!(appended);
            appended.as_mut().enable();

            {
                let mut state = shared.state.lock().await;
                if let Some(fault) = state.poll_faults.pop_front() {
                    return Err(fault.into());
                }
                let subscription = self.subscription_mut()?;
                if let Some(record) = subscription.next_record(&state) {
                    return Ok(Some(record));
                }
            }

            if tokio::time::timeout_at(deadline, appended).await.is_err() {
                return Ok(None);
            }
        }
    }

    #[instrument(level = "debug", skip(self))]
    async fn commit(&mut self, offsets: &[(TopicPartition, i64)]) -> Result<()> {
        self.ensure_open()?;
        let group_id = self.subscription_mut()?.group_id.clone();
        let mut state = self.broker.shared.state.lock().await;

        if let Some(fault) = state.commit_faults.pop_front() {
            return Err(fault.into());
        }

        for (topic_partition, offset) in offsets {
            match state.log_end(topic_partition) {
                Some(end) if *offset < end => {}
                Some(_) => {
                    return Err(TransportError::new(
                        KafkaCode::OffsetOutOfRange,
                        format!("offset {} is past the end of {:?}", offset, topic_partition),
                    )
                    .into());
                }
                None => {
                    return Err(TransportError::new(
                        KafkaCode::UnknownTopicOrPartition,
                        format!("cannot commit unknown {:?}", topic_partition),
                    )
                    .into());
                }
            }
        }

        let committed = state.groups.entry(group_id.clone()).or_default();
        for (topic_partition, offset) in offsets {
            committed.insert(topic_partition.clone(), *offset);
        }
        tracing::debug!("Group {} committed {:?}", group_id, offsets);
        Ok(())
    }

    async fn subscribe(
        &mut self,
        group_id: &str,
        topics: &[String],
        offset_reset: OffsetReset,
    ) -> Result<()> {
        self.ensure_open()?;
        let state = self.broker.shared.state.lock().await;

        let mut subscription = Subscription {
            group_id: group_id.to_owned(),
            topics: topics.to_vec(),
            offset_reset,
            positions: BTreeMap::new(),
            cursor: 0,
        };
        subscription.discover(&state);
        tracing::debug!(
            "Client {} in group {} subscribed to {:?}",
            self.client_id,
            group_id,
            topics
        );
        self.subscription = Some(subscription);
        Ok(())
    }

    async fn partitions(&mut self, topic: &str) -> Result<i32> {
        self.ensure_open()?;
        let mut state = self.broker.shared.state.lock().await;

        if !state.topics.contains_key(topic) {
            if !state.auto_create_topics {
                return Err(TransportError::new(
                    KafkaCode::UnknownTopicOrPartition,
                    format!("unknown topic {}", topic),
                )
                .into());
            }
            let partitions = state.default_partitions;
            state.create_topic(topic, partitions);
        }
        Ok(state.topics[topic].len() as i32)
    }

    async fn close(&mut self) -> Result<()> {
        if !self.closed {
            tracing::debug!("Closing connection of {}", self.client_id);
        }
        self.closed = true;
        self.subscription = None;
        Ok(())
    }
}
