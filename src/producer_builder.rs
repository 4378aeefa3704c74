use std::collections::HashMap;

use crate::buffer::RetryPolicy;
use crate::config::ProducerConfig;
use crate::error::Result;
use crate::network::BrokerTransport;
use crate::partitioner::TopicMetadata;
use crate::producer::Producer;

/// Configure a [`Producer`].
///
/// ### Example
/// ```rust,ignore
/// let broker = samsa_delivery::prelude::InMemoryBroker::new();
/// let config = samsa_delivery::prelude::ClientConfig::new(vec!["127.0.0.1:9092".parse()?]);
/// let conn = broker.connect(&config).await?;
/// let topic_name = "my-topic";
///
/// let mut producer = samsa_delivery::prelude::ProducerBuilder::new(conn, vec![topic_name.to_string()])
///     .await?
///     .max_batch_size(2)
///     .max_attempts(5)
///     .clone()
///     .build()?;
///
/// producer.send(topic_name, None, "Value", |report| println!("{:?}", report))?;
/// producer.flush(1000).await?;
/// ```
#[derive(Clone)]
pub struct ProducerBuilder<T: BrokerTransport> {
    transport: T,
    metadata: TopicMetadata,
    config: ProducerConfig,
}

impl<T: BrokerTransport> ProducerBuilder<T> {
    /// Start a producer builder. To complete, use the [`build`](Self::build) method.
    ///
    /// Partition counts of `topics` are fetched up front so keyed messages
    /// can be hashed to a partition. Messages for other topics are sent
    /// without one and the broker chooses.
    pub async fn new(mut transport: T, topics: Vec<String>) -> Result<Self> {
        let mut metadata = HashMap::with_capacity(topics.len());
        for topic in topics {
            let partitions = transport.partitions(&topic).await?;
            tracing::debug!("Topic {} has {} partitions", topic, partitions);
            metadata.insert(topic, partitions);
        }

        Ok(Self {
            transport,
            metadata,
            config: ProducerConfig::default(),
        })
    }

    /// Replace every setting at once.
    pub fn config(&mut self, config: ProducerConfig) -> &mut Self {
        self.config = config;
        self
    }

    /// How many records may wait for delivery before
    /// [`send`](Producer::send) fails with `BufferFull`.
    pub fn buffer_capacity(&mut self, buffer_capacity: usize) -> &mut Self {
        self.config.buffer_capacity = buffer_capacity;
        self
    }

    /// The max number of records handed to the transport in one dispatch.
    ///
    /// Increasing this number lets more partitions make progress at once.
    pub fn max_batch_size(&mut self, max_batch_size: usize) -> &mut Self {
        self.config.max_batch_size = max_batch_size;
        self
    }

    /// Attempts per record before a retriable failure becomes final.
    pub fn max_attempts(&mut self, max_attempts: u32) -> &mut Self {
        self.config.retry.max_attempts = max_attempts;
        self
    }

    pub fn retry_backoff_ms(&mut self, retry_backoff_ms: u64) -> &mut Self {
        self.config.retry.retry_backoff_ms = retry_backoff_ms;
        self
    }

    pub fn retry_backoff_max_ms(&mut self, retry_backoff_max_ms: u64) -> &mut Self {
        self.config.retry.retry_backoff_max_ms = retry_backoff_max_ms;
        self
    }

    pub fn retry(&mut self, retry: RetryPolicy) -> &mut Self {
        self.config.retry = retry;
        self
    }

    pub fn build(self) -> Result<Producer<T>> {
        self.config.validate()?;
        Ok(Producer::new(self.transport, self.config, self.metadata))
    }
}
