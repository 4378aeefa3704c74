use crate::config::{ConsumerConfig, OffsetReset};
use crate::consumer::Consumer;
use crate::error::Result;
use crate::network::BrokerTransport;

/// Configure a [`Consumer`].
#[derive(Clone)]
pub struct ConsumerBuilder<T: BrokerTransport> {
    transport: T,
    config: ConsumerConfig,
}

impl<T: BrokerTransport> ConsumerBuilder<T> {
    /// Start a consumer builder for a group. To complete, use the [`build`](Self::build) method.
    pub fn new(transport: T, group_id: impl Into<String>) -> Self {
        Self::from_config(transport, ConsumerConfig::new(group_id))
    }

    pub fn from_config(transport: T, config: ConsumerConfig) -> Self {
        Self { transport, config }
    }

    /// Topics to subscribe to as part of [`build`](Self::build).
    pub fn topics(&mut self, topics: Vec<String>) -> &mut Self {
        self.config.topics = topics;
        self
    }

    /// Where to start in partitions the group never committed to.
    pub fn offset_reset(&mut self, offset_reset: OffsetReset) -> &mut Self {
        self.config.offset_reset = offset_reset;
        self
    }

    /// Treat a record as processed once the next one is polled and commit
    /// in the background.
    pub fn enable_auto_commit(&mut self, enable_auto_commit: bool) -> &mut Self {
        self.config.enable_auto_commit = enable_auto_commit;
        self
    }

    pub fn auto_commit_interval_ms(&mut self, auto_commit_interval_ms: u64) -> &mut Self {
        self.config.auto_commit_interval_ms = auto_commit_interval_ms;
        self
    }

    /// Retries for a commit that fails with a retriable error.
    pub fn commit_retries(&mut self, commit_retries: u32) -> &mut Self {
        self.config.commit_retries = commit_retries;
        self
    }

    pub fn commit_retry_backoff_ms(&mut self, commit_retry_backoff_ms: u64) -> &mut Self {
        self.config.commit_retry_backoff_ms = commit_retry_backoff_ms;
        self
    }

    /// Validate the settings and, when topics were given, subscribe.
    pub async fn build(self) -> Result<Consumer<T>> {
        self.config.validate()?;
        let topics = self.config.topics.clone();
        let mut consumer = Consumer::new(self.transport, self.config);
        if !topics.is_empty() {
            consumer.subscribe(topics).await?;
        }
        Ok(consumer)
    }
}
