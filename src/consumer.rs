//! Client that consumes records from a cluster.

use std::collections::BTreeMap;
use std::time::Duration;

use futures::FutureExt;
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tokio_stream::Stream;
use tracing::instrument;

use crate::{
    config::ConsumerConfig,
    error::{Error, Result, TransportError},
    message::{ConsumedRecord, TopicPartition},
    network::BrokerTransport,
    offsets::{OffsetTracker, PartitionOffsets},
    utils::deadline,
};

/// Lifecycle of a [`Consumer`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConsumerState {
    Unsubscribed,
    Subscribed,
    Polling,
    Closed,
}

/// What a call to [`Consumer::poll`] produced.
#[derive(Clone, Debug, PartialEq)]
pub enum ConsumerEvent {
    Record(ConsumedRecord),
    /// The transport failed this poll. The consumer stays usable.
    Error(TransportError),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CommitMode {
    /// Wait for the broker to confirm.
    #[default]
    Sync,
    /// Commit in the background. A failure is reported by the next `commit`.
    Async,
}

struct CommitOutcome {
    offsets: Vec<(TopicPartition, i64)>,
    result: Result<()>,
}

/// Kafka/Redpanda Consumer with at-least-once offset management.
///
/// Records come out one at a time from [`poll`](Self::poll). The consumer
/// tracks, per topic partition, the highest offset delivered to the caller,
/// the highest one the caller finished processing and the highest one the
/// broker confirmed as committed. Only processed offsets are ever committed,
/// so after a crash a new consumer of the same group restarts no later than
/// the first record that was not processed.
///
/// With auto-commit enabled a record counts as processed once the caller
/// comes back for the next one, and commits go out in the background every
/// `auto_commit_interval_ms`. Otherwise call
/// [`mark_processed`](Self::mark_processed) and [`commit`](Self::commit).
///
/// To build one start with a [`ConsumerBuilder`](crate::prelude::ConsumerBuilder).
///
/// ### Example
/// ```rust,ignore
/// let mut consumer = ConsumerBuilder::new(conn, "my-group")
///     .offset_reset(OffsetReset::Earliest)
///     .enable_auto_commit(false)
///     .clone()
///     .build()
///     .await?;
/// consumer.subscribe(["my-topic"]).await?;
///
/// while let Some(event) = consumer.poll(1000).await? {
///     if let ConsumerEvent::Record(record) = event {
///         println!("{:?}", record);
///         consumer.mark_processed(&record)?;
///     }
/// }
/// consumer.commit(CommitMode::Sync).await?;
/// consumer.close(5000).await?;
/// ```
pub struct Consumer<T: BrokerTransport> {
    transport: T,
    config: ConsumerConfig,
    state: ConsumerState,
    subscription: Vec<String>,
    offsets: OffsetTracker,
    /// Last record handed out, processed once the next poll starts under auto-commit.
    last_polled: Option<(TopicPartition, i64)>,
    last_auto_commit: Instant,
    pending_commits: JoinSet<CommitOutcome>,
    commit_error: Option<Error>,
}

impl<T: BrokerTransport> Consumer<T> {
    pub(crate) fn new(transport: T, config: ConsumerConfig) -> Self {
        Self {
            transport,
            config,
            state: ConsumerState::Unsubscribed,
            subscription: vec![],
            offsets: OffsetTracker::new(),
            last_polled: None,
            last_auto_commit: Instant::now(),
            pending_commits: JoinSet::new(),
            commit_error: None,
        }
    }

    /// Replace the subscription with `topics`.
    ///
    /// Offsets of partitions that belong to dropped topics are forgotten.
    #[instrument(skip_all, fields(group_id = %self.config.group_id))]
    pub async fn subscribe<I, S>(&mut self, topics: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if self.state == ConsumerState::Closed {
            return Err(Error::Closed);
        }
        let topics: Vec<String> = topics.into_iter().map(Into::into).collect();
        if topics.is_empty() {
            return Err(Error::IllegalState(
                "Cannot subscribe to an empty topic list".to_owned(),
            ));
        }

        self.transport
            .subscribe(&self.config.group_id, &topics, self.config.offset_reset)
            .await?;

        self.offsets.retain_topics(&topics);
        if let Some(((topic, _), _)) = &self.last_polled {
            if !topics.contains(topic) {
                self.last_polled = None;
            }
        }
        tracing::info!("Subscribed to {:?}", topics);
        self.subscription = topics;
        self.state = ConsumerState::Subscribed;
        self.last_auto_commit = Instant::now();
        Ok(())
    }

    /// Fetch the next record, waiting at most `timeout_ms`.
    ///
    /// `Ok(None)` means nothing arrived in time. Transport failures come back
    /// as [`ConsumerEvent::Error`] and the caller may keep polling.
    pub async fn poll(&mut self, timeout_ms: u64) -> Result<Option<ConsumerEvent>> {
        match self.state {
            ConsumerState::Closed => return Err(Error::Closed),
            ConsumerState::Unsubscribed => {
                return Err(Error::IllegalState(
                    "Cannot poll before subscribing".to_owned(),
                ))
            }
            ConsumerState::Subscribed | ConsumerState::Polling => {}
        }

        self.reap_commits();
        if self.config.enable_auto_commit {
            self.process_last_polled();
            self.maybe_auto_commit();
        }
        self.state = ConsumerState::Polling;

        match self.transport.poll(timeout_ms).await {
            Ok(Some(record)) => {
                let topic_partition = record.topic_partition();
                if let Err(err) = self.offsets.advance(&topic_partition, record.offset) {
                    // redelivery is allowed, the position just does not move back
                    tracing::warn!("{}", err);
                }
                self.last_polled = Some((topic_partition, record.offset));
                Ok(Some(ConsumerEvent::Record(record)))
            }
            Ok(None) => Ok(None),
            Err(Error::Transport(err)) => {
                tracing::warn!("Poll failed: {}", err);
                Ok(Some(ConsumerEvent::Error(err)))
            }
            Err(err) => Err(err),
        }
    }

    /// Mark `record` and everything before it in its partition as processed.
    pub fn mark_processed(&mut self, record: &ConsumedRecord) -> Result<()> {
        self.store_offset(&record.topic_partition(), record.offset)
    }

    /// Mark an offset as processed without holding on to the record.
    pub fn store_offset(&mut self, topic_partition: &TopicPartition, offset: i64) -> Result<()> {
        if self.state == ConsumerState::Closed {
            return Err(Error::Closed);
        }
        self.offsets.mark_processed(topic_partition, offset)
    }

    /// Commit every processed offset not committed yet.
    ///
    /// A failed background commit from earlier is returned here unless a
    /// synchronous commit supersedes it.
    #[instrument(skip(self), fields(group_id = %self.config.group_id))]
    pub async fn commit(&mut self, mode: CommitMode) -> Result<()> {
        if self.state == ConsumerState::Closed {
            return Err(Error::Closed);
        }
        self.reap_commits();

        match mode {
            CommitMode::Sync => {
                self.commit_now().await?;
                if let Some(err) = self.commit_error.take() {
                    tracing::debug!("Earlier commit failure superseded: {}", err);
                }
                Ok(())
            }
            CommitMode::Async => {
                self.spawn_commit();
                match self.commit_error.take() {
                    Some(err) => Err(err),
                    None => Ok(()),
                }
            }
        }
    }

    /// Stop consuming.
    ///
    /// Waits up to `drain_timeout_ms` for background commits and a final
    /// commit of all processed offsets. The transport is released either way.
    #[instrument(skip(self), fields(group_id = %self.config.group_id))]
    pub async fn close(&mut self, drain_timeout_ms: u64) -> Result<()> {
        if self.state == ConsumerState::Closed {
            return Err(Error::Closed);
        }
        let subscribed = self.state != ConsumerState::Unsubscribed;
        self.state = ConsumerState::Closed;
        if self.config.enable_auto_commit {
            self.process_last_polled();
        }

        let result = if subscribed {
            match tokio::time::timeout_at(deadline(drain_timeout_ms), self.drain_commits()).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::warn!("Close timed out after {}ms", drain_timeout_ms);
                    Err(Error::CloseTimeout)
                }
            }
        } else {
            Ok(())
        };
        self.pending_commits.abort_all();

        if let Err(err) = self.transport.close().await {
            tracing::warn!("Error closing consumer transport {:?}", err);
        }
        tracing::info!("Consumer of group {} closed", self.config.group_id);
        result
    }

    /// Turn the consumer into a stream of events.
    ///
    /// Empty polls are skipped. The stream ends after the first error that
    /// is not a transport failure.
    ///
    /// *Note:* The stream is lazy, so without anything to execute it, it will do nothing.
    pub fn into_stream(mut self, timeout_ms: u64) -> impl Stream<Item = Result<ConsumerEvent>> {
        async_stream::stream! {
            loop {
                match self.poll(timeout_ms).await {
                    Ok(Some(event)) => yield Ok(event),
                    Ok(None) => continue,
                    Err(err) => {
                        yield Err(err);
                        break;
                    }
                }
            }
        }
    }

    pub fn state(&self) -> ConsumerState {
        self.state
    }

    pub fn subscription(&self) -> &[String] {
        &self.subscription
    }

    /// Copy of the tracked offsets.
    pub fn offsets(&self) -> BTreeMap<TopicPartition, PartitionOffsets> {
        self.offsets.snapshot()
    }

    /// Background commits not reaped yet.
    pub fn pending_commits(&self) -> usize {
        self.pending_commits.len()
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    fn process_last_polled(&mut self) {
        if let Some((topic_partition, offset)) = self.last_polled.take() {
            if let Err(err) = self.offsets.mark_processed(&topic_partition, offset) {
                tracing::debug!("Skipping auto-commit of {:?}: {}", topic_partition, err);
            }
        }
    }

    fn maybe_auto_commit(&mut self) {
        let interval = Duration::from_millis(self.config.auto_commit_interval_ms);
        if self.last_auto_commit.elapsed() >= interval {
            self.spawn_commit();
            self.last_auto_commit = Instant::now();
        }
    }

    fn spawn_commit(&mut self) {
        let offsets = self.offsets.commit_snapshot();
        if offsets.is_empty() {
            return;
        }

        let mut transport = self.transport.clone();
        let retries = self.config.commit_retries;
        let backoff_ms = self.config.commit_retry_backoff_ms;
        tracing::debug!("Committing {} offsets in the background", offsets.len());
        self.pending_commits.spawn(async move {
            let result = commit_with_retry(&mut transport, &offsets, retries, backoff_ms).await;
            CommitOutcome { offsets, result }
        });
    }

    async fn commit_now(&mut self) -> Result<()> {
        let offsets = self.offsets.commit_snapshot();
        if offsets.is_empty() {
            return Ok(());
        }

        commit_with_retry(
            &mut self.transport,
            &offsets,
            self.config.commit_retries,
            self.config.commit_retry_backoff_ms,
        )
        .await?;
        for (topic_partition, offset) in offsets.iter() {
            self.offsets.confirm_commit(topic_partition, *offset)?;
        }
        Ok(())
    }

    async fn drain_commits(&mut self) -> Result<()> {
        while let Some(joined) = self.pending_commits.join_next().await {
            self.settle(joined);
        }
        self.commit_now().await
    }

    /// Settle background commits that already finished.
    fn reap_commits(&mut self) {
        while let Some(Some(joined)) = self.pending_commits.join_next().now_or_never() {
            self.settle(joined);
        }
    }

    fn settle(&mut self, joined: std::result::Result<CommitOutcome, JoinError>) {
        let outcome = match joined {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::error!("Commit task did not finish: {}", err);
                return;
            }
        };

        match outcome.result {
            Ok(()) => {
                for (topic_partition, offset) in outcome.offsets.iter() {
                    if let Err(err) = self.offsets.confirm_commit(topic_partition, *offset) {
                        tracing::debug!("Ignoring commit confirmation: {}", err);
                    }
                }
            }
            Err(err) => {
                tracing::error!("Background commit of {:?} failed: {}", outcome.offsets, err);
                self.commit_error.get_or_insert(err);
            }
        }
    }
}

impl<T: BrokerTransport> Drop for Consumer<T> {
    fn drop(&mut self) {
        if self.state == ConsumerState::Closed {
            return;
        }
        if self.config.enable_auto_commit {
            self.process_last_polled();
        }
        tracing::warn!(
            "Consumer of group {} dropped without close, {} background commits aborted, {} partitions left uncommitted",
            self.config.group_id,
            self.pending_commits.len(),
            self.offsets.commit_snapshot().len()
        );
    }
}

/// Commit `offsets`, retrying retriable failures with growing backoff.
async fn commit_with_retry<T: BrokerTransport>(
    transport: &mut T,
    offsets: &[(TopicPartition, i64)],
    retries: u32,
    backoff_ms: u64,
) -> Result<()> {
    let mut attempt = 0;
    loop {
        match transport.commit(offsets).await {
            Ok(()) => return Ok(()),
            Err(err) if err.is_retriable() && attempt < retries => {
                let backoff = Duration::from_millis(backoff_ms.saturating_mul(1 << attempt.min(16)));
                attempt += 1;
                tracing::warn!("Commit failed, retry {} in {:?}: {}", attempt, backoff, err);
                tokio::time::sleep(backoff).await;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::{ClientConfig, OffsetReset};
    use crate::error::KafkaCode;
    use crate::message::Message;
    use crate::network::memory::{InMemoryBroker, MemoryConnection};

    async fn setup(records: usize, auto_commit: bool) -> (InMemoryBroker, Consumer<MemoryConnection>) {
        let broker = InMemoryBroker::new();
        let client = ClientConfig::new(vec!["127.0.0.1:9092".parse().unwrap()]);
        let mut conn = broker.connect(&client).await.unwrap();
        for i in 0..records {
            conn.send(&Message::new("t", None, format!("m{}", i)))
                .await
                .unwrap();
        }

        let mut config = ConsumerConfig::new("g");
        config.offset_reset = OffsetReset::Earliest;
        config.enable_auto_commit = auto_commit;
        config.commit_retry_backoff_ms = 1;
        (broker, Consumer::new(conn, config))
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl CapturedLogs {
        fn drop_logged<C>(&self, consumer: C) -> String {
            let writer = self.clone();
            let subscriber = tracing_subscriber::fmt()
                .with_writer(move || writer.clone())
                .with_ansi(false)
                .finish();
            tracing::subscriber::with_default(subscriber, || drop(consumer));
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    fn record(event: Option<ConsumerEvent>) -> ConsumedRecord {
        match event {
            Some(ConsumerEvent::Record(record)) => record,
            other => panic!("expected a record, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn it_walks_the_lifecycle() {
        let (_broker, mut consumer) = setup(1, false).await;
        assert_eq!(consumer.state(), ConsumerState::Unsubscribed);
        assert!(matches!(consumer.poll(0).await, Err(Error::IllegalState(_))));
        assert!(matches!(
            consumer.subscribe(Vec::<String>::new()).await,
            Err(Error::IllegalState(_))
        ));

        consumer.subscribe(["t"]).await.unwrap();
        assert_eq!(consumer.state(), ConsumerState::Subscribed);
        assert_eq!(consumer.subscription(), ["t".to_owned()]);

        record(consumer.poll(100).await.unwrap());
        assert_eq!(consumer.state(), ConsumerState::Polling);

        consumer.close(1000).await.unwrap();
        assert_eq!(consumer.state(), ConsumerState::Closed);
        assert_eq!(consumer.poll(0).await, Err(Error::Closed));
        assert_eq!(consumer.commit(CommitMode::Sync).await, Err(Error::Closed));
        assert_eq!(consumer.close(0).await, Err(Error::Closed));
    }

    #[tokio::test]
    async fn poll_advances_delivered_offsets() {
        let (_broker, mut consumer) = setup(2, false).await;
        consumer.subscribe(["t"]).await.unwrap();

        let first = record(consumer.poll(100).await.unwrap());
        let offsets = consumer.offsets()[&first.topic_partition()];
        assert_eq!(offsets.delivered, 0);
        assert_eq!(offsets.processed, -1);

        record(consumer.poll(100).await.unwrap());
        assert_eq!(consumer.offsets()[&first.topic_partition()].delivered, 1);
        assert_eq!(consumer.poll(10).await.unwrap(), None);
    }

    #[tokio::test]
    async fn sync_commit_confirms_processed_offsets() {
        let (broker, mut consumer) = setup(3, false).await;
        consumer.subscribe(["t"]).await.unwrap();

        let first = record(consumer.poll(100).await.unwrap());
        record(consumer.poll(100).await.unwrap());
        consumer.mark_processed(&first).unwrap();

        broker
            .fail_next_commit(TransportError::new(KafkaCode::CoordinatorNotAvailable, "moving"))
            .await;
        consumer.commit(CommitMode::Sync).await.unwrap();

        let tp = first.topic_partition();
        assert_eq!(consumer.offsets()[&tp].committed, 0);
        assert_eq!(broker.committed("g", &tp).await, Some(0));
    }

    #[tokio::test]
    async fn transport_failures_surface_as_events() {
        let (broker, mut consumer) = setup(1, false).await;
        consumer.subscribe(["t"]).await.unwrap();

        broker.fail_next_poll(TransportError::transient("down")).await;
        match consumer.poll(100).await.unwrap() {
            Some(ConsumerEvent::Error(err)) => assert!(err.retriable),
            other => panic!("expected an error event, got {:?}", other),
        }
        record(consumer.poll(100).await.unwrap());
    }

    #[tokio::test]
    async fn auto_commit_marks_the_previous_record() {
        let (broker, mut consumer) = setup(2, true).await;
        consumer.subscribe(["t"]).await.unwrap();

        let first = record(consumer.poll(100).await.unwrap());
        assert_eq!(consumer.offsets()[&first.topic_partition()].processed, -1);

        record(consumer.poll(100).await.unwrap());
        assert_eq!(consumer.offsets()[&first.topic_partition()].processed, 0);

        // close treats the last record as processed and commits it
        consumer.close(1000).await.unwrap();
        assert_eq!(broker.committed("g", &first.topic_partition()).await, Some(1));
    }

    #[tokio::test]
    async fn dropping_an_open_consumer_warns() {
        let (_broker, mut consumer) = setup(2, false).await;
        consumer.subscribe(["t"]).await.unwrap();
        let first = record(consumer.poll(100).await.unwrap());
        consumer.mark_processed(&first).unwrap();

        let logs = CapturedLogs::default().drop_logged(consumer);
        assert!(logs.contains("dropped without close"));
        assert!(logs.contains("1 partitions left uncommitted"));

        let (_broker, mut consumer) = setup(1, false).await;
        consumer.subscribe(["t"]).await.unwrap();
        consumer.close(1_000).await.unwrap();
        let logs = CapturedLogs::default().drop_logged(consumer);
        assert!(!logs.contains("dropped without close"));
    }
}
