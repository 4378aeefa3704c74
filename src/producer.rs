//! Client that sends records to a cluster.

use std::collections::HashMap;

use bytes::Bytes;
use futures::{future::BoxFuture, stream::FuturesUnordered, FutureExt, StreamExt};
use tokio::time::Instant;
use tracing::instrument;

use crate::{
    buffer::{DeliveryBuffer, Lane, OutboundRecord, RecordId},
    config::ProducerConfig,
    error::{Error, Result},
    message::{DeliveryResult, Message, RecordMetadata},
    network::BrokerTransport,
    partitioner::{Partitioner, TopicMetadata},
    utils::deadline,
};

/// Result of sending one lane's share of a drained batch.
struct LaneOutcome {
    /// Records in send order. Only the last one can be an error.
    results: Vec<(RecordId, Result<RecordMetadata>)>,
    /// Records behind a failure, never handed to the transport.
    skipped: Vec<RecordId>,
}

/// Kafka/Redpanda Producer.
///
/// Messages given to [`send`](Self::send) are buffered and never wait on the
/// broker. Transport sends make progress while the caller is inside
/// [`poll`](Self::poll), [`flush`](Self::flush) or [`close`](Self::close),
/// and every message's delivery callback fires from one of those calls,
/// exactly once, with either a [`DeliveryReport`](crate::prelude::DeliveryReport)
/// or a terminal [`DeliveryFailure`](crate::prelude::DeliveryFailure).
///
/// Retriable transport errors are retried with exponential backoff, keeping
/// the order of messages within a partition. Anything else fails the message
/// right away.
///
/// To build one start with a [`ProducerBuilder`](crate::prelude::ProducerBuilder).
///
/// ### Example
/// ```rust,ignore
/// let mut producer = ProducerBuilder::new(conn, vec!["mytopic".to_string()])
///     .await?
///     .build()?;
///
/// for i in 0..10 {
///     // serve delivery reports of earlier sends
///     producer.poll(0).await?;
///     producer.send("mytopic", None, format!("message {}", i), |report| {
///         match report {
///             Ok(report) => println!("Delivered to {} [{}]", report.message.topic, report.partition),
///             Err(failure) => println!("Delivery failed: {}", failure.error),
///         }
///     })?;
/// }
///
/// producer.flush(10_000).await?;
/// ```
pub struct Producer<T: BrokerTransport> {
    transport: T,
    buffer: DeliveryBuffer,
    partitioner: Partitioner,
    max_batch_size: usize,
    in_flight: FuturesUnordered<BoxFuture<'static, LaneOutcome>>,
    closed: bool,
}

impl<T: BrokerTransport> Producer<T> {
    pub(crate) fn new(transport: T, config: ProducerConfig, metadata: TopicMetadata) -> Self {
        Self {
            transport,
            buffer: DeliveryBuffer::new(config.buffer_capacity, config.retry),
            partitioner: Partitioner::new(metadata),
            max_batch_size: config.max_batch_size,
            in_flight: FuturesUnordered::new(),
            closed: false,
        }
    }

    /// Queue a message for delivery.
    ///
    /// Fails with [`Error::BufferFull`] when the delivery buffer is at
    /// capacity, in which case `callback` is dropped without being called.
    pub fn send<F>(
        &mut self,
        topic: &str,
        key: Option<Bytes>,
        payload: impl Into<Bytes>,
        callback: F,
    ) -> Result<RecordId>
    where
        F: FnOnce(DeliveryResult) + Send + 'static,
    {
        self.produce(Message::new(topic, key, payload), callback)
    }

    /// Queue a prebuilt message for delivery.
    pub fn produce<F>(&mut self, mut message: Message, callback: F) -> Result<RecordId>
    where
        F: FnOnce(DeliveryResult) + Send + 'static,
    {
        self.ensure_open()?;
        if message.partition.is_none() {
            message.partition = self
                .partitioner
                .partition(&message.topic, message.key.as_deref());
        }
        // without a partition count a keyless message may land on any
        // partition, so the whole topic shares one lane
        let lane = if self.partitioner.metadata().contains_key(&message.topic) {
            (message.topic.clone(), message.partition)
        } else {
            (message.topic.clone(), None)
        };
        self.buffer.enqueue_in_lane(lane, message, Box::new(callback))
    }

    /// Drive deliveries and fire callbacks that became ready.
    ///
    /// Returns as soon as at least one callback fired, or when `timeout_ms`
    /// has passed. A zero timeout only serves what is already done.
    pub async fn poll(&mut self, timeout_ms: u64) -> Result<usize> {
        self.ensure_open()?;
        let deadline = deadline(timeout_ms);
        let mut fired = 0;

        loop {
            self.dispatch();

            if self.in_flight.is_empty() {
                match self.buffer.next_retry_at() {
                    Some(at) if at < deadline => {
                        tokio::time::sleep_until(at).await;
                        continue;
                    }
                    _ => return Ok(fired),
                }
            }

            match tokio::time::timeout_at(deadline, self.in_flight.next()).await {
                Ok(Some(outcome)) => {
                    fired += self.complete(outcome)?;
                    fired += self.complete_ready()?;
                    if fired > 0 {
                        return Ok(fired);
                    }
                }
                Ok(None) => {}
                Err(_) => return Ok(fired),
            }
        }
    }

    /// Wait until every buffered message got its callback.
    ///
    /// Fails with [`Error::FlushTimeout`] if anything is still outstanding
    /// after `timeout_ms`. Those records stay buffered and a later flush
    /// picks them up again.
    pub async fn flush(&mut self, timeout_ms: u64) -> Result<()> {
        self.ensure_open()?;
        self.flush_until(deadline(timeout_ms)).await
    }

    /// Flush, then drop whatever is left and release the transport.
    ///
    /// Dropped messages get a terminal [`Error::Closed`] callback and are
    /// returned in [`Error::UndeliveredOnClose`]. A send that was in flight
    /// when the deadline passed may still have reached the broker.
    pub async fn close(&mut self, timeout_ms: u64) -> Result<()> {
        self.ensure_open()?;
        tracing::debug!("Closing producer with {} records buffered", self.buffer.len());

        let flushed = self.flush_until(deadline(timeout_ms)).await;
        self.closed = true;
        self.in_flight.clear();
        let undelivered = self.buffer.abandon();

        if let Err(err) = self.transport.close().await {
            tracing::warn!("Error closing producer transport {:?}", err);
        }

        if !undelivered.is_empty() {
            return Err(Error::UndeliveredOnClose(undelivered));
        }
        match flushed {
            Err(Error::FlushTimeout { .. }) => Ok(()),
            other => other,
        }
    }

    /// Messages not yet settled, pending or awaiting acknowledgment.
    pub fn in_flight(&self) -> usize {
        self.buffer.len()
    }

    pub fn buffer(&self) -> &DeliveryBuffer {
        &self.buffer
    }

    pub fn metadata(&self) -> &TopicMetadata {
        self.partitioner.metadata()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    async fn flush_until(&mut self, deadline: Instant) -> Result<()> {
        loop {
            self.dispatch();
            if self.buffer.is_empty() {
                return Ok(());
            }

            if self.in_flight.is_empty() {
                match self.buffer.next_retry_at() {
                    Some(at) if at < deadline => tokio::time::sleep_until(at).await,
                    _ => {
                        tokio::time::sleep_until(deadline).await;
                        return Err(self.flush_timeout());
                    }
                }
                continue;
            }

            match tokio::time::timeout_at(deadline, self.in_flight.next()).await {
                Ok(Some(outcome)) => {
                    self.complete(outcome)?;
                }
                Ok(None) => {}
                Err(_) => return Err(self.flush_timeout()),
            }
        }
    }

    fn flush_timeout(&self) -> Error {
        let pending = self.buffer.len();
        tracing::warn!("Flush timed out with {} records outstanding", pending);
        Error::FlushTimeout { pending }
    }

    /// Hand drained records to the transport, one future per lane.
    fn dispatch(&mut self) {
        let mut lanes: HashMap<Lane, Vec<OutboundRecord>> = HashMap::new();
        for record in self.buffer.drain(self.max_batch_size) {
            lanes.entry(record.lane.clone()).or_default().push(record);
        }

        for (_, records) in lanes {
            let transport = self.transport.clone();
            self.in_flight.push(send_lane(transport, records).boxed());
        }
    }

    /// Settle a lane's results, returning how many callbacks fired.
    fn complete(&mut self, outcome: LaneOutcome) -> Result<usize> {
        let mut fired = 0;
        let mut failure = None;

        for (id, result) in outcome.results {
            match result {
                Ok(metadata) => {
                    self.buffer.acknowledge(id, metadata)?;
                    fired += 1;
                }
                Err(err) => failure = Some((id, err)),
            }
        }

        // untried records go back first so a retried failure lands ahead of them
        for id in outcome.skipped.into_iter().rev() {
            self.buffer.release(id)?;
        }
        if let Some((id, err)) = failure {
            if !self.buffer.fail(id, err)? {
                fired += 1;
            }
        }

        Ok(fired)
    }

    fn complete_ready(&mut self) -> Result<usize> {
        let mut fired = 0;
        while let Some(Some(outcome)) = self.in_flight.next().now_or_never() {
            fired += self.complete(outcome)?;
        }
        Ok(fired)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::Closed);
        }
        Ok(())
    }
}

impl<T: BrokerTransport> Drop for Producer<T> {
    fn drop(&mut self) {
        if !self.buffer.is_empty() {
            tracing::warn!(
                "Producer dropped with {} records undelivered",
                self.buffer.len()
            );
            self.buffer.abandon();
        }
    }
}

/// Send one lane's records in order, stopping at the first failure.
#[instrument(level = "debug", skip_all, fields(records = records.len()))]
async fn send_lane<T: BrokerTransport>(
    mut transport: T,
    records: Vec<OutboundRecord>,
) -> LaneOutcome {
    let mut results = Vec::with_capacity(records.len());
    let mut records = records.into_iter();

    for record in records.by_ref() {
        let result = transport.send(&record.message).await;
        let failed = result.is_err();
        results.push((record.id, result));
        if failed {
            break;
        }
    }

    LaneOutcome {
        results,
        skipped: records.map(|record| record.id).collect(),
    }
}

#[cfg(test)]
mod test {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::config::ClientConfig;
    use crate::error::{KafkaCode, TransportError};
    use crate::network::memory::{InMemoryBroker, MemoryConnection};

    async fn producer(broker: &InMemoryBroker, config: ProducerConfig) -> Producer<MemoryConnection> {
        let client = ClientConfig::new(vec!["127.0.0.1:9092".parse().unwrap()]);
        let conn = broker.connect(&client).await.unwrap();
        Producer::new(conn, config, TopicMetadata::new())
    }

    #[tokio::test]
    async fn poll_fires_ready_callbacks() {
        let broker = InMemoryBroker::new();
        let mut producer = producer(&broker, ProducerConfig::default()).await;
        let reports = Arc::new(Mutex::new(vec![]));

        for i in 0..3 {
            let reports = reports.clone();
            producer
                .send("t", None, format!("m{}", i), move |r| {
                    reports.lock().unwrap().push(r)
                })
                .unwrap();
        }
        assert_eq!(producer.in_flight(), 3);

        let fired = producer.poll(1000).await.unwrap();
        assert_eq!(fired, 3);
        assert_eq!(producer.in_flight(), 0);

        let offsets: Vec<_> = reports
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.as_ref().unwrap().offset)
            .collect();
        assert_eq!(offsets, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn poll_with_nothing_to_do_returns_zero() {
        let broker = InMemoryBroker::new();
        let mut producer = producer(&broker, ProducerConfig::default()).await;
        assert_eq!(producer.poll(0).await.unwrap(), 0);
        assert_eq!(producer.poll(50).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn failure_mid_lane_keeps_order() {
        let broker = InMemoryBroker::new();
        let mut config = ProducerConfig::default();
        config.retry.retry_backoff_ms = 1;
        let mut producer = producer(&broker, config).await;
        let order = Arc::new(Mutex::new(vec![]));

        // the first send fails and the rest must wait behind its retry
        broker
            .fail_next_send(TransportError::new(KafkaCode::NotLeaderForPartition, "moved"))
            .await;
        for i in 0..4 {
            let order = order.clone();
            producer
                .produce(
                    Message::new("t", None, format!("m{}", i)).with_partition(0),
                    move |r| {
                        let report = r.unwrap();
                        order.lock().unwrap().push((i, report.offset, report.attempt))
                    },
                )
                .unwrap();
        }
        producer.flush(5_000).await.unwrap();

        let order = order.lock().unwrap();
        assert_eq!(*order, vec![(0, 0, 2), (1, 1, 1), (2, 2, 1), (3, 3, 1)]);
    }

    #[tokio::test]
    async fn unknown_topics_order_by_topic() {
        let broker = InMemoryBroker::new();
        let mut producer = producer(&broker, ProducerConfig::default()).await;
        producer.send("t", None, "a", |_| {}).unwrap();
        producer
            .produce(Message::new("t", None, "b").with_partition(3), |_| {})
            .unwrap();

        let lanes: Vec<_> = producer.buffer.drain(10).map(|r| r.lane).collect();
        assert_eq!(lanes, vec![("t".to_owned(), None), ("t".to_owned(), None)]);
    }

    #[tokio::test]
    async fn closed_producer_refuses_work() {
        let broker = InMemoryBroker::new();
        let mut producer = producer(&broker, ProducerConfig::default()).await;
        producer.close(100).await.unwrap();
        assert!(producer.is_closed());
        assert_eq!(producer.send("t", None, "x", |_| {}), Err(Error::Closed));
        assert_eq!(producer.poll(0).await, Err(Error::Closed));
        assert_eq!(producer.close(0).await, Err(Error::Closed));
    }

    #[tokio::test]
    async fn dropping_the_producer_fails_outstanding_callbacks() {
        let broker = InMemoryBroker::new();
        let mut producer = producer(&broker, ProducerConfig::default()).await;
        let outcome = Arc::new(Mutex::new(None));
        let slot = outcome.clone();
        producer
            .send("t", None, "x", move |r| *slot.lock().unwrap() = Some(r))
            .unwrap();
        drop(producer);

        let outcome = outcome.lock().unwrap().take().unwrap();
        assert_eq!(outcome.unwrap_err().error, Error::Closed);
    }
}
