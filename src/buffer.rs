//! Bounded holding area for outbound records.
//!
//! Every message handed to a [`Producer`](crate::prelude::Producer) lives in a
//! [`DeliveryBuffer`] until its delivery callback fires. Records are queued in
//! lanes, one per topic partition, and leave the buffer exactly once: either
//! acknowledged by the broker or failed for good.
//!
//! A lane with records awaiting acknowledgment is not drained again until
//! those records are settled. Together with retries going back to the front
//! of their lane this keeps delivery order per partition.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::message::{DeliveryFailure, DeliveryReport, DeliveryResult, Message, RecordMetadata};

const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_BACKOFF_MS: u64 = 100;
const DEFAULT_RETRY_BACKOFF_MAX_MS: u64 = 1000;

pub type RecordId = u64;

/// Caller supplied handler, invoked once per message with the outcome.
pub type DeliveryCallback = Box<dyn FnOnce(DeliveryResult) + Send + 'static>;

/// Ordering lane: topic and partition, or just the topic while its
/// partitioning is unknown.
pub(crate) type Lane = (String, Option<i32>);

/// How transient delivery failures are retried.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(
    feature = "config-serde",
    derive(serde_derive::Serialize, serde_derive::Deserialize)
)]
pub struct RetryPolicy {
    /// Total attempts per record, the first one included.
    pub max_attempts: u32,
    /// Backoff before the second attempt. Doubles for each one after.
    pub retry_backoff_ms: u64,
    pub retry_backoff_max_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_backoff_ms: DEFAULT_RETRY_BACKOFF_MS,
            retry_backoff_max_ms: DEFAULT_RETRY_BACKOFF_MAX_MS,
        }
    }
}

impl RetryPolicy {
    /// Wait before making attempt number `attempt`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(2).min(31);
        let ms = self
            .retry_backoff_ms
            .saturating_mul(1_u64 << exponent)
            .min(self.retry_backoff_max_ms);
        Duration::from_millis(ms)
    }
}

/// A message in flight together with its delivery bookkeeping.
pub struct DeliveryRecord {
    pub id: RecordId,
    pub message: Message,
    pub attempt: u32,
    pub enqueued_at: Instant,
    lane: Lane,
    retry_at: Option<Instant>,
    callback: DeliveryCallback,
}

impl DeliveryRecord {
    fn lane(&self) -> Lane {
        self.lane.clone()
    }

    fn ready(&self, now: Instant) -> bool {
        self.retry_at.map_or(true, |at| at <= now)
    }

    fn succeed(self, metadata: RecordMetadata) {
        let DeliveryRecord {
            message,
            attempt,
            callback,
            ..
        } = self;
        callback(Ok(DeliveryReport {
            message,
            partition: metadata.partition,
            offset: metadata.offset,
            attempt,
        }));
    }

    fn give_up(self, error: Error) -> Message {
        let DeliveryRecord {
            message,
            attempt,
            callback,
            ..
        } = self;
        callback(Err(DeliveryFailure {
            message: message.clone(),
            attempt,
            error,
        }));
        message
    }
}

impl fmt::Debug for DeliveryRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryRecord")
            .field("id", &self.id)
            .field("topic", &self.message.topic)
            .field("partition", &self.message.partition)
            .field("attempt", &self.attempt)
            .field("enqueued_at", &self.enqueued_at)
            .field("retry_at", &self.retry_at)
            .finish()
    }
}

/// What the producer hands to the transport for one drained record.
#[derive(Clone, Debug, PartialEq)]
pub struct OutboundRecord {
    pub id: RecordId,
    pub message: Message,
    pub attempt: u32,
    pub(crate) lane: Lane,
}

#[derive(Debug)]
pub struct DeliveryBuffer {
    capacity: usize,
    retry: RetryPolicy,
    next_id: RecordId,
    lanes: HashMap<Lane, VecDeque<DeliveryRecord>>,
    /// Lanes in the order they were first seen, rotated on every drain.
    lane_order: VecDeque<Lane>,
    awaiting: HashMap<RecordId, DeliveryRecord>,
    awaiting_per_lane: HashMap<Lane, usize>,
    pending: usize,
}

impl DeliveryBuffer {
    pub fn new(capacity: usize, retry: RetryPolicy) -> Self {
        Self {
            capacity,
            retry,
            next_id: 0,
            lanes: HashMap::new(),
            lane_order: VecDeque::new(),
            awaiting: HashMap::new(),
            awaiting_per_lane: HashMap::new(),
            pending: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Records held, pending and awaiting acknowledgment alike.
    pub fn len(&self) -> usize {
        self.pending + self.awaiting.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pending_len(&self) -> usize {
        self.pending
    }

    pub fn awaiting_len(&self) -> usize {
        self.awaiting.len()
    }

    /// Queue a message at the back of the lane of its topic partition.
    pub fn enqueue(&mut self, message: Message, callback: DeliveryCallback) -> Result<RecordId> {
        let lane = (message.topic.clone(), message.partition);
        self.enqueue_in_lane(lane, message, callback)
    }

    pub(crate) fn enqueue_in_lane(
        &mut self,
        lane: Lane,
        message: Message,
        callback: DeliveryCallback,
    ) -> Result<RecordId> {
        if self.len() >= self.capacity {
            tracing::debug!(
                "Rejecting message for {}, buffer holds {} records",
                message.topic,
                self.len()
            );
            return Err(Error::BufferFull {
                capacity: self.capacity,
            });
        }

        let id = self.next_id;
        self.next_id += 1;

        let record = DeliveryRecord {
            id,
            message,
            attempt: 1,
            enqueued_at: Instant::now(),
            lane: lane.clone(),
            retry_at: None,
            callback,
        };
        tracing::trace!("Enqueued record {} on lane {:?}", id, lane);
        self.push_back(lane, record);

        Ok(id)
    }

    /// Take up to `max_batch` records for sending.
    ///
    /// The iterator is lazy: a record moves to the awaiting-ack set only when
    /// it is yielded, and whatever is not pulled stays pending for the next
    /// drain.
    pub fn drain(&mut self, max_batch: usize) -> Drain<'_> {
        let now = Instant::now();
        self.lane_order.rotate_left(usize::from(!self.lane_order.is_empty()));

        let lanes = self
            .lane_order
            .iter()
            .filter(|lane| self.awaiting_per_lane.get(*lane).copied().unwrap_or(0) == 0)
            .filter(|lane| {
                self.lanes
                    .get(*lane)
                    .and_then(VecDeque::front)
                    .is_some_and(|head| head.ready(now))
            })
            .cloned()
            .collect();

        Drain {
            buffer: self,
            lanes,
            remaining: max_batch,
            now,
        }
    }

    /// Settle a record as delivered and fire its callback.
    pub fn acknowledge(&mut self, id: RecordId, metadata: RecordMetadata) -> Result<()> {
        let record = self.take_awaiting(id)?;
        tracing::trace!(
            "Record {} delivered to {}/{} at offset {}",
            id,
            record.message.topic,
            metadata.partition,
            metadata.offset
        );
        record.succeed(metadata);
        Ok(())
    }

    /// Settle a failed send.
    ///
    /// Returns `true` when the record went back to the front of its lane for
    /// another attempt, `false` when its callback fired with the failure.
    pub fn fail(&mut self, id: RecordId, error: Error) -> Result<bool> {
        let mut record = self.take_awaiting(id)?;

        if error.is_retriable() && record.attempt < self.retry.max_attempts {
            record.attempt += 1;
            let backoff = self.retry.backoff(record.attempt);
            record.retry_at = Some(Instant::now() + backoff);
            tracing::warn!(
                "Retrying record {} for {} (attempt {} in {:?}): {}",
                id,
                record.message.topic,
                record.attempt,
                backoff,
                error
            );
            let lane = record.lane();
            self.push_front(lane, record);
            return Ok(true);
        }

        tracing::error!(
            "Delivery of record {} to {} failed after {} attempts: {}",
            id,
            record.message.topic,
            record.attempt,
            error
        );
        record.give_up(error);
        Ok(false)
    }

    /// Put a drained record that was never attempted back at the front of its lane.
    pub fn release(&mut self, id: RecordId) -> Result<()> {
        let record = self.take_awaiting(id)?;
        let lane = record.lane();
        self.push_front(lane, record);
        Ok(())
    }

    /// Drop everything, failing each callback with [`Error::Closed`].
    ///
    /// Returns the dropped messages in enqueue order.
    pub fn abandon(&mut self) -> Vec<Message> {
        let mut records: Vec<DeliveryRecord> = self.awaiting.drain().map(|(_, r)| r).collect();
        for (_, lane) in self.lanes.drain() {
            records.extend(lane);
        }
        records.sort_by_key(|record| record.id);

        self.lane_order.clear();
        self.awaiting_per_lane.clear();
        self.pending = 0;

        if !records.is_empty() {
            tracing::warn!("Abandoning {} undelivered records", records.len());
        }
        records
            .into_iter()
            .map(|record| record.give_up(Error::Closed))
            .collect()
    }

    /// Earliest moment a lane held back by retry backoff becomes drainable.
    pub fn next_retry_at(&self) -> Option<Instant> {
        self.lanes
            .iter()
            .filter(|(lane, _)| self.awaiting_per_lane.get(*lane).copied().unwrap_or(0) == 0)
            .filter_map(|(_, queue)| queue.front().and_then(|head| head.retry_at))
            .min()
    }

    fn take_awaiting(&mut self, id: RecordId) -> Result<DeliveryRecord> {
        let record = self.awaiting.remove(&id).ok_or(Error::UnknownRecord(id))?;
        let lane = record.lane();
        if let Some(count) = self.awaiting_per_lane.get_mut(&lane) {
            *count -= 1;
            if *count == 0 {
                self.awaiting_per_lane.remove(&lane);
            }
        }
        Ok(record)
    }

    fn push_back(&mut self, lane: Lane, record: DeliveryRecord) {
        self.lane_mut(lane).push_back(record);
        self.pending += 1;
    }

    fn push_front(&mut self, lane: Lane, record: DeliveryRecord) {
        self.lane_mut(lane).push_front(record);
        self.pending += 1;
    }

    fn lane_mut(&mut self, lane: Lane) -> &mut VecDeque<DeliveryRecord> {
        if !self.lanes.contains_key(&lane) {
            self.lane_order.push_back(lane.clone());
        }
        self.lanes.entry(lane).or_default()
    }
}

/// Lazy sequence of records leaving a [`DeliveryBuffer`].
pub struct Drain<'a> {
    buffer: &'a mut DeliveryBuffer,
    lanes: VecDeque<Lane>,
    remaining: usize,
    now: Instant,
}

impl Iterator for Drain<'_> {
    type Item = OutboundRecord;

    fn next(&mut self) -> Option<Self::Item> {
        while self.remaining > 0 {
            let lane = self.lanes.front()?;
            let queue = match self.buffer.lanes.get_mut(lane) {
                Some(queue) => queue,
                None => {
                    self.lanes.pop_front();
                    continue;
                }
            };

            match queue.pop_front() {
                Some(record) if record.ready(self.now) => {
                    self.remaining -= 1;
                    self.buffer.pending -= 1;
                    *self
                        .buffer
                        .awaiting_per_lane
                        .entry(lane.clone())
                        .or_default() += 1;

                    let outbound = OutboundRecord {
                        id: record.id,
                        message: record.message.clone(),
                        attempt: record.attempt,
                        lane: lane.clone(),
                    };
                    self.buffer.awaiting.insert(record.id, record);
                    return Some(outbound);
                }
                Some(record) => {
                    // still backing off, leave the lane for a later drain
                    queue.push_front(record);
                    self.lanes.pop_front();
                }
                None => {
                    self.lanes.pop_front();
                }
            }
        }
        None
    }
}
