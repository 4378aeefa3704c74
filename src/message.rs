//! Values that travel through the producer and consumer.

use bytes::Bytes;

use crate::error::Error;

/// Topic name and partition index.
pub type TopicPartition = (String, i32);

/// Outbound message.
///
/// Created by the caller and owned by the delivery buffer until its delivery
/// callback has fired.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    pub topic: String,
    pub key: Option<Bytes>,
    pub payload: Bytes,
    /// Target partition, or `None` to let the partitioner decide.
    pub partition: Option<i32>,
    /// Milliseconds since the epoch, or `None` to let the broker stamp it.
    pub timestamp: Option<i64>,
}

impl Message {
    pub fn new(topic: impl Into<String>, key: Option<Bytes>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            key,
            payload: payload.into(),
            partition: None,
            timestamp: None,
        }
    }

    pub fn with_partition(mut self, partition: i32) -> Self {
        self.partition = Some(partition);
        self
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn len(&self) -> usize {
        self.payload.len() + self.key.as_ref().map_or(0, Bytes::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Record handed out by a transport on poll.
#[derive(Clone, Debug, PartialEq)]
pub struct ConsumedRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Bytes>,
    pub payload: Bytes,
    pub timestamp: i64,
}

impl ConsumedRecord {
    pub fn topic_partition(&self) -> TopicPartition {
        (self.topic.clone(), self.partition)
    }
}

/// Where the broker placed an accepted message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordMetadata {
    pub partition: i32,
    pub offset: i64,
}

/// Successful delivery, passed to the delivery callback.
#[derive(Clone, Debug, PartialEq)]
pub struct DeliveryReport {
    pub message: Message,
    pub partition: i32,
    pub offset: i64,
    /// Attempts it took, starting at 1.
    pub attempt: u32,
}

/// Terminal delivery failure, passed to the delivery callback.
#[derive(Clone, Debug, PartialEq)]
pub struct DeliveryFailure {
    pub message: Message,
    pub attempt: u32,
    pub error: Error,
}

pub type DeliveryResult = std::result::Result<DeliveryReport, DeliveryFailure>;
