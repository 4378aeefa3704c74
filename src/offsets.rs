//! Per-partition consumer offset bookkeeping.

use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::message::TopicPartition;

/// Marker for "no offset yet".
pub const NO_OFFSET: i64 = -1;

/// Offsets for one topic partition.
///
/// Always `committed <= processed <= delivered`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PartitionOffsets {
    /// Highest offset handed to the caller.
    pub delivered: i64,
    /// Highest offset the caller marked as processed.
    pub processed: i64,
    /// Highest offset the broker confirmed as committed.
    pub committed: i64,
}

impl Default for PartitionOffsets {
    fn default() -> Self {
        Self {
            delivered: NO_OFFSET,
            processed: NO_OFFSET,
            committed: NO_OFFSET,
        }
    }
}

/// Tracks what has been delivered, processed and committed per partition.
///
/// Only the tracker mutates [`PartitionOffsets`]; everything else reads copies.
#[derive(Clone, Debug, Default)]
pub struct OffsetTracker {
    partitions: BTreeMap<TopicPartition, PartitionOffsets>,
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `offset` was handed to the caller.
    ///
    /// Offsets only move forward. A lower offset means the transport
    /// redelivered something old and is reported as [`Error::StaleOffset`].
    pub fn advance(&mut self, topic_partition: &TopicPartition, offset: i64) -> Result<()> {
        let entry = self.partitions.entry(topic_partition.clone()).or_default();

        if offset < entry.delivered {
            return Err(Error::StaleOffset {
                topic: topic_partition.0.clone(),
                partition: topic_partition.1,
                offset,
                delivered: entry.delivered,
            });
        }

        entry.delivered = offset;
        Ok(())
    }

    /// Record that the caller is done with everything up to `offset`.
    pub fn mark_processed(&mut self, topic_partition: &TopicPartition, offset: i64) -> Result<()> {
        let entry = self.partitions.get_mut(topic_partition).ok_or_else(|| {
            Error::IllegalState(format!(
                "Cannot mark {}/{} processed, nothing was delivered",
                topic_partition.0, topic_partition.1
            ))
        })?;

        if offset > entry.delivered {
            return Err(Error::IllegalState(format!(
                "Cannot mark offset {} of {}/{} processed, only {} was delivered",
                offset, topic_partition.0, topic_partition.1, entry.delivered
            )));
        }

        entry.processed = entry.processed.max(offset);
        Ok(())
    }

    /// Offsets that still need committing, ordered by topic partition.
    pub fn commit_snapshot(&self) -> Vec<(TopicPartition, i64)> {
        self.partitions
            .iter()
            .filter(|(_, offsets)| offsets.committed < offsets.processed)
            .map(|(topic_partition, offsets)| (topic_partition.clone(), offsets.processed))
            .collect()
    }

    /// Record that the broker accepted a commit.
    pub fn confirm_commit(&mut self, topic_partition: &TopicPartition, offset: i64) -> Result<()> {
        let entry = self.partitions.get_mut(topic_partition).ok_or_else(|| {
            Error::IllegalState(format!(
                "Cannot confirm commit for untracked {}/{}",
                topic_partition.0, topic_partition.1
            ))
        })?;

        if offset > entry.delivered {
            return Err(Error::IllegalState(format!(
                "Commit of offset {} for {}/{} is ahead of delivered {}",
                offset, topic_partition.0, topic_partition.1, entry.delivered
            )));
        }

        entry.committed = entry.committed.max(offset);
        // a confirmed commit implies the offset was processed
        entry.processed = entry.processed.max(entry.committed);
        Ok(())
    }

    pub fn get(&self, topic_partition: &TopicPartition) -> Option<PartitionOffsets> {
        self.partitions.get(topic_partition).copied()
    }

    pub fn snapshot(&self) -> BTreeMap<TopicPartition, PartitionOffsets> {
        self.partitions.clone()
    }

    /// Forget partitions of topics no longer subscribed.
    pub fn retain_topics(&mut self, topics: &[String]) {
        self.partitions
            .retain(|(topic, _), _| topics.iter().any(|t| t == topic));
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }
}
