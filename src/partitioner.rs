//! Choosing a partition for messages that do not name one.

use std::collections::HashMap;

/// Known partition counts per topic.
pub type TopicMetadata = HashMap<String, i32>;

/// Keyed messages hash with murmur2 the way the Java client does, so keys
/// land on the same partitions regardless of which client produced them.
/// Keyless messages go round-robin per topic.
#[derive(Clone, Debug, Default)]
pub struct Partitioner {
    metadata: TopicMetadata,
    counters: HashMap<String, u32>,
}

impl Partitioner {
    pub fn new(metadata: TopicMetadata) -> Self {
        Self {
            metadata,
            counters: HashMap::new(),
        }
    }

    pub fn metadata(&self) -> &TopicMetadata {
        &self.metadata
    }

    /// Partition for a message, or `None` when the topic is unknown.
    pub fn partition(&mut self, topic: &str, key: Option<&[u8]>) -> Option<i32> {
        let count = *self.metadata.get(topic)?;
        if count <= 0 {
            return None;
        }

        let partition = match key {
            Some(key) => to_positive(murmur2(key)) % count as u32,
            None => {
                let counter = self.counters.entry(topic.to_owned()).or_default();
                let partition = *counter % count as u32;
                *counter = counter.wrapping_add(1);
                partition
            }
        };
        Some(partition as i32)
    }
}

fn to_positive(hash: i32) -> u32 {
    (hash & 0x7fff_ffff) as u32
}

/// 32 bit murmur2 with the seed used by Kafka's default partitioner.
pub fn murmur2(data: &[u8]) -> i32 {
    const SEED: u32 = 0x9747_b28c;
    const M: u32 = 0x5bd1_e995;
    const R: u32 = 24;

    let length = data.len();
    let mut h = SEED ^ length as u32;

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
        h ^= (tail[2] as u32) << 16;
    }
    if tail.len() >= 2 {
        h ^= (tail[1] as u32) << 8;
    }
    if !tail.is_empty() {
        h ^= tail[0] as u32;
        h = h.wrapping_mul(M);
    }

    h ^= h >> 13;
    h = h.wrapping_mul(M);
    h ^= h >> 15;

    h as i32
}
