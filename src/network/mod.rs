//! Communication with a broker.
//!
//! # Network Module
//!
//! The delivery core never speaks a wire protocol itself. Everything that
//! crosses the network goes through a [`BrokerTransport`]: producing a
//! message, fetching the next record, committing offsets, and asking how
//! many partitions a topic has.
//!
//! A transport handle is cheap to clone. Clones share the underlying
//! connection but each one keeps its own consumer position, so a producer
//! and a consumer can be built from the same connection without stepping on
//! each other. The producer clones its handle once per outstanding batch.
//!
//! Failures are reported as [`Error::Transport`](crate::prelude::Error) with a
//! [`TransportError`](crate::prelude::TransportError) whose `retriable` flag
//! tells the producer and consumer whether retrying can help.
//!
//! [`memory`] contains a complete in-process broker used by the tests and the
//! demo binaries.

use std::fmt::{self, Debug};
use std::str::FromStr;

use async_trait::async_trait;

use crate::config::OffsetReset;
use crate::error::{Error, Result};
use crate::message::{ConsumedRecord, Message, RecordMetadata, TopicPartition};

pub mod memory;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "config-serde",
    derive(serde_derive::Serialize, serde_derive::Deserialize)
)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
}

impl FromStr for BrokerAddress {
    type Err = Error;

    fn from_str(addr: &str) -> Result<Self> {
        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| Error::Config(format!("broker address {} has no port", addr)))?;
        if host.is_empty() {
            return Err(Error::Config(format!("broker address {} has no host", addr)));
        }
        let port = port
            .parse()
            .map_err(|_| Error::Config(format!("broker address {} has a bad port", addr)))?;

        Ok(Self {
            host: host.to_owned(),
            port,
        })
    }
}

impl fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[async_trait]
pub trait BrokerTransport: Clone + Debug + Send + Sync + 'static {
    /// Produce one message and wait for the broker to accept it.
    async fn send(&mut self, message: &Message) -> Result<RecordMetadata>;

    /// Next record for the current subscription, waiting at most `timeout_ms`.
    async fn poll(&mut self, timeout_ms: u64) -> Result<Option<ConsumedRecord>>;

    /// Commit the offset of the last processed record per topic partition.
    ///
    /// A consumer of the same group resumes at `offset + 1`.
    async fn commit(&mut self, offsets: &[(TopicPartition, i64)]) -> Result<()>;

    /// Replace the subscription of this handle.
    async fn subscribe(
        &mut self,
        group_id: &str,
        topics: &[String],
        offset_reset: OffsetReset,
    ) -> Result<()>;

    /// Number of partitions of a topic.
    async fn partitions(&mut self, topic: &str) -> Result<i32>;

    async fn close(&mut self) -> Result<()>;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn it_parses_and_prints_addresses() {
        let addr: BrokerAddress = "localhost:9092".parse().unwrap();
        assert_eq!(addr.host, "localhost");
        assert_eq!(addr.port, 9092);
        assert_eq!(addr.to_string(), "localhost:9092");

        assert!(":9092".parse::<BrokerAddress>().is_err());
        assert!("localhost:99999".parse::<BrokerAddress>().is_err());
    }
}
