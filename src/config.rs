//! Immutable configuration handed to clients at construction.
//!
//! Values can be built in code or read from the environment with the
//! `from_env` constructors. The binaries load a `.env` file first, so the
//! same variables can live there:
//!
//! | Variable                | Meaning                                  |
//! |-------------------------|------------------------------------------|
//! | `KAFKA_BROKERS`         | comma separated `host:port` list         |
//! | `KAFKA_CLIENT_ID`       | client id reported to the broker         |
//! | `KAFKA_TOPIC`           | comma separated topic list               |
//! | `KAFKA_GROUP_ID`        | consumer group                           |
//! | `KAFKA_OFFSET_RESET`    | `earliest` or `latest`                   |
//! | `KAFKA_BUFFER_CAPACITY` | producer delivery buffer capacity        |

use std::env;
use std::str::FromStr;

use crate::buffer::RetryPolicy;
use crate::error::{Error, Result};
use crate::network::BrokerAddress;
use crate::DEFAULT_CLIENT_ID;

const KAFKA_BROKERS: &str = "KAFKA_BROKERS";
const KAFKA_CLIENT_ID: &str = "KAFKA_CLIENT_ID";
const KAFKA_TOPIC: &str = "KAFKA_TOPIC";
const KAFKA_GROUP_ID: &str = "KAFKA_GROUP_ID";
const KAFKA_OFFSET_RESET: &str = "KAFKA_OFFSET_RESET";
const KAFKA_BUFFER_CAPACITY: &str = "KAFKA_BUFFER_CAPACITY";

const DEFAULT_BUFFER_CAPACITY: usize = 100_000;
const DEFAULT_MAX_BATCH_SIZE: usize = 100;
const DEFAULT_AUTO_COMMIT_INTERVAL_MS: u64 = 5000;
const DEFAULT_COMMIT_RETRIES: u32 = 3;
const DEFAULT_COMMIT_RETRY_BACKOFF_MS: u64 = 100;

/// Connection settings shared by producers and consumers.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(
    feature = "config-serde",
    derive(serde_derive::Serialize, serde_derive::Deserialize)
)]
pub struct ClientConfig {
    pub bootstrap_servers: Vec<BrokerAddress>,
    pub client_id: String,
}

impl ClientConfig {
    pub fn new(bootstrap_servers: Vec<BrokerAddress>) -> Self {
        Self {
            bootstrap_servers,
            client_id: DEFAULT_CLIENT_ID.to_owned(),
        }
    }

    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    pub fn from_env() -> Result<Self> {
        let brokers = required_var(KAFKA_BROKERS)?;
        let bootstrap_servers = parse_brokers(&brokers)?;
        let client_id = env::var(KAFKA_CLIENT_ID).unwrap_or_else(|_| DEFAULT_CLIENT_ID.to_owned());
        Ok(Self {
            bootstrap_servers,
            client_id,
        })
    }
}

/// Parse a comma separated `host:port` list.
pub fn parse_brokers(brokers: &str) -> Result<Vec<BrokerAddress>> {
    let addresses = brokers
        .split(',')
        .map(str::trim)
        .filter(|addr| !addr.is_empty())
        .map(BrokerAddress::from_str)
        .collect::<Result<Vec<_>>>()?;

    if addresses.is_empty() {
        return Err(Error::Config("no broker addresses given".to_owned()));
    }
    Ok(addresses)
}

/// Producer tuning.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(
    feature = "config-serde",
    derive(serde_derive::Serialize, serde_derive::Deserialize)
)]
pub struct ProducerConfig {
    /// Records the delivery buffer may hold before `send` fails with `BufferFull`.
    pub buffer_capacity: usize,
    /// Records handed to the transport per dispatch.
    pub max_batch_size: usize,
    pub retry: RetryPolicy,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            retry: RetryPolicy::default(),
        }
    }
}

impl ProducerConfig {
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(capacity) = optional_var(KAFKA_BUFFER_CAPACITY) {
            config.buffer_capacity = capacity.parse().map_err(|_| {
                Error::Config(format!("{} must be a number, got {}", KAFKA_BUFFER_CAPACITY, capacity))
            })?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.buffer_capacity == 0 {
            return Err(Error::Config("buffer capacity must be positive".to_owned()));
        }
        if self.max_batch_size == 0 {
            return Err(Error::Config("max batch size must be positive".to_owned()));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::Config("max attempts must be at least 1".to_owned()));
        }
        Ok(())
    }
}

/// Where a consumer starts when its group has no committed offset.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(
    feature = "config-serde",
    derive(serde_derive::Serialize, serde_derive::Deserialize)
)]
pub enum OffsetReset {
    Earliest,
    #[default]
    Latest,
}

impl FromStr for OffsetReset {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "earliest" | "smallest" => Ok(OffsetReset::Earliest),
            "latest" | "largest" => Ok(OffsetReset::Latest),
            other => Err(Error::Config(format!(
                "offset reset must be earliest or latest, got {}",
                other
            ))),
        }
    }
}

/// Consumer settings.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(
    feature = "config-serde",
    derive(serde_derive::Serialize, serde_derive::Deserialize)
)]
pub struct ConsumerConfig {
    pub group_id: String,
    /// Topics to subscribe to when the consumer is built. May be empty.
    pub topics: Vec<String>,
    pub offset_reset: OffsetReset,
    pub enable_auto_commit: bool,
    pub auto_commit_interval_ms: u64,
    /// Retries for a commit failing with a retriable error.
    pub commit_retries: u32,
    pub commit_retry_backoff_ms: u64,
}

impl ConsumerConfig {
    pub fn new(group_id: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            topics: vec![],
            offset_reset: OffsetReset::default(),
            enable_auto_commit: true,
            auto_commit_interval_ms: DEFAULT_AUTO_COMMIT_INTERVAL_MS,
            commit_retries: DEFAULT_COMMIT_RETRIES,
            commit_retry_backoff_ms: DEFAULT_COMMIT_RETRY_BACKOFF_MS,
        }
    }

    pub fn from_env() -> Result<Self> {
        let mut config = Self::new(required_var(KAFKA_GROUP_ID)?);
        if let Some(topics) = optional_var(KAFKA_TOPIC) {
            config.topics = topics
                .split(',')
                .map(str::trim)
                .filter(|topic| !topic.is_empty())
                .map(str::to_owned)
                .collect();
        }
        if let Some(reset) = optional_var(KAFKA_OFFSET_RESET) {
            config.offset_reset = reset.parse()?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.group_id.trim().is_empty() {
            return Err(Error::Config("group id must not be empty".to_owned()));
        }
        Ok(())
    }
}

fn required_var(name: &str) -> Result<String> {
    env::var(name).map_err(|_| Error::Config(format!("{} is not set", name)))
}

fn optional_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn it_parses_broker_lists() {
        let brokers = parse_brokers("127.0.0.1:9092, kafka-1:9093,").unwrap();
        assert_eq!(
            brokers,
            vec![
                BrokerAddress {
                    host: "127.0.0.1".to_owned(),
                    port: 9092
                },
                BrokerAddress {
                    host: "kafka-1".to_owned(),
                    port: 9093
                },
            ]
        );

        assert!(parse_brokers("").is_err());
        assert!(parse_brokers("no-port").is_err());
        assert!(parse_brokers("host:notaport").is_err());
    }

    #[test]
    fn it_parses_offset_reset() {
        assert_eq!("earliest".parse::<OffsetReset>().unwrap(), OffsetReset::Earliest);
        assert_eq!("LATEST".parse::<OffsetReset>().unwrap(), OffsetReset::Latest);
        assert!("middle".parse::<OffsetReset>().is_err());
    }

    #[test]
    fn it_rejects_degenerate_producer_settings() {
        assert!(ProducerConfig::default().validate().is_ok());
        let config = ProducerConfig {
            buffer_capacity: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn consumer_defaults() {
        let config = ConsumerConfig::new("mygroup");
        assert_eq!(config.offset_reset, OffsetReset::Latest);
        assert!(config.enable_auto_commit);
        assert_eq!(config.auto_commit_interval_ms, 5000);
        assert!(ConsumerConfig::new(" ").validate().is_err());
    }
}
