//! # Samsa Delivery
//! At-least-once producer and consumer core for Kafka-style brokers.
//!
//! This crate holds the delivery logic of a message client and nothing of
//! the wire protocol. Producers buffer messages, retry transient failures
//! and report every outcome exactly once through a callback. Consumers hand
//! out records one by one and commit only offsets the application finished
//! processing, so a crash costs duplicates but never loses records.
//!
//! Talking to a broker is left to a [`BrokerTransport`](prelude::BrokerTransport).
//! An in-process [`InMemoryBroker`](prelude::InMemoryBroker) ships with the
//! crate for tests and demos.
//!
//! ## Table of contents
//! - [Getting started](#getting-started)
//!     - [Producer](#producer)
//!     - [Consumer](#consumer)
//! - [Resources](#resources)
//!
//!
//! ## Getting started
//! Include the following snippet in your `Cargo.toml` dependencies:
//! ```toml
//! samsa-delivery = "0.1"
//! ```
//!
//! ### Producer
//! A [`Producer`](prelude::Producer) queues messages in a bounded delivery
//! buffer. To instantiate one, start with a [`ProducerBuilder`](prelude::ProducerBuilder).
//!
//! Sending never waits on the broker. Deliveries progress, and callbacks
//! fire, while the caller is inside `poll`, `flush` or `close`.
//! ```rust,ignore
//! let broker = samsa_delivery::prelude::InMemoryBroker::new();
//! let config = samsa_delivery::prelude::ClientConfig::new(vec!["127.0.0.1:9092".parse()?]);
//! let topic_name = "my-topic";
//!
//! let mut producer = samsa_delivery::prelude::ProducerBuilder::new(
//!     broker.connect(&config).await?,
//!     vec![topic_name.to_string()],
//! )
//! .await?
//! .max_batch_size(2)
//! .clone()
//! .build()?;
//!
//! producer.send(
//!     topic_name,
//!     Some(bytes::Bytes::from_static(b"Tester")),
//!     "Value",
//!     |report| println!("{:?}", report),
//! )?;
//! producer.flush(1000).await?;
//! ```
//!
//! ### Consumer
//! A [`Consumer`](prelude::Consumer) fetches records for a group
//! subscription. To instantiate one, start with a [`ConsumerBuilder`](prelude::ConsumerBuilder).
//! ```rust,ignore
//! let mut consumer = samsa_delivery::prelude::ConsumerBuilder::new(
//!     broker.connect(&config).await?,
//!     "my-group",
//! )
//! .topics(vec![topic_name.to_string()])
//! .clone()
//! .build()
//! .await?;
//!
//! while let Some(event) = consumer.poll(1000).await? {
//!     println!("{:?}", event);
//! }
//! consumer.close(5000).await?;
//! ```
//!
//! Consumers can also be turned into a stream with `into_stream`.
//!
//!
//! ## Resources
//! - [Kafka Protocol Spec](https://kafka.apache.org/protocol.html)
//! - [Kafka consumer offset management](https://kafka.apache.org/documentation/#design_consumerposition)

mod buffer;
mod config;
mod consumer;
mod consumer_builder;
mod error;
mod message;
mod network;
mod offsets;
mod partitioner;
mod producer;
mod producer_builder;
mod utils;

const DEFAULT_CLIENT_ID: &str = "samsa-delivery";

pub mod prelude {
    //! Main export of various structures and methods
    //!
    //! We break the library into three main sections:
    //! - [Producing](#producing)
    //! - [Consuming](#consuming)
    //! - [Transports](#transports)
    //!
    //! # Producing
    //!
    //! The [`Producer`] owns a [`DeliveryBuffer`] that holds every message
    //! until its [`DeliveryCallback`] has fired. Messages for one topic
    //! partition are delivered and reported in the order they were sent,
    //! retries included. The [`Partitioner`] picks a partition for keyed
    //! messages with the same [`murmur2`] hash Kafka clients use.
    //!
    //! # Consuming
    //!
    //! The [`Consumer`] keeps an [`OffsetTracker`] with the delivered,
    //! processed and committed offset of every topic partition, see
    //! [`PartitionOffsets`]. Commits go out with [`CommitMode::Sync`] or
    //! [`CommitMode::Async`], or automatically in the background.
    //!
    //! # Transports
    //!
    //! Anything implementing [`BrokerTransport`] can carry the traffic.
    //! [`InMemoryBroker`] hands out [`MemoryConnection`]s to a broker living
    //! inside the process, with partition logs, group offsets and injectable
    //! faults.
    pub use crate::buffer::{
        DeliveryBuffer, DeliveryCallback, DeliveryRecord, Drain, OutboundRecord, RecordId,
        RetryPolicy,
    };
    pub use crate::config::{
        parse_brokers, ClientConfig, ConsumerConfig, OffsetReset, ProducerConfig,
    };
    pub use crate::consumer::{CommitMode, Consumer, ConsumerEvent, ConsumerState};
    pub use crate::consumer_builder::ConsumerBuilder;
    pub use crate::error::{Error, KafkaCode, Result, TransportError};
    pub use crate::message::{
        ConsumedRecord, DeliveryFailure, DeliveryReport, DeliveryResult, Message,
        RecordMetadata, TopicPartition,
    };
    pub use crate::network::memory::{InMemoryBroker, MemoryConnection};
    pub use crate::network::{BrokerAddress, BrokerTransport};
    pub use crate::offsets::{OffsetTracker, PartitionOffsets, NO_OFFSET};
    pub use crate::partitioner::{murmur2, Partitioner, TopicMetadata};
    pub use crate::producer::Producer;
    pub use crate::producer_builder::ProducerBuilder;
    pub use crate::utils::now;

    pub use bytes;
}
