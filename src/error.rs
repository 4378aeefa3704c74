//! Errors raised by the delivery core.

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

use crate::buffer::RecordId;
use crate::message::Message;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum Error {
    /// The delivery buffer has no room; back off and try again.
    #[error("Delivery buffer is full ({capacity} records)")]
    BufferFull { capacity: usize },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Records were still outstanding when the flush deadline passed.
    #[error("Flush timed out with {pending} records outstanding")]
    FlushTimeout { pending: usize },

    #[error("Close timed out before the final commit finished")]
    CloseTimeout,

    /// The transport handed back an offset lower than one already delivered.
    #[error("Stale offset {offset} for {topic}/{partition}, already delivered {delivered}")]
    StaleOffset {
        topic: String,
        partition: i32,
        offset: i64,
        delivered: i64,
    },

    /// An operation was called in the wrong lifecycle state.
    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Client is closed")]
    Closed,

    /// Messages dropped by a forced close.
    #[error("{} messages undelivered on close", .0.len())]
    UndeliveredOnClose(Vec<Message>),

    #[error("No delivery record with id {0}")]
    UnknownRecord(RecordId),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// True when a caller (or the core itself) may retry the operation.
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::BufferFull { .. } => true,
            Error::Transport(err) => err.retriable,
            _ => false,
        }
    }
}

/// Failure reported by a broker transport.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
#[error("{code:?} (retriable: {retriable}) {message}")]
pub struct TransportError {
    pub code: KafkaCode,
    pub retriable: bool,
    pub message: String,
}

impl TransportError {
    /// Retriability follows the broker error code.
    pub fn new(code: KafkaCode, message: impl Into<String>) -> Self {
        Self {
            code,
            retriable: code.is_retriable(),
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(KafkaCode::BrokerNotAvailable, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            code: KafkaCode::Unknown,
            retriable: false,
            message: message.into(),
        }
    }
}

/// Broker error codes the delivery core reacts to.
///
/// Numbering follows the Kafka protocol so codes read off the wire can be
/// converted with [`KafkaCode::from`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, FromPrimitive)]
#[cfg_attr(
    feature = "config-serde",
    derive(serde_derive::Serialize, serde_derive::Deserialize)
)]
pub enum KafkaCode {
    Unknown = -1,
    None = 0,
    OffsetOutOfRange = 1,
    CorruptMessage = 2,
    UnknownTopicOrPartition = 3,
    InvalidFetchSize = 4,
    LeaderNotAvailable = 5,
    NotLeaderForPartition = 6,
    RequestTimedOut = 7,
    BrokerNotAvailable = 8,
    ReplicaNotAvailable = 9,
    MessageSizeTooLarge = 10,
    OffsetMetadataTooLarge = 12,
    NetworkException = 13,
    CoordinatorLoadInProgress = 14,
    CoordinatorNotAvailable = 15,
    NotCoordinator = 16,
    InvalidTopicException = 17,
    RecordListTooLarge = 18,
    NotEnoughReplicas = 19,
    NotEnoughReplicasAfterAppend = 20,
    InvalidRequiredAcks = 21,
    IllegalGeneration = 22,
    UnknownMemberId = 25,
    RebalanceInProgress = 27,
    InvalidCommitOffsetSize = 28,
    TopicAuthorizationFailed = 29,
    GroupAuthorizationFailed = 30,
}

impl KafkaCode {
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            KafkaCode::CorruptMessage
                | KafkaCode::UnknownTopicOrPartition
                | KafkaCode::LeaderNotAvailable
                | KafkaCode::NotLeaderForPartition
                | KafkaCode::RequestTimedOut
                | KafkaCode::BrokerNotAvailable
                | KafkaCode::ReplicaNotAvailable
                | KafkaCode::NetworkException
                | KafkaCode::CoordinatorLoadInProgress
                | KafkaCode::CoordinatorNotAvailable
                | KafkaCode::NotCoordinator
                | KafkaCode::NotEnoughReplicas
                | KafkaCode::NotEnoughReplicasAfterAppend
        )
    }
}

impl From<i16> for KafkaCode {
    fn from(code: i16) -> Self {
        KafkaCode::from_i16(code).unwrap_or(KafkaCode::Unknown)
    }
}
