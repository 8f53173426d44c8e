//! Error types for the pulling engine and its collaborators.

use thiserror::Error;

use crate::actor::SendError;
use crate::types::{QualifiedStreamId, QueueId, SequenceToken, SubscriptionId};

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Crate-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Queue receiver error: {0}")]
    Receiver(#[from] ReceiverError),

    #[error("Queue cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Pub/sub error: {0}")]
    PubSub(#[from] PubSubError),

    #[error("Queue balancer error: {0}")]
    Balancer(#[from] BalancerError),

    #[error("Failed to create pulling agent for queue {queue}: {message}")]
    AgentCreation { queue: QueueId, message: String },

    #[error("Failed to initialize pulling agent for queue {queue}: {source}")]
    AgentInitialization {
        queue: QueueId,
        #[source]
        source: Box<Error>,
    },

    #[error("Unsupported provider command: {0}")]
    UnsupportedCommand(i32),

    #[error("Actor unavailable: {0}")]
    Actor(#[from] SendError),

    #[error("Actor dropped the reply for {0}")]
    NoReply(&'static str),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn agent_creation(queue: &QueueId, msg: impl Into<String>) -> Self {
        Self::AgentCreation {
            queue: queue.clone(),
            message: msg.into(),
        }
    }
}

/// Failure reported by a queue adapter or receiver.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ReceiverError(pub String);

impl ReceiverError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Failure reported by a queue cache or one of its cursors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// The requested position has already been purged from the cache.
    #[error("Data for token {requested} is no longer available (oldest retained {oldest:?})")]
    DataNotAvailable {
        requested: SequenceToken,
        oldest: Option<SequenceToken>,
    },

    #[error("{0}")]
    Other(String),
}

/// Failure reported by the pub/sub directory.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct PubSubError(pub String);

impl PubSubError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Failure reported by the queue balancer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct BalancerError(pub String);

impl BalancerError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Failure reported by a stream filter predicate.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct FilterError(pub String);

/// Failure of a call into a consumer handle.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsumerError {
    /// The consumer is permanently gone. Never retried.
    #[error("Consumer unavailable: {0}")]
    Unavailable(String),

    #[error("Consumer call failed: {0}")]
    Failed(String),
}

impl ConsumerError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, ConsumerError::Unavailable(_))
    }
}

/// Error surfaced to a consumer through `error_in_stream`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("Consumer for subscription {subscription} is unavailable: {message}")]
    ConsumerUnavailable {
        subscription: SubscriptionId,
        message: String,
    },

    #[error("Failed to deliver events of stream {stream} to subscription {subscription}: {message}")]
    DeliveryFailure {
        subscription: SubscriptionId,
        stream: QualifiedStreamId,
        message: String,
    },

    #[error("Failed to negotiate a start position for subscription {subscription}: {message}")]
    HandshakeFailure {
        subscription: SubscriptionId,
        message: String,
    },

    #[error("Stream data is not available: {0}")]
    DataNotAvailable(CacheError),

    #[error("Subscription {subscription} on stream {stream} has been faulted")]
    FaultedSubscription {
        subscription: SubscriptionId,
        stream: QualifiedStreamId,
    },
}

impl StreamError {
    pub fn is_consumer_unavailable(&self) -> bool {
        matches!(self, StreamError::ConsumerUnavailable { .. })
    }
}
