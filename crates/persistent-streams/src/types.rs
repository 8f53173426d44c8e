//! Identifiers and tokens shared by the agent, the manager and the collaborator traits.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifies one partition of the persistent queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueueId {
    prefix: Arc<str>,
    number: u32,
}

impl QueueId {
    pub fn new(prefix: impl Into<Arc<str>>, number: u32) -> Self {
        Self {
            prefix: prefix.into(),
            number,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn number(&self) -> u32 {
        self.number
    }
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.prefix, self.number)
    }
}

/// Logical stream identity inside a provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamId {
    pub namespace: Arc<str>,
    pub key: Arc<str>,
}

impl StreamId {
    pub fn new(namespace: impl Into<Arc<str>>, key: impl Into<Arc<str>>) -> Self {
        Self {
            namespace: namespace.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.key)
    }
}

/// A [`StreamId`] namespaced by the provider that owns it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QualifiedStreamId {
    pub provider: Arc<str>,
    pub stream: StreamId,
}

impl QualifiedStreamId {
    pub fn new(provider: impl Into<Arc<str>>, stream: StreamId) -> Self {
        Self {
            provider: provider.into(),
            stream,
        }
    }
}

impl fmt::Display for QualifiedStreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider, self.stream)
    }
}

/// Last byte bit used to tag implicit (filter-derived) subscriptions.
const IMPLICIT_MARKER: u8 = 0x01;

/// Globally unique subscription identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    /// A fresh explicit subscription id.
    pub fn new_explicit() -> Self {
        Self::from_uuid(Uuid::new_v4(), false)
    }

    /// A fresh implicit subscription id.
    pub fn new_implicit() -> Self {
        Self::from_uuid(Uuid::new_v4(), true)
    }

    /// Tags `uuid` as implicit or explicit.
    pub fn from_uuid(uuid: Uuid, implicit: bool) -> Self {
        let mut bytes = *uuid.as_bytes();
        if implicit {
            bytes[15] |= IMPLICIT_MARKER;
        } else {
            bytes[15] &= !IMPLICIT_MARKER;
        }
        Self(Uuid::from_bytes(bytes))
    }

    pub fn is_implicit(&self) -> bool {
        self.0.as_bytes()[15] & IMPLICIT_MARKER != 0
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Position in a queue. Ordered by sequence number, then by event index
/// within the batch.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct SequenceToken {
    pub sequence_number: u64,
    pub event_index: u32,
}

impl SequenceToken {
    pub const fn new(sequence_number: u64, event_index: u32) -> Self {
        Self {
            sequence_number,
            event_index,
        }
    }
}

impl fmt::Display for SequenceToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}:{}]", self.sequence_number, self.event_index)
    }
}

/// Token exchanged with a consumer while negotiating a start position or
/// acknowledging a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HandshakeToken {
    /// The consumer wants delivery to start at this token (inclusive).
    Start(SequenceToken),
    /// The last token that was delivered to the consumer.
    Delivery(SequenceToken),
}

impl HandshakeToken {
    pub fn token(&self) -> SequenceToken {
        match self {
            HandshakeToken::Start(token) | HandshakeToken::Delivery(token) => *token,
        }
    }
}

impl fmt::Display for HandshakeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeToken::Start(token) => write!(f, "start{token}"),
            HandshakeToken::Delivery(token) => write!(f, "delivery{token}"),
        }
    }
}

/// Producer identity an agent registers with the pub/sub directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentId(Arc<str>);

impl AgentId {
    /// Builds the `{provider}_{n}_{queue}` identity of the `n`-th agent of a provider.
    pub fn new(provider: &str, n: u64, queue: &QueueId) -> Self {
        Self(format!("{provider}_{n}_{queue}").into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
