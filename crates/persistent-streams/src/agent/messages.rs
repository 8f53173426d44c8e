//! Messages handled by the pulling agent actor.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::oneshot;

use crate::actor::AgentMetricsSnapshot;
use crate::batch::BatchContainer;
use crate::error::{ConsumerError, PubSubError, Result};
use crate::provider::{PubSubSubscriptionState, StreamConsumer};
use crate::types::{HandshakeToken, QualifiedStreamId, QueueId, SequenceToken, SubscriptionId};

/// Requests sent to an agent through its handle.
pub enum AgentMessage {
    Initialize(oneshot::Sender<Result<()>>),
    Shutdown(oneshot::Sender<()>),
    AddSubscriber {
        subscription_id: SubscriptionId,
        stream_id: QualifiedStreamId,
        consumer: Arc<dyn StreamConsumer>,
        filter_data: Option<String>,
    },
    RemoveSubscriber {
        subscription_id: SubscriptionId,
        stream_id: QualifiedStreamId,
    },
    GetState(oneshot::Sender<AgentSnapshot>),
}

impl std::fmt::Debug for AgentMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentMessage::Initialize(_) => f.write_str("Initialize"),
            AgentMessage::Shutdown(_) => f.write_str("Shutdown"),
            AgentMessage::AddSubscriber {
                subscription_id,
                stream_id,
                ..
            } => write!(f, "AddSubscriber({subscription_id}, {stream_id})"),
            AgentMessage::RemoveSubscriber {
                subscription_id,
                stream_id,
            } => write!(f, "RemoveSubscriber({subscription_id}, {stream_id})"),
            AgentMessage::GetState(_) => f.write_str("GetState"),
        }
    }
}

/// State of an agent as seen from outside.
#[derive(Debug, Clone, Serialize)]
pub struct AgentSnapshot {
    pub queue_id: QueueId,
    pub running: bool,
    pub stream_count: usize,
    pub consumer_count: usize,
    pub metrics: AgentMetricsSnapshot,
}

/// What triggered an Error Protocol run.
#[derive(Debug, Clone)]
pub(crate) enum ErrorOrigin {
    /// Start-position negotiation; the handshake resumes with these values.
    Handshake {
        requested: Option<HandshakeToken>,
        cache_token: Option<SequenceToken>,
    },
    /// A delivery or cursor read; the delivery loop resumes.
    Delivery,
}

/// Outcome of an Error Protocol run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ErrorVerdict {
    Continue,
    /// The subscription was faulted and must be dropped locally.
    Faulted,
    /// The consumer is gone and was unregistered.
    Unavailable,
}

/// Completion of work the agent spawned off its own task.
pub(crate) struct AgentEvent {
    /// Activation the work was started in.
    pub epoch: u64,
    pub stream_id: QualifiedStreamId,
    pub kind: AgentEventKind,
}

pub(crate) enum AgentEventKind {
    ProducerRegistered {
        first_token: SequenceToken,
        result: std::result::Result<Vec<PubSubSubscriptionState>, PubSubError>,
    },
    Handshake {
        subscription_id: SubscriptionId,
        generation: u64,
        cache_token: Option<SequenceToken>,
        result: std::result::Result<Option<HandshakeToken>, ConsumerError>,
    },
    Delivered {
        subscription_id: SubscriptionId,
        generation: u64,
        batch: Arc<dyn BatchContainer>,
        result: std::result::Result<Option<HandshakeToken>, ConsumerError>,
    },
    ErrorHandled {
        subscription_id: SubscriptionId,
        generation: u64,
        origin: ErrorOrigin,
        verdict: ErrorVerdict,
    },
}
