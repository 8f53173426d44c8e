//! Handle for talking to a pulling agent.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use super::messages::{AgentMessage, AgentSnapshot};
use crate::actor::ActorHandle;
use crate::error::{Error, Result};
use crate::provider::StreamConsumer;
use crate::types::{QualifiedStreamId, QueueId, SubscriptionId};

/// Cloneable handle to a [`PullingAgent`](super::PullingAgent).
#[derive(Clone)]
pub struct AgentHandle {
    inner: ActorHandle<AgentMessage>,
    activation: Arc<Mutex<CancellationToken>>,
    queue_id: QueueId,
}

impl AgentHandle {
    pub(crate) fn new(
        inner: ActorHandle<AgentMessage>,
        activation: Arc<Mutex<CancellationToken>>,
        queue_id: QueueId,
    ) -> Self {
        Self {
            inner,
            activation,
            queue_id,
        }
    }

    pub fn queue_id(&self) -> &QueueId {
        &self.queue_id
    }

    /// Starts pumping the queue. Idempotent.
    pub async fn initialize(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.inner.send(AgentMessage::Initialize(tx)).await?;
        rx.await.map_err(|_| Error::NoReply("initialize"))?
    }

    /// Stops pumping and releases the queue. Idempotent.
    ///
    /// In-flight retries are cancelled before the request is queued.
    pub async fn shutdown(&self) -> Result<()> {
        self.activation.lock().cancel();
        let (tx, rx) = oneshot::channel();
        self.inner.send_priority(AgentMessage::Shutdown(tx)).await?;
        rx.await.map_err(|_| Error::NoReply("shutdown"))
    }

    pub async fn add_subscriber(
        &self,
        subscription_id: SubscriptionId,
        stream_id: QualifiedStreamId,
        consumer: Arc<dyn StreamConsumer>,
        filter_data: Option<String>,
    ) -> Result<()> {
        self.inner
            .send(AgentMessage::AddSubscriber {
                subscription_id,
                stream_id,
                consumer,
                filter_data,
            })
            .await
            .map_err(Error::from)
    }

    pub async fn remove_subscriber(
        &self,
        subscription_id: SubscriptionId,
        stream_id: QualifiedStreamId,
    ) -> Result<()> {
        self.inner
            .send(AgentMessage::RemoveSubscriber {
                subscription_id,
                stream_id,
            })
            .await
            .map_err(Error::from)
    }

    pub async fn state(&self) -> Result<AgentSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.inner.send(AgentMessage::GetState(tx)).await?;
        rx.await.map_err(|_| Error::NoReply("state"))
    }

    /// Ends the agent task. The agent shuts down first if it is running.
    pub fn terminate(&self) {
        self.inner.cancel();
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.is_cancelled() || self.inner.is_closed()
    }
}

impl std::fmt::Debug for AgentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentHandle")
            .field("queue_id", &self.queue_id)
            .field("uptime", &self.inner.metadata.uptime())
            .finish()
    }
}
